//! IPC bridge for supervisor-worker communication.
//!
//! This module provides the wire protocol and codec for communication between
//! the supervisor (parent) and the worker subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Message types (WireRequest/Response, ControlMessage/Reply)
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
