//! Line-framed codec for worker communication.
//!
//! Uses LinesCodec for framing + serde_json for serialization: one JSON document per
//! `\n`-terminated line. Works over any AsyncRead/AsyncWrite (pipes, duplex streams, etc).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::MAX_BODY_BYTES;

/// Longest line either side will buffer.
///
/// Generous enough that an oversized body (base64 grows it by a third) still reaches
/// the worker and gets a proper 413 instead of tearing down the channel.
pub const MAX_LINE_BYTES: usize = 32 * 1024 * 1024;

const _: () = assert!(MAX_LINE_BYTES > MAX_BODY_BYTES * 2);

fn lines_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::MaxLineLengthExceeded => io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {MAX_LINE_BYTES} bytes"),
        ),
        LinesCodecError::Io(e) => e,
    }
}

/// Raw line framing with the protocol's length cap. Blank lines are skipped.
///
/// The supervisor reads raw lines so it can quote unparseable output in errors.
pub struct LineCodec {
    inner: LinesCodec,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.inner.decode(src).map_err(lines_error)? {
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.inner.decode_eof(src).map_err(lines_error)? {
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }
}

/// Codec that frames messages by newline and serializes with JSON.
///
/// Wraps [`LineCodec`] and adds serde_json serialization.
pub struct JsonLinesCodec<T> {
    inner: LineCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LineCodec::new(),
            _phantom: PhantomData,
        }
    }
}

fn parse<T: DeserializeOwned>(line: &str) -> io::Result<T> {
    serde_json::from_str(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(line) => parse(&line).map(Some),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode_eof(src)? {
            Some(line) => parse(&line).map(Some),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // serde_json escapes control characters inside strings, so the compact form
        // never contains a raw newline.
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding line");
        if json_len > 1024 * 1024 {
            tracing::debug!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large line being encoded"
            );
        }
        dst.reserve(json_len + 1);
        dst.extend_from_slice(json.as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{
        ControlMessage, ControlReply, ResetStatus, WireRequest, WorkerInbound, WorkerOutbound,
    };

    #[test]
    fn encodes_exactly_one_line() {
        let mut codec = JsonLinesCodec::<WorkerInbound>::new();
        let mut buf = BytesMut::new();

        let req = WireRequest::new("a", "POST", "/echo").with_body(b"line1\nline2".to_vec());
        codec.encode(WorkerInbound::Request(req), &mut buf).unwrap();

        let newlines = buf.iter().filter(|b| **b == b'\n').count();
        assert_eq!(newlines, 1);
        assert_eq!(buf.last(), Some(&b'\n'));
    }

    #[test]
    fn decodes_control_and_request_lines() {
        let mut codec = JsonLinesCodec::<WorkerInbound>::new();
        let mut buf = BytesMut::from(
            &b"{\"type\":\"reset\"}\n{\"id\":\"1\",\"method\":\"GET\",\"url\":\"/ping\",\"headers\":[]}\n"[..],
        );

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, WorkerInbound::Control(ControlMessage::Reset));

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(second, WorkerInbound::Request(r) if r.method == "GET"));

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn waits_for_complete_line() {
        let mut codec = JsonLinesCodec::<WorkerOutbound>::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"reset\",\"sta"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"tus\":\"ok\"}\n");
        let reply = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            reply,
            WorkerOutbound::Control(ControlReply::Reset {
                status: ResetStatus::Ok
            })
        );
    }

    #[test]
    fn skips_blank_lines() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"\n  \r\n{\"type\":\"reset\"}\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{\"type\":\"reset\"}"));
    }

    #[test]
    fn final_line_without_newline_is_decoded_at_eof() {
        let mut codec = JsonLinesCodec::<WorkerInbound>::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"reset\"}"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let msg = codec.decode_eof(&mut buf).unwrap();
        assert_eq!(msg, Some(WorkerInbound::Control(ControlMessage::Reset)));
    }

    #[test]
    fn malformed_json_is_invalid_data() {
        let mut codec = JsonLinesCodec::<WorkerInbound>::new();
        let mut buf = BytesMut::from(&b"not json\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
