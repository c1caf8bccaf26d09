//! Sample applications for the socketless worker.
//!
//! Each module exports `app` and a `reset_state` hook that share one instance of the
//! module's state, so `--app sample:app --reset-hook sample:reset_state` resets the
//! very store the application serves from.

use socketless::registry::AppRegistry;

pub mod blocking;
pub mod concurrency;
pub mod faulty;
pub mod sample;

/// Every module the `socketless-worker` binary can host.
pub fn registry() -> AppRegistry {
    AppRegistry::new()
        .module("sample", sample::module)
        .module("concurrency", concurrency::module)
        .module("blocking", blocking::module)
        .module("faulty", faulty::module)
}
