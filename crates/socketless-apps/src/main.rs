//! `socketless-worker`: hosts one of the sample applications over stdin/stdout.

use std::process::ExitCode;

fn main() -> ExitCode {
    socketless::entry::worker_main(socketless_apps::registry())
}
