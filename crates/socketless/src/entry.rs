//! Worker process entry point.
//!
//! A worker binary registers the modules it can host and hands control to
//! [`worker_main`]:
//!
//! ```no_run
//! use socketless::registry::AppRegistry;
//!
//! fn main() -> std::process::ExitCode {
//!     socketless::entry::worker_main(AppRegistry::new())
//! }
//! ```

use std::process::ExitCode;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::{AdapterError, AppKind};
use crate::diagnostics::DEFAULT_WATCHDOG_AFTER;
use crate::registry::{AppRegistry, Locator};
use crate::worker::{WorkerConfig, WorkerError, run_worker};

/// Upper bound on threads offloading blocking application calls.
pub const BLOCKING_THREADS_ENV: &str = "SOCKETLESS_BLOCKING_THREADS";
pub const DEFAULT_BLOCKING_THREADS: usize = 8;

const USAGE: &str = "\
Usage: socketless-worker --app <module:attr> [options]

Options:
  --app <module:attr>         Application to host (required)
  --reset-hook <module:attr>  Callable run on reset requests
  --app-kind <kind>           auto, async (asgi) or blocking (wsgi) [default: auto]
  --debug                     Verbose diagnostics on stderr
  -h, --help                  Print this help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    pub app: String,
    pub reset_hook: Option<String>,
    pub app_kind: AppKind,
    pub debug: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ArgsError {
    #[error("help requested")]
    Help,
    #[error("missing required argument: --app")]
    MissingApp,
    #[error("{0} requires a value")]
    MissingValue(String),
    #[error("unknown flag: {0}")]
    UnknownFlag(String),
    #[error("unexpected argument: {0}")]
    Unexpected(String),
    #[error(transparent)]
    AppKind(#[from] AdapterError),
}

/// Parse worker arguments. `args[0]` is the program name.
pub fn parse_args(args: &[String]) -> Result<WorkerArgs, ArgsError> {
    let mut app: Option<String> = None;
    let mut reset_hook: Option<String> = None;
    let mut app_kind = AppKind::Auto;
    let mut debug = false;

    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        let mut value = |flag: &str| {
            rest.next()
                .cloned()
                .ok_or_else(|| ArgsError::MissingValue(flag.to_string()))
        };
        match arg.as_str() {
            "--app" => app = Some(value("--app")?),
            "--reset-hook" => reset_hook = Some(value("--reset-hook")?),
            "--app-kind" => app_kind = value("--app-kind")?.parse()?,
            "--debug" => debug = true,
            "--help" | "-h" => return Err(ArgsError::Help),
            flag if flag.starts_with('-') => return Err(ArgsError::UnknownFlag(flag.to_string())),
            other => return Err(ArgsError::Unexpected(other.to_string())),
        }
    }

    Ok(WorkerArgs {
        app: app.ok_or(ArgsError::MissingApp)?,
        reset_hook,
        app_kind,
        debug,
    })
}

/// Filter used when `RUST_LOG` is unset.
fn default_directives(debug: bool, socketless_log: Option<&str>) -> String {
    let level = if debug {
        "debug"
    } else {
        match socketless_log {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("error") => "error",
            _ => "warn",
        }
    };
    format!("warn,socketless={level},socketless_apps={level},socketless_worker={level}")
}

/// Install the worker's subscriber. Always writes to stderr: stdout carries the protocol.
///
/// `--debug` wins over `RUST_LOG`, which wins over `SOCKETLESS_LOG`.
pub fn init_tracing(debug: bool) {
    let filter = if !debug && std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let socketless_log = std::env::var("SOCKETLESS_LOG").ok();
        EnvFilter::new(default_directives(debug, socketless_log.as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(false).with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn blocking_threads(raw: Option<&str>) -> usize {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_BLOCKING_THREADS)
}

/// Parse arguments, set up tracing, then run the worker until stdin closes.
///
/// Exit codes: 0 on clean EOF, 1 on startup or protocol failure, 2 on bad arguments.
pub fn worker_main(registry: AppRegistry) -> ExitCode {
    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(ArgsError::Help) => {
            eprintln!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!();
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    init_tracing(args.debug);

    let threads = blocking_threads(std::env::var(BLOCKING_THREADS_ENV).ok().as_deref());
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .max_blocking_threads(threads)
        .thread_name("socketless-worker")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to build runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(args, &registry)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker failed");
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: WorkerArgs, registry: &AppRegistry) -> Result<(), WorkerError> {
    tracing::debug!(app = %args.app, reset_hook = ?args.reset_hook, "Importing application");
    let app = Locator::parse(&args.app)?;
    let reset_hook = args
        .reset_hook
        .as_deref()
        .map(Locator::parse)
        .transpose()?;
    let resolved = registry.resolve(&app, reset_hook.as_ref())?;

    let config = WorkerConfig {
        app_kind: args.app_kind,
        watchdog_after: DEFAULT_WATCHDOG_AFTER,
    };
    run_worker(resolved, config).await
}
