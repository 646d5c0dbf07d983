//! Log setup for `katago-preflight`.
//!
//! Diagnostics (stage transitions, poll progress, forwarded server output)
//! go through `tracing` to stderr. Stdout is reserved for the run report, so
//! piping the report to a file never captures log lines.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber for a preflight run.
///
/// `level` applies when `RUST_LOG` is unset (`-v` selects `DEBUG`, which
/// includes the server's own output). With `json`, every log line is a JSON
/// object for CI log collectors. Returns `false` when a subscriber was
/// already installed, as happens across tests in one process.
pub fn init_tracing(json: bool, level: Level) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let installed = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer.json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init()
    };
    installed.is_ok()
}
