//! Log output for the CLI. The report goes to stdout, logs go to stderr.

use std::io;

use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Install the global subscriber. `RUST_LOG` wins over `--verbose`.
pub(crate) fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_writer(io::stderr)
                .with_filter(env_filter),
        )
        .try_init();
}
