use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// verbosity flag. Safe to call more than once; later calls are ignored.
pub fn init_logging(verbose: bool) {
    let default_directive = if verbose {
        "probe_pilot=debug"
    } else {
        "probe_pilot=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .try_init();
}
