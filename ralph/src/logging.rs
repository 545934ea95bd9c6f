//! Development-time tracing.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. It is separate from
//! the operator status lines the binary prints and from the iteration
//! artifacts under the runtime directory, which are always written.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=ralph=debug ralph run --agent-cmd 'agent {prompt_file}'
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
