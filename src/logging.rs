//! Subscriber setup for programs and tests that embed the graph.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "relgraph=info";

/// Installs an `EnvFilter` driven `fmt` subscriber writing to stderr.
///
/// `RUST_LOG` overrides the default `relgraph=info` filter. Safe to call
/// any number of times; only the first call has an effect, and an already
/// installed global subscriber is left alone.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_tracing();
        init_tracing();
        tracing::info!(target: "relgraph", "subscriber installed");
    }
}
