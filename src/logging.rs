//! Process-wide tracing setup, initialised once per binary.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. Safe to call more than once; only the
/// first call has an effect. `RUST_LOG` overrides the default `info` filter.
pub fn init() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    });
}
