//! Opt-in tracing initialisation for binaries and tests embedding the core.
//!
//! The library itself only *emits* through `tracing`; wiring a subscriber is
//! the embedder's call. This helper installs the usual stack: an `EnvFilter`
//! driven by `RUST_LOG` (default `info`), a fmt layer, and `tracing-error`'s
//! span-trace layer for richer diagnostics.

use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the default subscriber stack. Safe to call more than once; later
/// calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(ErrorLayer::default())
        .try_init();
}
