//! Tracing initialization
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is the embedding application's choice. `init` wires the conventional
//! setup: env-filter seeded from `logging.level`, overridable with
//! `RUST_LOG`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// Safe to call once per process; later calls are ignored.
pub fn init(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
