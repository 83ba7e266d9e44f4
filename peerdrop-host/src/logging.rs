//! Tracing setup. Grounded on the text-format branch of the pack's
//! `backend/lib/src/log.rs` (`tracing_subscriber::registry().with(env_filter)
//! .with(fmt::layer())`), dropped down to just that branch since this daemon
//! has no HTTP surface to justify Bunyan/JSON log shipping.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a process-wide subscriber honoring `RUST_LOG`, defaulting to
/// `info` when unset.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
