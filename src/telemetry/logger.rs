//! Injected log sink.
//!
//! Managers log through a [`Logger`] rather than calling `tracing` directly,
//! so embedders can route reconciliation logs wherever they want.

/// Log sink used by managers
pub trait Logger: Send + Sync {
    fn debug(&self, msg: &str);
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);
}

/// Forwards to `tracing` events with target `nftsync::manager`.
///
/// Silent unless a subscriber is installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, msg: &str) {
        tracing::debug!(target: "nftsync::manager", "{msg}");
    }

    fn info(&self, msg: &str) {
        tracing::info!(target: "nftsync::manager", "{msg}");
    }

    fn warn(&self, msg: &str) {
        tracing::warn!(target: "nftsync::manager", "{msg}");
    }

    fn error(&self, msg: &str) {
        tracing::error!(target: "nftsync::manager", "{msg}");
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn debug(&self, _msg: &str) {}
    fn info(&self, _msg: &str) {}
    fn warn(&self, _msg: &str) {}
    fn error(&self, _msg: &str) {}
}
