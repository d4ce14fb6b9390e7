use std::time::Instant;

/// Monotonic "now" on tokio's clock.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}
