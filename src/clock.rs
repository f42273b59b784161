use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

/// Monotonic time source injected into the watcher.
///
/// Backoff between launch attempts is computed and waited out entirely
/// through this trait, so tests can drive the retry loop without real
/// delays.
pub trait Clock: Send + Sync + 'static {
    /// Current monotonic timestamp.
    fn now(&self) -> Instant;

    /// Sleep for `duration`, yielding to other tasks meanwhile.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production clock backed by the tokio timer.
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}
