/// Fire-and-forget instrumentation side channel.
///
/// The watcher reports lifecycle events here with no delivery contract;
/// sinks must be cheap and must not block. The default sink turns events
/// into structured log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    /// A launch attempt returned no process (1-based attempt number).
    LaunchFailed { attempt: u32 },
    /// A sequence exhausted its launch budget.
    GaveUp { attempts: u32 },
    /// A connection was established.
    Connected,
    /// A live connection signaled disposal.
    ConnectionLost,
    /// A connection-factory or observer error was isolated during a
    /// background sequence.
    SequenceError { detail: String },
    /// The watcher was torn down.
    Disposed,
}

pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, event: &WatcherEvent);
}

/// Default sink: structured `tracing` lines at debug level.
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn record(&self, event: &WatcherEvent) {
        match event {
            WatcherEvent::LaunchFailed { attempt } => {
                tracing::debug!(attempt, "telemetry: launch failed")
            }
            WatcherEvent::GaveUp { attempts } => {
                tracing::debug!(attempts, "telemetry: sequence gave up")
            }
            WatcherEvent::Connected => tracing::debug!("telemetry: connected"),
            WatcherEvent::ConnectionLost => tracing::debug!("telemetry: connection lost"),
            WatcherEvent::SequenceError { detail } => {
                tracing::debug!(%detail, "telemetry: sequence error isolated")
            }
            WatcherEvent::Disposed => tracing::debug!("telemetry: disposed"),
        }
    }
}
