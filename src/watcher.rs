//! Supervised connection watcher.
//!
//! Owns the full lifecycle of a single logical connection to a worker
//! process: launch the process, wrap it into a connection, tell the owner,
//! wait for the connection to die, and start over. Launch failures within
//! one sequence are bounded by the retry budget so a permanently broken
//! launcher cannot spin forever; successful-connection-then-reconnect
//! cycles are unbounded.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::retry::{LaunchDecision, RetryPolicy, RetrySettings};
use crate::telemetry::{LogSink, TelemetrySink, WatcherEvent};

/// Error type carried across the injected collaborator seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One independent attempt to start a worker process.
///
/// `None` means the launch failed; it is counted against the sequence's
/// retry budget, not surfaced as an error. The factory must tolerate being
/// called repeatedly.
#[async_trait]
pub trait ProcessFactory: Send + Sync + 'static {
    type Handle: Send + 'static;

    async fn launch(&self) -> Option<Self::Handle>;
}

/// Wraps a process handle into a connection. Synchronous; an `Err` is
/// treated as an unexpected failure per the watcher's sequence semantics,
/// not as a plain failed launch.
pub trait ConnectionFactory<H>: Send + Sync + 'static {
    type Conn: Connection;

    fn connect(&self, handle: H) -> Result<Self::Conn, BoxError>;
}

/// A live logical connection bound to one worker process.
///
/// Transport semantics are opaque to the watcher; all it needs is the
/// one-shot disposal hook and an idempotent teardown.
pub trait Connection: Send + Sync + 'static {
    /// Register a single-shot handler invoked when the connection is (or is
    /// about to be) disposed. Registering on an already-dead connection
    /// must invoke the handler immediately.
    fn on_will_dispose(&self, handler: Box<dyn FnOnce() + Send>);

    /// Idempotent teardown.
    fn dispose(&self);
}

/// Owner-supplied availability callback.
///
/// Called with `Some` when a connection is established and `None` when it
/// is lost, strictly alternating and never starting with `None`. An `Err`
/// propagates out of the initial `start()`; during background sequences it
/// is isolated and reported through telemetry.
///
/// The callback runs under the watcher's notification gate and must not
/// call `dispose()` on the watcher synchronously; spawn the disposal
/// instead.
pub type Observer<C> = Box<dyn Fn(Option<&Arc<C>>) -> Result<(), BoxError> + Send + Sync>;

/// Phase of the supervision loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Starting,
    Connected,
    GivenUp,
    Disposed,
}

/// How `start()` resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A connection was established; supervision continues in the
    /// background.
    Connected,
    /// The initial sequence exhausted its launch budget. The observer was
    /// never called.
    GaveUp,
}

#[derive(Debug)]
pub enum WatcherError {
    /// `start()` was called while a sequence was already in flight.
    AlreadyStarted,
    /// The watcher was disposed before or while starting.
    Disposed,
    /// The connection factory failed during the initial sequence.
    Connection(BoxError),
    /// The observer failed during the initial sequence.
    Observer(BoxError),
}

impl fmt::Display for WatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherError::AlreadyStarted => write!(f, "watcher already started"),
            WatcherError::Disposed => write!(f, "watcher disposed"),
            WatcherError::Connection(source) => {
                write!(f, "connection factory failed: {}", source)
            }
            WatcherError::Observer(source) => write!(f, "observer failed: {}", source),
        }
    }
}

impl std::error::Error for WatcherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatcherError::Connection(source) | WatcherError::Observer(source) => {
                let source: &(dyn std::error::Error + 'static) = source.as_ref();
                Some(source)
            }
            _ => None,
        }
    }
}

/// Locks ignoring poisoning; watcher state stays consistent because every
/// critical section is a plain field update.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Phase and current connection, mutated together under one lock so
/// disposal can never race a connection into a torn-down watcher.
struct StateCell<C> {
    phase: WatcherState,
    current: Option<Arc<C>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SequenceKind {
    /// Runs inline under `start()`; factory and observer errors propagate.
    Initial,
    /// Runs on the background supervision task; errors are isolated.
    Reconnect,
}

enum SequenceOutcome {
    /// Connected; the receiver fires when the connection signals disposal.
    Connected(oneshot::Receiver<()>),
    GaveUp,
    Disposed,
}

struct WatcherInner<F, G>
where
    F: ProcessFactory,
    G: ConnectionFactory<F::Handle>,
{
    processes: F,
    connections: G,
    observer: Observer<G::Conn>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
    settings: RetrySettings,
    cell: Mutex<StateCell<G::Conn>>,
    /// Notification gate: held across every observer invocation and taken
    /// by `dispose()` before it completes. A disposer either wins before a
    /// notification commits (suppressing it) or waits for the in-flight
    /// observer call to return. Lock order is `notify` then `cell`.
    notify: Mutex<()>,
    cancel: CancellationToken,
}

impl<F, G> WatcherInner<F, G>
where
    F: ProcessFactory,
    G: ConnectionFactory<F::Handle>,
{
    /// One launch sequence: repeated attempts until a connection exists,
    /// the budget runs out, or the watcher is disposed.
    async fn run_sequence(&self, kind: SequenceKind) -> Result<SequenceOutcome, WatcherError> {
        let mut policy = RetryPolicy::new(self.settings);

        loop {
            let attempt_started = self.clock.now();
            let launched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(SequenceOutcome::Disposed),
                handle = self.processes.launch() => handle,
            };

            let handle = match launched {
                Some(handle) => handle,
                None => {
                    let decision = policy.on_failure();
                    self.telemetry.record(&WatcherEvent::LaunchFailed {
                        attempt: policy.attempt(),
                    });
                    match decision {
                        LaunchDecision::Retry { attempt, delay } => {
                            warn!(
                                attempt,
                                max = self.settings.max_attempts,
                                delay_ms = delay.as_millis() as u64,
                                "worker launch failed, backing off before retry"
                            );
                            if !self.backoff(attempt_started, delay).await {
                                return Ok(SequenceOutcome::Disposed);
                            }
                        }
                        LaunchDecision::GiveUp => return Ok(self.give_up(policy.attempt())),
                    }
                    continue;
                }
            };

            if self.cancel.is_cancelled() {
                // The launch resolved while dispose() was racing it. The
                // handle owns its process and cleans up on drop.
                drop(handle);
                return Ok(SequenceOutcome::Disposed);
            }

            let conn = match self.connections.connect(handle) {
                Ok(conn) => Arc::new(conn),
                Err(source) => match kind {
                    SequenceKind::Initial => return Err(WatcherError::Connection(source)),
                    SequenceKind::Reconnect => {
                        warn!(error = %source, "connection factory failed during reconnect");
                        self.telemetry.record(&WatcherEvent::SequenceError {
                            detail: source.to_string(),
                        });
                        let decision = policy.on_failure();
                        match decision {
                            LaunchDecision::Retry { delay, .. } => {
                                if !self.backoff(attempt_started, delay).await {
                                    return Ok(SequenceOutcome::Disposed);
                                }
                                continue;
                            }
                            LaunchDecision::GiveUp => {
                                return Ok(self.give_up(policy.attempt()))
                            }
                        }
                    }
                },
            };

            let (lost_tx, lost_rx) = oneshot::channel();
            conn.on_will_dispose(Box::new(move || {
                let _ = lost_tx.send(());
            }));

            let notified = {
                let _gate = lock(&self.notify);
                {
                    let mut cell = lock(&self.cell);
                    if cell.phase == WatcherState::Disposed {
                        drop(cell);
                        // Disposal won the race; tear the fresh connection
                        // down instead of exposing it.
                        conn.dispose();
                        return Ok(SequenceOutcome::Disposed);
                    }
                    cell.phase = WatcherState::Connected;
                    cell.current = Some(conn.clone());
                }
                policy.reset();

                info!("worker connection established");
                self.telemetry.record(&WatcherEvent::Connected);

                (self.observer)(Some(&conn))
            };

            if let Err(source) = notified {
                match kind {
                    SequenceKind::Initial => {
                        self.dispose();
                        return Err(WatcherError::Observer(source));
                    }
                    SequenceKind::Reconnect => {
                        warn!(error = %source, "observer failed on reconnect notification");
                        self.telemetry.record(&WatcherEvent::SequenceError {
                            detail: source.to_string(),
                        });
                    }
                }
            }

            return Ok(SequenceOutcome::Connected(lost_rx));
        }
    }

    /// Wait out the backoff delay, measured from the start of the failed
    /// attempt so launch latency counts against the window. Returns false
    /// when disposal cancelled the wait.
    async fn backoff(&self, attempt_started: Instant, delay: Duration) -> bool {
        let elapsed = self.clock.now().saturating_duration_since(attempt_started);
        let wait = delay.saturating_sub(elapsed);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = self.clock.sleep(wait) => true,
        }
    }

    fn give_up(&self, attempts: u32) -> SequenceOutcome {
        {
            let mut cell = lock(&self.cell);
            if cell.phase != WatcherState::Disposed {
                cell.phase = WatcherState::GivenUp;
            }
        }
        error!(attempts, "could not start worker, giving up");
        self.telemetry.record(&WatcherEvent::GaveUp { attempts });
        SequenceOutcome::GaveUp
    }

    /// Background half of supervision: wait for the live connection to
    /// signal disposal, tell the observer, start a fresh sequence. Repeats
    /// for the life of the watcher.
    async fn supervise(self: Arc<Self>, mut lost: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = &mut lost => {}
            }

            {
                let _gate = lock(&self.notify);
                {
                    let mut cell = lock(&self.cell);
                    if cell.phase == WatcherState::Disposed {
                        return;
                    }
                    cell.phase = WatcherState::Starting;
                    cell.current = None;
                }

                info!("worker connection lost, starting a fresh launch sequence");
                self.telemetry.record(&WatcherEvent::ConnectionLost);

                if let Err(source) = (self.observer)(None) {
                    warn!(error = %source, "observer failed on connection-loss notification");
                    self.telemetry.record(&WatcherEvent::SequenceError {
                        detail: source.to_string(),
                    });
                }
            }

            match self.run_sequence(SequenceKind::Reconnect).await {
                Ok(SequenceOutcome::Connected(next)) => lost = next,
                Ok(SequenceOutcome::GaveUp) | Ok(SequenceOutcome::Disposed) => return,
                Err(source) => {
                    // Reconnect sequences isolate their errors internally.
                    error!(error = %source, "reconnect sequence aborted");
                    return;
                }
            }
        }
    }

    fn dispose(&self) {
        let conn = {
            // The gate makes disposal wait for any in-flight observer call;
            // once it is held no further notification can commit.
            let _gate = lock(&self.notify);
            let mut cell = lock(&self.cell);
            if cell.phase == WatcherState::Disposed {
                return;
            }
            cell.phase = WatcherState::Disposed;
            cell.current.take()
        };
        self.cancel.cancel();
        if let Some(conn) = conn {
            conn.dispose();
        }
        info!("connection watcher disposed");
        self.telemetry.record(&WatcherEvent::Disposed);
    }
}

/// Supervised connection watcher.
///
/// Construction performs no side effects; nothing is launched until
/// `start()`. Cloning yields another handle to the same watcher.
pub struct ConnectionWatcher<F, G>
where
    F: ProcessFactory,
    G: ConnectionFactory<F::Handle>,
{
    inner: Arc<WatcherInner<F, G>>,
}

impl<F, G> Clone for ConnectionWatcher<F, G>
where
    F: ProcessFactory,
    G: ConnectionFactory<F::Handle>,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F, G> ConnectionWatcher<F, G>
where
    F: ProcessFactory,
    G: ConnectionFactory<F::Handle>,
{
    pub fn new(
        processes: F,
        connections: G,
        observer: Observer<G::Conn>,
        clock: Arc<dyn Clock>,
        settings: RetrySettings,
    ) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                processes,
                connections,
                observer,
                clock,
                telemetry: Arc::new(LogSink),
                settings,
                cell: Mutex::new(StateCell {
                    phase: WatcherState::Idle,
                    current: None,
                }),
                notify: Mutex::new(()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Swap the telemetry sink. Only valid before `start()`, while no other
    /// handle to this watcher exists; misuse trips a debug assertion.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.telemetry = telemetry,
            None => debug_assert!(
                false,
                "telemetry sink must be swapped before the watcher is shared"
            ),
        }
        self
    }

    /// Begin supervision.
    ///
    /// Runs the initial launch sequence inline and resolves once a
    /// connection is established or the sequence gave up. On success the
    /// reconnect loop keeps running on a background task until the watcher
    /// gives up or is disposed. A second call is rejected.
    pub async fn start(&self) -> Result<StartOutcome, WatcherError> {
        {
            let mut cell = lock(&self.inner.cell);
            match cell.phase {
                WatcherState::Idle => cell.phase = WatcherState::Starting,
                WatcherState::Disposed => return Err(WatcherError::Disposed),
                _ => return Err(WatcherError::AlreadyStarted),
            }
        }

        match self.inner.run_sequence(SequenceKind::Initial).await {
            Ok(SequenceOutcome::Connected(lost)) => {
                tokio::spawn(self.inner.clone().supervise(lost));
                Ok(StartOutcome::Connected)
            }
            Ok(SequenceOutcome::GaveUp) => Ok(StartOutcome::GaveUp),
            Ok(SequenceOutcome::Disposed) => Err(WatcherError::Disposed),
            Err(source) => {
                self.inner.dispose();
                Err(source)
            }
        }
    }

    /// Terminal, idempotent teardown: dispose the live connection (if any),
    /// cancel pending launches and backoff waits, and silence the observer
    /// for good.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn state(&self) -> WatcherState {
        lock(&self.inner.cell).phase
    }
}
