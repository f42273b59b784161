//! Production connection over a spawned worker process.
//!
//! The transport itself is opaque to the supervisor; what matters here is
//! the lifecycle: a monitor task notices when the worker exits, and
//! `dispose()` kills the worker's whole process group. Either way the
//! registered disposal handler fires exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;

use crate::process::WorkerProcess;
use crate::watcher::{BoxError, Connection, ConnectionFactory};

type DisposeHandler = Box<dyn FnOnce() + Send>;

/// Connection bound to one worker process.
pub struct WorkerConnection {
    pid: u32,
    kill: CancellationToken,
    handler: Arc<Mutex<Option<DisposeHandler>>>,
    down: Arc<AtomicBool>,
}

impl WorkerConnection {
    pub fn new(worker: WorkerProcess) -> Self {
        let pid = worker.pid;
        let kill = CancellationToken::new();
        let handler: Arc<Mutex<Option<DisposeHandler>>> = Arc::new(Mutex::new(None));
        let down = Arc::new(AtomicBool::new(false));

        tokio::spawn(monitor(
            worker,
            kill.clone(),
            handler.clone(),
            down.clone(),
        ));

        Self {
            pid,
            kill,
            handler,
            down,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Connection for WorkerConnection {
    fn on_will_dispose(&self, handler: DisposeHandler) {
        if self.down.load(Ordering::SeqCst) {
            handler();
            return;
        }
        let mut slot = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // The worker may have died between the check and taking the lock.
        if self.down.load(Ordering::SeqCst) {
            drop(slot);
            handler();
            return;
        }
        *slot = Some(handler);
    }

    fn dispose(&self) {
        self.kill.cancel();
    }
}

impl Drop for WorkerConnection {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// Waits for the worker to exit, or for `dispose()` to request teardown,
/// then fires the one-shot disposal handler.
async fn monitor(
    worker: WorkerProcess,
    kill: CancellationToken,
    handler: Arc<Mutex<Option<DisposeHandler>>>,
    down: Arc<AtomicBool>,
) {
    let WorkerProcess { mut child, pid } = worker;

    tokio::select! {
        _ = kill.cancelled() => {
            terminate_group(pid);
            let _ = child.start_kill();
            let _ = child.wait().await;
            tracing::info!(pid, "worker process terminated");
        }
        status = child.wait() => {
            match status {
                Ok(status) => {
                    tracing::info!(pid, code = ?status.code(), "worker process exited")
                }
                Err(err) => {
                    tracing::warn!(pid, error = %err, "failed waiting on worker process")
                }
            }
        }
    }

    down.store(true, Ordering::SeqCst);
    let fired = handler
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(handler) = fired {
        handler();
    }
}

/// Kill the worker's whole process group; workers may fork helpers that
/// would otherwise outlive them.
fn terminate_group(pid: u32) {
    if pid == 0 {
        return;
    }
    if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::debug!(pid, error = %err, "process group kill failed, group likely gone");
    }
}

/// Production connection factory.
pub struct WorkerConnector;

impl ConnectionFactory<WorkerProcess> for WorkerConnector {
    type Conn = WorkerConnection;

    fn connect(&self, handle: WorkerProcess) -> Result<WorkerConnection, BoxError> {
        Ok(WorkerConnection::new(handle))
    }
}
