//! Production process factory: spawns the configured worker command.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::watcher::ProcessFactory;

/// Command line for the supervised worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub command: String,
    pub args: Vec<String>,
}

/// Handle to one spawned worker process.
///
/// Owns the child; `kill_on_drop` means a handle discarded before it is
/// wrapped into a connection takes its process with it.
pub struct WorkerProcess {
    pub child: Child,
    pub pid: u32,
}

pub struct WorkerLauncher {
    spec: WorkerSpec,
}

impl WorkerLauncher {
    pub fn new(spec: WorkerSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl ProcessFactory for WorkerLauncher {
    type Handle = WorkerProcess;

    /// One launch attempt. Spawn failure is an expected, retryable outcome
    /// and maps to `None`; it is logged, not raised.
    async fn launch(&self) -> Option<WorkerProcess> {
        let mut command = Command::new(&self.spec.command);
        command
            .args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0) // own group so teardown can take the worker's children with it
            .kill_on_drop(true);

        match command.spawn() {
            Ok(child) => {
                let pid = child.id().unwrap_or(0);
                tracing::info!(pid, command = %self.spec.command, "worker process started");
                Some(WorkerProcess { child, pid })
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    command = %self.spec.command,
                    "failed to spawn worker process"
                );
                None
            }
        }
    }
}
