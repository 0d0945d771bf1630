//! External GPU tenants: the inference and training runners.
//!
//! The node arbitrates one GPU owner at a time between the PoW engine and
//! two externally-launched services (the vLLM inference server and the
//! training loop). Their internals live outside this repository; here they
//! are plain child processes with liveness probing and a terminate/kill
//! stop path, which is all the tenancy logic needs.

use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{info, warn};

const TERMINATION_TIMEOUT: Duration = Duration::from_secs(20);

/// A long-running external process occupying the GPU.
pub struct ExternalRunner {
    name: &'static str,
    program: String,
    args: Vec<String>,
    child: Option<Child>,
}

impl ExternalRunner {
    pub fn new(name: &'static str, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name,
            program: program.into(),
            args,
            child: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Spawns the runner process. Fails if it is already running.
    pub fn start(&mut self) -> io::Result<()> {
        if self.is_running() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} runner is already running", self.name),
            ));
        }
        info!(runner = self.name, program = %self.program, "starting runner");
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.child = Some(child);
        Ok(())
    }

    /// True while the process exists and has not exited.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Stops the process, escalating to SIGKILL after the grace period.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            warn!(runner = self.name, "stop called but no process is running");
            return;
        };
        info!(runner = self.name, "stopping runner");
        let _ = child.start_kill();
        if timeout(TERMINATION_TIMEOUT, child.wait()).await.is_err() {
            warn!(runner = self.name, "termination timed out, waiting on kill");
            let _ = child.wait().await;
        }
        info!(runner = self.name, "runner stopped");
    }
}
