//! Launches and supervises the two NetShield processes from one entry
//! point, for deployments that would rather run `netshield` once than
//! manage `netshield-interceptor`/`netshield-analyzer` themselves.
//!
//! Grounded on the teacher's `commands::system` functions, which shell out
//! via `std::process::Command` and map failures through the crate's error
//! type rather than unwrapping; generalized here to `tokio::process::Command`
//! so the supervisor can wait on both children and a Ctrl-C signal
//! concurrently without blocking a thread per child.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::error::NetShieldError;

/// Owns the interceptor and analyzer child processes. Each binary re-reads
/// configuration from the environment itself (spec.md §6); the supervisor
/// only decides when to start and stop them.
pub struct Supervisor {
    interceptor: Child,
    analyzer: Child,
}

impl Supervisor {
    /// Spawns both child processes, found next to the running `netshield`
    /// executable. Fails fast (`PeerUnavailable`) if either binary cannot
    /// be found or started, mirroring the interceptor/analyzer's own
    /// startup-surfaces-errors-directly rule (spec.md §7).
    pub fn spawn() -> Result<Self, NetShieldError> {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        let interceptor = spawn_child(&exe_dir, "netshield-interceptor")?;
        let analyzer = spawn_child(&exe_dir, "netshield-analyzer")?;
        Ok(Supervisor { interceptor, analyzer })
    }

    /// Blocks until Ctrl-C or either child exits on its own, then stops
    /// whichever is still running. Mirrors spec.md §5's single shutdown
    /// boolean observed by every long-lived loop — here realized as "stop
    /// everything the moment any one signal fires."
    pub async fn run_until_shutdown(mut self) -> Result<(), NetShieldError> {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, stopping child processes");
            }
            status = self.interceptor.wait() => {
                warn!(?status, "interceptor process exited unexpectedly, stopping analyzer");
            }
            status = self.analyzer.wait() => {
                warn!(?status, "analyzer process exited unexpectedly, stopping interceptor");
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Sends each still-running child a kill and reaps it. A child that
    /// already exited on its own is a no-op.
    async fn shutdown(&mut self) {
        kill_and_reap("interceptor", &mut self.interceptor).await;
        kill_and_reap("analyzer", &mut self.analyzer).await;
    }
}

async fn kill_and_reap(name: &str, child: &mut Child) {
    if child.id().is_none() {
        return; // already reaped
    }
    if let Err(e) = child.start_kill() {
        warn!(child = name, error = %e, "failed to signal child process");
        return;
    }
    match child.wait().await {
        Ok(status) => info!(child = name, %status, "child process stopped"),
        Err(e) => error!(child = name, error = %e, "error waiting on child process"),
    }
}

fn spawn_child(exe_dir: &Path, name: &str) -> Result<Child, NetShieldError> {
    let path = exe_dir.join(if cfg!(windows) { format!("{name}.exe") } else { name.to_string() });
    Command::new(&path)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            NetShieldError::PeerUnavailable(format!("failed to start {}: {e}", path.display()))
        })
}
