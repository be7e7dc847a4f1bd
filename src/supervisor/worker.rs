//! Companion worker process: spawn, monitor, kill
//!
//! Each generation owns exactly one worker. A monitor task waits for the
//! process to exit; an exit nobody asked for is treated as a crash and
//! turned into a delayed restart request. Supervisor-initiated kills are
//! marked as expected first so the monitor stays quiet.

use crate::config::Settings;
use crate::error::ServerError;
use crate::supervisor::context::{RestartSource, SupervisorContext};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Pause after a crash before asking for a restart
pub const CRASH_PAUSE: Duration = Duration::from_secs(1);

/// Delay passed to the restart trigger after a crash
pub const CRASH_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Bytes of stdout/stderr kept for crash reports
const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

/// How long to wait for output pipes to drain after an exit
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Program, arguments and environment for one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerSpec {
    /// Derive the worker environment from settings and written TLS paths
    pub fn from_settings(settings: &Settings, cert_path: Option<&Path>, key_path: Option<&Path>) -> Self {
        let path_str = |p: Option<&Path>| p.map(|p| p.display().to_string()).unwrap_or_default();

        let env = vec![
            (
                "REDIRECT_SERVER".to_string(),
                settings.redirect_server.to_string(),
            ),
            ("BIND_HOST".to_string(), settings.bind_addr.clone()),
            ("BIND_PORT".to_string(), settings.server_port.to_string()),
            ("INTERNAL_ADDRESS".to_string(), settings.internal_address()),
            ("CERT_PATH".to_string(), path_str(cert_path)),
            ("KEY_PATH".to_string(), path_str(key_path)),
        ];

        Self {
            program: settings.web_executable.clone(),
            args: settings.web_args.clone(),
            env,
        }
    }
}

/// Running worker owned by one generation
pub struct WorkerProcess {
    pid: Option<u32>,
    expected_exit: Arc<AtomicBool>,
    kill: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

impl WorkerProcess {
    /// Spawn the worker and start its exit monitor
    pub fn spawn(
        spec: &WorkerSpec,
        ctx: Arc<SupervisorContext>,
        generation: u64,
    ) -> Result<Self, ServerError> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ServerError::Worker {
                program: spec.program.clone(),
                source,
            })?;

        let pid = child.id();
        info!(program = %spec.program, pid = ?pid, generation, "Worker process started");

        let expected_exit = Arc::new(AtomicBool::new(false));
        let kill = CancellationToken::new();
        let monitor = tokio::spawn(monitor(
            child,
            Arc::clone(&expected_exit),
            kill.clone(),
            ctx,
            generation,
        ));

        Ok(Self {
            pid,
            expected_exit,
            kill,
            monitor: Some(monitor),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Mark the coming exit as supervisor-initiated
    pub fn mark_expected_exit(&self) {
        self.expected_exit.store(true, Ordering::SeqCst);
    }

    /// Kill the worker and wait for the monitor to reap it
    ///
    /// Safe to call more than once and after the process already exited.
    pub async fn terminate(&mut self) {
        self.mark_expected_exit();
        self.kill.cancel();
        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.await {
                error!(error = %e, "Worker monitor task failed");
            }
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // The monitor kills the child once it sees the token
        self.mark_expected_exit();
        self.kill.cancel();
    }
}

async fn monitor(
    mut child: Child,
    expected_exit: Arc<AtomicBool>,
    kill: CancellationToken,
    ctx: Arc<SupervisorContext>,
    generation: u64,
) {
    let stdout = child.stdout.take().map(|s| tokio::spawn(read_tail(s)));
    let stderr = child.stderr.take().map(|s| tokio::spawn(read_tail(s)));

    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, generation, "Worker already gone");
            }
            child.wait().await
        }
    };

    let expected = expected_exit.load(Ordering::SeqCst);
    ctx.metrics().record_worker_exit(expected);

    if expected {
        debug!(generation, status = ?status, "Worker process stopped");
        return;
    }

    let stdout = collect(stdout).await;
    let stderr = collect(stderr).await;
    error!(
        generation,
        status = ?status,
        stdout = %stdout,
        stderr = %stderr,
        "Web server process exited unexpectedly"
    );

    tokio::time::sleep(CRASH_PAUSE).await;
    ctx.request_restart(RestartSource::WorkerExit, CRASH_RESTART_DELAY);
}

/// Read a stream to EOF keeping only the last `OUTPUT_TAIL_BYTES`
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > OUTPUT_TAIL_BYTES {
                    let excess = tail.len() - OUTPUT_TAIL_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    tail
}

async fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(handle) = reader else {
        return String::new();
    };
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).trim_end().to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
#[path = "worker_test.rs"]
mod tests;
