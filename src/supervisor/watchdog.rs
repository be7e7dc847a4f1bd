//! Health watchdog for the running interface
//!
//! Probes `GET /ping` over loopback while the watch signal is set. One
//! failed probe is tolerated (short retry); a second consecutive failure
//! requests a restart and backs off. Probes that fail after the watch
//! signal was cleared belong to a generation being torn down and are
//! ignored.
//!
//! The decision logic lives in [`WatchdogState`], which has no timers and
//! no I/O; [`Watchdog`] drives it with tokio sleeps and a [`Prober`].

use crate::config::Settings;
use crate::supervisor::context::{RestartSource, SupervisorContext};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Quiet period before the first probe
pub const INITIAL_DELAY: Duration = Duration::from_secs(5);
/// Poll interval while the watch signal is unset
pub const WATCH_POLL: Duration = Duration::from_millis(500);
/// Wait after a healthy probe
pub const HEALTHY_INTERVAL: Duration = Duration::from_secs(3);
/// Wait after the first failure before retrying
pub const RETRY_COOLDOWN: Duration = Duration::from_secs(2);
/// Wait after requesting a restart
pub const RESTART_COOLDOWN: Duration = Duration::from_secs(10);

/// Result of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
}

/// What the driver should do after a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Probe passed (or its failure no longer matters)
    Healthy,
    /// First failure, retry soon
    Retry,
    /// Second consecutive failure, restart the server
    Restart,
}

impl Verdict {
    /// Wait before the next probe
    pub fn cooldown(&self) -> Duration {
        match self {
            Verdict::Healthy => HEALTHY_INTERVAL,
            Verdict::Retry => RETRY_COOLDOWN,
            Verdict::Restart => RESTART_COOLDOWN,
        }
    }
}

/// Consecutive-failure bookkeeping
#[derive(Debug, Default)]
pub struct WatchdogState {
    failures: u32,
}

impl WatchdogState {
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// The watch signal was found unset; not watchable counts as healthy
    pub fn watch_unset(&mut self) {
        self.failures = 0;
    }

    /// Fold a probe outcome into the state
    ///
    /// `watch_set` is the watch signal re-read after the probe returned.
    pub fn probe_result(&mut self, outcome: &ProbeOutcome, watch_set: bool) -> Verdict {
        match outcome {
            ProbeOutcome::Unhealthy(_) if watch_set => {
                self.failures += 1;
                if self.failures > 1 {
                    self.failures = 0;
                    Verdict::Restart
                } else {
                    Verdict::Retry
                }
            }
            _ => {
                self.failures = 0;
                Verdict::Healthy
            }
        }
    }
}

/// Performs one health probe
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, settings: &Settings) -> ProbeOutcome;
}

/// Probes `/ping` on the external port over loopback
///
/// Certificate verification is off: the certificate is self-issued and the
/// connection never leaves the host.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// Probe URL for the given settings
    pub fn url(settings: &Settings) -> String {
        let scheme = if settings.server_ssl { "https" } else { "http" };
        format!("{}://localhost:{}/ping", scheme, settings.server_port)
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, settings: &Settings) -> ProbeOutcome {
        let url = Self::url(settings);
        match self
            .client
            .get(&url)
            .timeout(settings.watch_timeout())
            .send()
            .await
        {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => ProbeOutcome::Healthy,
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                ProbeOutcome::Unhealthy(format!("bad status {status} from {url}: {body}"))
            }
            Err(e) => ProbeOutcome::Unhealthy(format!("request to {url} failed: {e}")),
        }
    }
}

/// Long-lived watchdog task
pub struct Watchdog {
    ctx: Arc<SupervisorContext>,
    prober: Arc<dyn Prober>,
}

impl Watchdog {
    pub fn new(ctx: Arc<SupervisorContext>, prober: Arc<dyn Prober>) -> Self {
        Self { ctx, prober }
    }

    /// Run until the context's shutdown token fires
    pub async fn run(self) {
        let shutdown = self.ctx.shutdown_token().clone();
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Watchdog shutting down");
            }
            _ = self.watch_loop() => {}
        }
    }

    async fn watch_loop(&self) {
        tokio::time::sleep(INITIAL_DELAY).await;

        let mut state = WatchdogState::default();
        loop {
            if !self.ctx.watch().wait_timeout(WATCH_POLL).await {
                state.watch_unset();
                continue;
            }

            let settings = self.ctx.settings();
            let outcome = self.prober.probe(&settings).await;
            let watch_set = self.ctx.watch().is_set();

            if let ProbeOutcome::Unhealthy(reason) = &outcome {
                if watch_set {
                    error!(reason = %reason, "Failed to ping web server");
                    self.ctx.metrics().record_probe_failure();
                } else {
                    debug!(reason = %reason, "Ignoring probe failure during restart");
                }
            }

            let verdict = state.probe_result(&outcome, watch_set);
            if verdict == Verdict::Restart {
                error!("Web server non-responsive, restarting...");
                self.ctx
                    .request_restart(RestartSource::Watchdog, Duration::ZERO);
            }
            tokio::time::sleep(verdict.cooldown()).await;
        }
    }
}

/// Spawn the watchdog unless disabled by settings
pub fn start_watchdog(
    ctx: Arc<SupervisorContext>,
    prober: Arc<dyn Prober>,
) -> Option<JoinHandle<()>> {
    let settings = ctx.settings();
    if !settings.watchdog_enabled() {
        info!(
            demo_mode = settings.demo_mode,
            server_watch = settings.server_watch,
            "Watchdog disabled"
        );
        return None;
    }
    info!(timeout = ?settings.watch_timeout(), "Starting web server watchdog");
    Some(tokio::spawn(Watchdog::new(ctx, prober).run()))
}

#[cfg(test)]
#[path = "watchdog_test.rs"]
mod tests;
