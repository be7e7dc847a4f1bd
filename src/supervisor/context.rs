//! Shared supervisor state, the restart trigger and the config-change detector
//!
//! Every component receives an `Arc<SupervisorContext>` instead of reaching
//! for module-level globals. The context owns:
//! - the active generation handle (written only by the supervisor loop)
//! - the watch signal and the ready/start barrier
//! - the cached serving config used to decide whether a restart is needed
//! - the live ACME challenge record

use crate::config::{ServingConfig, Settings, SettingsStore};
use crate::server::metrics::SharedMetrics;
use crate::supervisor::generation::ListenerGeneration;
use crate::supervisor::signal::Flag;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Wait after injecting an interrupt before the indicator is lowered
pub const RESTART_GRACE: Duration = Duration::from_secs(1);

/// Who asked for a restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartSource {
    ConfigChange,
    Watchdog,
    WorkerExit,
    Manual,
}

impl RestartSource {
    /// Short stable label for logs and metrics
    pub fn as_label(&self) -> &'static str {
        match self {
            RestartSource::ConfigChange => "config_change",
            RestartSource::Watchdog => "watchdog",
            RestartSource::WorkerExit => "worker_exit",
            RestartSource::Manual => "manual",
        }
    }
}

/// Token/authorization pair answering an HTTP-01 challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    pub token: String,
    pub authorization: String,
}

pub struct SupervisorContext {
    store: Arc<dyn SettingsStore>,
    metrics: SharedMetrics,
    watch: Flag,
    ready: Flag,
    start: Flag,
    interrupting: AtomicUsize,
    generation: watch::Sender<Option<Arc<ListenerGeneration>>>,
    next_generation: AtomicU64,
    applied: Mutex<ServingConfig>,
    /// Undelivered restarts keyed by target generation (`None` = whatever is active)
    pending: Mutex<HashMap<Option<u64>, usize>>,
    challenge: RwLock<Option<ChallengeRecord>>,
    shutdown: CancellationToken,
    runtime: Option<Handle>,
}

impl SupervisorContext {
    /// Create the context
    ///
    /// When called inside a tokio runtime, that runtime's handle is kept so
    /// restarts can be requested later from threads outside it.
    pub fn new(store: Arc<dyn SettingsStore>, metrics: SharedMetrics) -> Self {
        let applied = store.settings().serving();
        let (generation, _rx) = watch::channel(None);
        Self {
            store,
            metrics,
            watch: Flag::new(),
            ready: Flag::new(),
            start: Flag::new(),
            interrupting: AtomicUsize::new(0),
            generation,
            next_generation: AtomicU64::new(0),
            applied: Mutex::new(applied),
            pending: Mutex::new(HashMap::new()),
            challenge: RwLock::new(None),
            shutdown: CancellationToken::new(),
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SettingsStore> {
        &self.store
    }

    /// Snapshot of the live settings
    pub fn settings(&self) -> Settings {
        self.store.settings()
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Whether the active generation may be health-probed
    pub fn watch(&self) -> &Flag {
        &self.watch
    }

    /// Set once the first generation is about to accept connections
    pub fn ready(&self) -> &Flag {
        &self.ready
    }

    /// Released by the embedding application to let the first generation serve
    pub fn start(&self) -> &Flag {
        &self.start
    }

    /// True while a restart interrupt is being delivered
    pub fn is_interrupting(&self) -> bool {
        self.interrupting.load(Ordering::SeqCst) > 0
    }

    /// Process-wide shutdown token
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Ask every component to stop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn current_generation(&self) -> Option<Arc<ListenerGeneration>> {
        self.generation.borrow().clone()
    }

    /// Observe generation changes
    pub fn subscribe_generations(&self) -> watch::Receiver<Option<Arc<ListenerGeneration>>> {
        self.generation.subscribe()
    }

    /// Publish a fresh generation as the active one
    pub(crate) fn begin_generation(&self) -> Arc<ListenerGeneration> {
        let id = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = Arc::new(ListenerGeneration::new(id));
        self.generation.send_replace(Some(Arc::clone(&generation)));
        self.metrics.record_generation_started();
        generation
    }

    /// Drop the active handle once the loop has stopped for good
    pub(crate) fn end_generations(&self) {
        self.generation.send_replace(None);
    }

    /// Cached serving config the running generation was built from
    pub fn applied_serving(&self) -> ServingConfig {
        self.applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Reset the cache to the live settings (done once when the server starts)
    pub fn prime_serving_cache(&self) {
        self.mark_applied(self.store.settings().serving());
    }

    /// Record the serving config a generation was actually built from
    pub(crate) fn mark_applied(&self, serving: ServingConfig) {
        *self
            .applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = serving;
    }

    /// Whether an undelivered restart would hit generation `id`
    pub fn has_pending_restart(&self, id: u64) -> bool {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.contains_key(&Some(id)) || pending.contains_key(&None)
    }

    fn add_pending(&self, target: Option<u64>) {
        *self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(target)
            .or_insert(0) += 1;
    }

    fn remove_pending(&self, target: Option<u64>) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(count) = pending.get_mut(&target) {
            *count -= 1;
            if *count == 0 {
                pending.remove(&target);
            }
        }
    }

    /// Set the watch signal for generation `id` unless a restart is pending
    ///
    /// Returns whether the signal was left set. The signal is set before the
    /// pending check and `request_restart` registers before it clears, so a
    /// racing request always wins.
    pub(crate) fn arm_watch(&self, id: u64) -> bool {
        self.watch.set();
        if self.has_pending_restart(id) {
            self.watch.clear();
            debug!(generation = id, "Restart pending, not watching");
            return false;
        }
        true
    }

    /// Request that the active generation be torn down and rebuilt
    ///
    /// Clears the watch signal immediately and returns; the interrupt is
    /// delivered by a detached task after `delay`. Requests that fire after
    /// a newer generation has already replaced the one they were aimed at
    /// are dropped. Safe to call from any thread: the task runs on the
    /// runtime the context was created in.
    pub fn request_restart(self: &Arc<Self>, source: RestartSource, delay: Duration) {
        let Some(runtime) = self
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
        else {
            error!(
                source = source.as_label(),
                "Restart requested with no tokio runtime available, dropping"
            );
            self.metrics.record_restart_dropped();
            return;
        };

        let target = self.current_generation().map(|g| g.id());
        self.add_pending(target);
        self.watch.clear();
        self.metrics.record_restart_request(source.as_label());

        info!(
            source = source.as_label(),
            delay_ms = delay.as_millis() as u64,
            target = ?target,
            "Server restart requested"
        );

        let ctx = Arc::clone(self);
        runtime.spawn(async move {
            ctx.deliver_interrupt(source, target, delay).await;
        });
    }

    async fn deliver_interrupt(&self, source: RestartSource, target: Option<u64>, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.interrupting.fetch_add(1, Ordering::SeqCst);

        match self.current_generation() {
            None => {
                warn!(
                    source = source.as_label(),
                    "Restart requested with no active generation, dropping"
                );
                self.metrics.record_restart_dropped();
            }
            Some(generation) if target.is_some_and(|t| t != generation.id()) => {
                debug!(
                    source = source.as_label(),
                    target = ?target,
                    current = generation.id(),
                    "Restart already satisfied by a newer generation"
                );
            }
            Some(generation) => {
                self.watch.clear();
                generation.interrupt();
                debug!(
                    source = source.as_label(),
                    generation = generation.id(),
                    "Interrupt delivered"
                );
            }
        }
        self.remove_pending(target);

        tokio::time::sleep(RESTART_GRACE).await;
        self.interrupting.fetch_sub(1, Ordering::SeqCst);
    }

    /// React to a settings change
    ///
    /// Before the first generation is ready this does nothing: the initial
    /// start reads whatever settings are live. Afterwards, a restart is
    /// requested iff the certificate, key or port differ from the cached
    /// snapshot. Returns whether a restart was requested.
    pub fn on_settings_changed(self: &Arc<Self>, delay: Duration) -> bool {
        if !self.ready.is_set() {
            return false;
        }

        let mut applied = self
            .applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let live = self.store.settings().serving();
        if *applied == live {
            return false;
        }

        info!(
            cert_changed = applied.server_cert != live.server_cert,
            key_changed = applied.server_key != live.server_key,
            old_port = applied.server_port,
            new_port = live.server_port,
            "Serving configuration changed"
        );
        *applied = live;
        self.request_restart(RestartSource::ConfigChange, delay);
        true
    }

    /// Replace the live ACME challenge
    pub fn set_challenge(&self, token: impl Into<String>, authorization: impl Into<String>) {
        let record = ChallengeRecord {
            token: token.into(),
            authorization: authorization.into(),
        };
        debug!(token = %record.token, "ACME challenge updated");
        *self
            .challenge
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(record);
    }

    /// Authorization for `token` if it matches the live challenge
    pub fn challenge_authorization(&self, token: &str) -> Option<String> {
        self.challenge
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .filter(|record| record.token == token)
            .map(|record| record.authorization.clone())
    }
}

#[cfg(test)]
#[path = "context_test.rs"]
mod tests;
