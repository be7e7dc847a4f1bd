//! Server supervisor loop
//!
//! Each iteration is one listener generation:
//!
//! ```text
//! Starting -> Listening -> (interrupted) -> Restarting -> Starting -> ...
//!                       -> (shutdown)    -> Stopped
//!                       -> (fatal error) -> Stopped
//! ```
//!
//! A generation provisions TLS material when secured, spawns the companion
//! worker, holds the very first generation at the ready/start barrier,
//! binds the internal listener and serves until its interrupt token fires
//! or the process shuts down. The worker is killed on every exit path.

use crate::config::Settings;
use crate::error::ServerError;
use crate::server::{bind_listener, build_app, socket_addr};
use crate::supervisor::context::SupervisorContext;
use crate::supervisor::generation::ListenerGeneration;
use crate::supervisor::tls::{write_server_cert, TlsProvisioner};
use crate::supervisor::watchdog::{start_watchdog, Prober};
use crate::supervisor::worker::{WorkerProcess, WorkerSpec};
use axum::Router;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Time in-flight requests get to finish once a generation is stopping
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Observable phase of the supervisor loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Listening,
    Restarting,
    Stopped,
}

/// Drives listener generations until shutdown or a fatal error
pub struct Supervisor {
    ctx: Arc<SupervisorContext>,
    service: Router,
    provisioner: TlsProvisioner,
    state: watch::Sender<SupervisorState>,
}

impl Supervisor {
    pub fn new(ctx: Arc<SupervisorContext>, service: Router, provisioner: TlsProvisioner) -> Self {
        let (state, _rx) = watch::channel(SupervisorState::Starting);
        Self {
            ctx,
            service,
            provisioner,
            state,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SupervisorState) {
        debug!(state = ?state, "Supervisor state");
        self.state.send_replace(state);
    }

    /// Run generations until shutdown (`Ok`) or a fatal error (`Err`)
    ///
    /// [`ServerError::RestartRequested`] never escapes this function.
    pub async fn run(&self) -> Result<(), ServerError> {
        loop {
            match self.run_generation().await {
                Ok(()) => {
                    self.stop();
                    info!("Server stopped");
                    return Ok(());
                }
                Err(ServerError::RestartRequested) => {
                    self.set_state(SupervisorState::Restarting);
                    info!("Server restarting...");
                }
                Err(e) => {
                    self.stop();
                    error!(error = %e, "Server error occurred");
                    return Err(e);
                }
            }
        }
    }

    fn stop(&self) {
        self.ctx.watch().clear();
        self.ctx.end_generations();
        self.set_state(SupervisorState::Stopped);
    }

    async fn run_generation(&self) -> Result<(), ServerError> {
        self.set_state(SupervisorState::Starting);
        let generation = self.ctx.begin_generation();

        let (cert_path, key_path) = if self.ctx.settings().server_ssl {
            self.provisioner
                .ensure_server_cert(self.ctx.store().as_ref())
                .await?;
            let (cert, key) = write_server_cert(&self.ctx.settings()).await?;
            (Some(cert), Some(key))
        } else {
            (None, None)
        };

        // Re-read so the generation sees freshly provisioned material
        let settings = self.ctx.settings();
        self.ctx.mark_applied(settings.serving());
        info!(
            generation = generation.id(),
            port = settings.server_port,
            internal_port = settings.server_internal_port,
            ssl = settings.server_ssl,
            "Starting server"
        );

        let spec = WorkerSpec::from_settings(&settings, cert_path.as_deref(), key_path.as_deref());
        let mut worker = WorkerProcess::spawn(&spec, Arc::clone(&self.ctx), generation.id())?;

        let result = self.listen(&generation, &settings).await;
        worker.terminate().await;
        result
    }

    async fn listen(
        &self,
        generation: &Arc<ListenerGeneration>,
        settings: &Settings,
    ) -> Result<(), ServerError> {
        let shutdown = self.ctx.shutdown_token().clone();

        self.ctx.ready().set();
        if !self.ctx.start().is_set() {
            info!("Server ready, waiting for start");
            tokio::select! {
                _ = self.ctx.start().wait() => {}
                _ = shutdown.cancelled() => return Ok(()),
                _ = generation.interrupted() => return Err(ServerError::RestartRequested),
            }
        }

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, settings.server_internal_port));
        let listener = bind_listener(addr, settings.request_queue_size)?;

        if generation.is_interrupted() {
            return Err(ServerError::RestartRequested);
        }
        self.set_state(SupervisorState::Listening);
        let watched = self.ctx.arm_watch(generation.id());
        info!(addr = %addr, generation = generation.id(), watched, "Server listening");

        let app = build_app(
            self.service.clone(),
            Arc::clone(self.ctx.metrics()),
            settings.request_thread_count,
        );
        let interrupt = Arc::clone(generation);
        let stop = shutdown.clone();
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            tokio::select! {
                _ = interrupt.interrupted() => {}
                _ = stop.cancelled() => {}
            }
        });
        let serve = async move { serve.await };
        tokio::pin!(serve);

        let drain_expired = async {
            tokio::select! {
                _ = generation.interrupted() => {}
                _ = shutdown.cancelled() => {}
            }
            tokio::time::sleep(DRAIN_TIMEOUT).await;
        };

        tokio::select! {
            result = &mut serve => result.map_err(ServerError::Serve)?,
            _ = drain_expired => {
                warn!(
                    generation = generation.id(),
                    timeout = ?DRAIN_TIMEOUT,
                    "Requests still in flight after drain timeout, abandoning them"
                );
            }
        }

        if generation.is_interrupted() {
            Err(ServerError::RestartRequested)
        } else {
            Ok(())
        }
    }
}

/// Serve the service directly on the external port
///
/// Debug mode: no worker, no TLS, no generations and no watchdog. Still
/// honours the ready/start barrier and the shutdown token.
pub async fn run_debug_server(ctx: Arc<SupervisorContext>, service: Router) -> Result<(), ServerError> {
    let shutdown = ctx.shutdown_token().clone();

    ctx.ready().set();
    tokio::select! {
        _ = ctx.start().wait() => {}
        _ = shutdown.cancelled() => return Ok(()),
    }

    let settings = ctx.settings();
    let addr = socket_addr(&settings.bind_addr, settings.server_port)?;
    let listener = bind_listener(addr, settings.request_queue_size)?;
    info!(addr = %addr, "Debug server listening");

    let app = build_app(
        service,
        Arc::clone(ctx.metrics()),
        settings.request_thread_count,
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(ServerError::Serve)
}

/// Entry point: debug server, or supervisor plus watchdog
pub async fn run_server(
    ctx: Arc<SupervisorContext>,
    service: Router,
    provisioner: TlsProvisioner,
    prober: Arc<dyn Prober>,
) -> Result<(), ServerError> {
    ctx.prime_serving_cache();

    if ctx.settings().debug {
        info!("Web debug server started");
        return run_debug_server(ctx, service).await;
    }

    info!("Web server started");
    let watchdog = start_watchdog(Arc::clone(&ctx), prober);
    let result = Supervisor::new(Arc::clone(&ctx), service, provisioner)
        .run()
        .await;

    if let Some(handle) = watchdog {
        handle.abort();
    }
    result
}

#[cfg(test)]
#[path = "run_test.rs"]
mod tests;
