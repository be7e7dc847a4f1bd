use axum::Router;
use std::sync::Arc;
use tracing::{error, info, warn};
use webwarden::server::{create_metrics, serve_redirect};
use webwarden::signals::{reload_on_hangup, wait_for_shutdown_signal};
use webwarden::supervisor::{HttpProber, OpensslProvider, TlsProvisioner};
use webwarden::{run_server, FileSettingsStore, SupervisorContext};

/// Spawn the process-level background tasks
///
/// - termination signals cancel the shutdown token
/// - `SIGHUP` reloads settings
/// - the start barrier is released as soon as the first generation is ready
/// - the redirect responder, when enabled
pub fn spawn_background_tasks(ctx: &Arc<SupervisorContext>) {
    let signal_ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Failed to install shutdown signal handlers");
        }
        info!("Shutdown signal received");
        signal_ctx.shutdown();
    });

    let reload_ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        if let Err(e) = reload_on_hangup(reload_ctx).await {
            warn!(error = %e, "Settings reload on SIGHUP unavailable");
        }
    });

    let start_ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        start_ctx.ready().wait().await;
        info!("Releasing start barrier");
        start_ctx.start().set();
    });

    let settings = ctx.settings();
    if settings.redirect_listener && !settings.debug {
        let redirect_ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            if let Err(e) = serve_redirect(redirect_ctx).await {
                warn!(error = %e, "Redirect server failed");
            }
        });
        info!(port = settings.redirect_port, "Redirect server task spawned");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting webwarden");

    let store = match FileSettingsStore::from_env().await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "Failed to load settings");
            return Err(e.into());
        }
    };

    let metrics = create_metrics()?;
    let ctx = Arc::new(SupervisorContext::new(store, metrics));

    let settings = ctx.settings();
    let provisioner = TlsProvisioner::new(Arc::new(OpensslProvider::new(&settings.data_dir)));
    let prober = Arc::new(HttpProber::new()?);

    spawn_background_tasks(&ctx);

    // The management API itself is served by the companion worker
    run_server(ctx, Router::new(), provisioner, prober).await?;

    info!("webwarden stopped");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
