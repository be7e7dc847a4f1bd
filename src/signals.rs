//! OS signal handling
//!
//! - `SIGINT`, `SIGTERM`, `SIGQUIT` (or Ctrl-C off unix) shut the process down
//! - `SIGHUP` reloads settings and feeds the config-change detector

use crate::supervisor::SupervisorContext;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Waits for a termination signal
///
/// Returns `Err` if signal registration fails.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Waits for a termination signal
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Reload settings on every `SIGHUP` until shutdown
#[cfg(unix)]
pub async fn reload_on_hangup(ctx: Arc<SupervisorContext>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup())?;
    let shutdown = ctx.shutdown_token().clone();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            received = sighup.recv() => {
                if received.is_none() {
                    return Ok(());
                }
                reload_settings(&ctx).await;
            }
        }
    }
}

/// No hangup signal off unix; waits for shutdown
#[cfg(not(unix))]
pub async fn reload_on_hangup(ctx: Arc<SupervisorContext>) -> std::io::Result<()> {
    ctx.shutdown_token().cancelled().await;
    Ok(())
}

/// Re-read the settings source and restart if the serving config moved
pub async fn reload_settings(ctx: &Arc<SupervisorContext>) {
    if let Err(e) = ctx.store().reload().await {
        error!(error = %e, "Failed to reload settings, keeping current values");
        return;
    }
    let restarted = ctx.on_settings_changed(Duration::ZERO);
    info!(restarted, "Settings reloaded");
}

#[cfg(test)]
#[path = "signals_test.rs"]
mod tests;
