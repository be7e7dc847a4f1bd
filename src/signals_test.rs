//! Tests for settings reload

use super::*;
use crate::config::{FileSettingsStore, Settings};
use crate::server::create_metrics;
use crate::supervisor::RestartSource;
use std::path::PathBuf;

fn settings_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "webwarden-signals-{}-{}.json",
        name,
        std::process::id()
    ))
}

async fn write_settings(path: &PathBuf, settings: &Settings) {
    let json = serde_json::to_vec(settings).expect("serialize");
    tokio::fs::write(path, json).await.expect("write settings");
}

fn config_restarts(ctx: &SupervisorContext) -> u64 {
    ctx.metrics()
        .restart_requests_total
        .with_label_values(&[RestartSource::ConfigChange.as_label()])
        .get()
}

#[tokio::test]
async fn test_reload_with_new_port_requests_restart() {
    let path = settings_file("port");
    write_settings(&path, &Settings::default()).await;
    let store = Arc::new(FileSettingsStore::open(&path).await.expect("open"));
    let ctx = Arc::new(SupervisorContext::new(
        store,
        create_metrics().expect("create metrics"),
    ));
    ctx.prime_serving_cache();
    ctx.ready().set();

    write_settings(
        &path,
        &Settings {
            server_port: 8443,
            ..Settings::default()
        },
    )
    .await;
    reload_settings(&ctx).await;

    assert_eq!(ctx.settings().server_port, 8443);
    assert_eq!(config_restarts(&ctx), 1);
    let _ = tokio::fs::remove_file(&path).await;
}

#[tokio::test]
async fn test_reload_without_serving_change_is_quiet() {
    let path = settings_file("quiet");
    write_settings(&path, &Settings::default()).await;
    let store = Arc::new(FileSettingsStore::open(&path).await.expect("open"));
    let ctx = Arc::new(SupervisorContext::new(
        store,
        create_metrics().expect("create metrics"),
    ));
    ctx.prime_serving_cache();
    ctx.ready().set();

    write_settings(
        &path,
        &Settings {
            request_thread_count: 4,
            ..Settings::default()
        },
    )
    .await;
    reload_settings(&ctx).await;

    assert_eq!(ctx.settings().request_thread_count, 4);
    assert_eq!(config_restarts(&ctx), 0);
    let _ = tokio::fs::remove_file(&path).await;
}

#[tokio::test]
async fn test_broken_settings_file_keeps_current_values() {
    let path = settings_file("broken");
    write_settings(&path, &Settings::default()).await;
    let store = Arc::new(FileSettingsStore::open(&path).await.expect("open"));
    let ctx = Arc::new(SupervisorContext::new(
        store,
        create_metrics().expect("create metrics"),
    ));
    ctx.ready().set();

    tokio::fs::write(&path, b"{ not json").await.expect("write");
    reload_settings(&ctx).await;

    assert_eq!(ctx.settings(), Settings::default());
    assert_eq!(config_restarts(&ctx), 0);
    let _ = tokio::fs::remove_file(&path).await;
}
