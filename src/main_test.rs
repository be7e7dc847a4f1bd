use super::spawn_background_tasks;
use std::sync::Arc;
use std::time::Duration;
use webwarden::server::create_metrics;
use webwarden::{FileSettingsStore, Settings, SupervisorContext};

#[tokio::test]
async fn test_start_released_once_ready() {
    let store = Arc::new(FileSettingsStore::in_memory(Settings::default()));
    let ctx = Arc::new(SupervisorContext::new(
        store,
        create_metrics().expect("create metrics"),
    ));

    spawn_background_tasks(&ctx);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!ctx.start().is_set(), "start waits for ready");

    ctx.ready().set();
    assert!(ctx.start().wait_timeout(Duration::from_secs(2)).await);

    ctx.shutdown();
}
