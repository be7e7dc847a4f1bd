//! Tests for the restart trigger and the config-change detector

use super::*;
use crate::config::FileSettingsStore;
use crate::server::metrics::create_metrics;

fn test_context(settings: Settings) -> Arc<SupervisorContext> {
    let store = Arc::new(FileSettingsStore::in_memory(settings));
    let metrics = create_metrics().expect("create metrics");
    Arc::new(SupervisorContext::new(store, metrics))
}

fn restart_count(ctx: &SupervisorContext, source: RestartSource) -> u64 {
    ctx.metrics()
        .restart_requests_total
        .with_label_values(&[source.as_label()])
        .get()
}

#[tokio::test(start_paused = true)]
async fn test_settings_change_before_ready_is_absorbed() {
    let ctx = test_context(Settings::default());

    ctx.store().update(&mut |s| s.server_port = 8443);
    let restarted = ctx.on_settings_changed(Duration::ZERO);

    assert!(!restarted, "changes before readiness fold into the initial start");
    assert_eq!(restart_count(&ctx, RestartSource::ConfigChange), 0);
}

#[tokio::test(start_paused = true)]
async fn test_restart_only_on_distinct_change() {
    let ctx = test_context(Settings::default());
    ctx.prime_serving_cache();
    ctx.ready().set();

    // No-op update
    ctx.store().update(&mut |s| s.request_thread_count = 8);
    assert!(!ctx.on_settings_changed(Duration::ZERO));

    // Port change
    ctx.store().update(&mut |s| s.server_port = 8443);
    assert!(ctx.on_settings_changed(Duration::ZERO));

    // Same value applied again
    assert!(!ctx.on_settings_changed(Duration::ZERO));

    // Certificate change
    ctx.store()
        .update(&mut |s| s.server_cert = Some("new-cert".to_string()));
    assert!(ctx.on_settings_changed(Duration::ZERO));

    assert_eq!(restart_count(&ctx, RestartSource::ConfigChange), 2);
    assert_eq!(ctx.applied_serving(), ctx.settings().serving());
}

#[tokio::test(start_paused = true)]
async fn test_restart_clears_watch_immediately_and_interrupts_after_delay() {
    let ctx = test_context(Settings::default());
    let generation = ctx.begin_generation();
    ctx.watch().set();

    ctx.request_restart(RestartSource::Manual, Duration::from_secs(5));

    assert!(!ctx.watch().is_set(), "watch must clear before the interrupt");
    assert!(!generation.is_interrupted());

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!generation.is_interrupted(), "delay not yet elapsed");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(generation.is_interrupted());
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_indicator_spans_grace_period() {
    let ctx = test_context(Settings::default());
    ctx.begin_generation();

    ctx.request_restart(RestartSource::Manual, Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ctx.is_interrupting());

    tokio::time::sleep(RESTART_GRACE).await;
    assert!(!ctx.is_interrupting());
}

#[tokio::test(start_paused = true)]
async fn test_restart_without_generation_is_dropped() {
    let ctx = test_context(Settings::default());

    ctx.request_restart(RestartSource::WorkerExit, Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(ctx.metrics().restarts_dropped_total.get(), 1);
    assert!(ctx.current_generation().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_superseded_restart_leaves_new_generation_alone() {
    let ctx = test_context(Settings::default());
    let first = ctx.begin_generation();

    ctx.request_restart(RestartSource::WorkerExit, Duration::from_secs(1));

    // Another source already replaced the generation before the delay ran out
    first.interrupt();
    let second = ctx.begin_generation();
    ctx.watch().set();

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(!second.is_interrupted());
    assert!(ctx.watch().is_set());
    assert_eq!(ctx.metrics().restarts_dropped_total.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_requests_interrupt_generation_once() {
    let ctx = test_context(Settings::default());
    let generation = ctx.begin_generation();
    let mut generations = ctx.subscribe_generations();
    generations.mark_unchanged();

    ctx.request_restart(RestartSource::Watchdog, Duration::ZERO);
    ctx.request_restart(RestartSource::WorkerExit, Duration::from_secs(1));
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(generation.is_interrupted());
    assert!(
        !generations.has_changed().unwrap_or(true),
        "the trigger never publishes generations"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_changes_converge_on_latest_snapshot() {
    let ctx = test_context(Settings::default());
    ctx.prime_serving_cache();
    ctx.ready().set();

    let mut handles = Vec::new();
    for i in 0..32u16 {
        let ctx = Arc::clone(&ctx);
        handles.push(tokio::spawn(async move {
            ctx.store().update(&mut |s| s.server_port = 10_000 + (i % 4));
            ctx.on_settings_changed(Duration::from_secs(60));
        }));
    }
    for handle in handles {
        handle.await.expect("task should not panic");
    }

    assert_eq!(ctx.applied_serving(), ctx.settings().serving());

    // Re-applying the final value is a no-op
    assert!(!ctx.on_settings_changed(Duration::ZERO));
    assert_eq!(ctx.applied_serving(), ctx.settings().serving());
}

#[test]
fn test_challenge_matches_only_live_record() {
    let ctx = test_context(Settings::default());
    assert_eq!(ctx.challenge_authorization("abc"), None);

    ctx.set_challenge("abc", "abc.thumbprint");
    assert_eq!(
        ctx.challenge_authorization("abc").as_deref(),
        Some("abc.thumbprint")
    );
    assert_eq!(ctx.challenge_authorization("other"), None);

    ctx.set_challenge("def", "def.thumbprint");
    assert_eq!(ctx.challenge_authorization("abc"), None, "replaced record");
    assert_eq!(
        ctx.challenge_authorization("def").as_deref(),
        Some("def.thumbprint")
    );
}

#[test]
fn test_generation_ids_increase() {
    let ctx = test_context(Settings::default());

    let first = ctx.begin_generation();
    let second = ctx.begin_generation();

    assert_eq!(first.id(), 1);
    assert_eq!(second.id(), 2);
    assert_eq!(ctx.current_generation().map(|g| g.id()), Some(2));

    ctx.end_generations();
    assert!(ctx.current_generation().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_pending_restart_keeps_watch_unarmed() {
    let ctx = test_context(Settings::default());
    let first = ctx.begin_generation();

    ctx.request_restart(RestartSource::ConfigChange, Duration::from_secs(3));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(ctx.has_pending_restart(first.id()));
    assert!(!ctx.arm_watch(first.id()), "generation is about to be torn down");
    assert!(!ctx.watch().is_set());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(first.is_interrupted());
    assert!(!ctx.has_pending_restart(first.id()));

    let second = ctx.begin_generation();
    assert!(ctx.arm_watch(second.id()));
    assert!(ctx.watch().is_set());
}

#[tokio::test(start_paused = true)]
async fn test_untargeted_pending_restart_blocks_any_generation() {
    let ctx = test_context(Settings::default());

    // Requested before any generation exists; hits whatever is active later
    ctx.request_restart(RestartSource::Manual, Duration::from_secs(2));
    let generation = ctx.begin_generation();
    assert!(!ctx.arm_watch(generation.id()));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(generation.is_interrupted());
    assert!(!ctx.has_pending_restart(generation.id()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_requested_from_plain_thread() {
    let ctx = test_context(Settings::default());
    let generation = ctx.begin_generation();
    ctx.watch().set();

    let requester = Arc::clone(&ctx);
    std::thread::spawn(move || requester.request_restart(RestartSource::Manual, Duration::ZERO))
        .join()
        .expect("requesting thread should not panic");

    assert!(!ctx.watch().is_set());
    tokio::time::timeout(Duration::from_secs(5), generation.interrupted())
        .await
        .expect("interrupt should be delivered on the context's runtime");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_settings_change_reported_from_plain_thread() {
    let ctx = test_context(Settings::default());
    ctx.prime_serving_cache();
    ctx.ready().set();
    let generation = ctx.begin_generation();

    let collaborator = Arc::clone(&ctx);
    let restarted = std::thread::spawn(move || {
        collaborator.store().update(&mut |s| s.server_port = 8443);
        collaborator.on_settings_changed(Duration::ZERO)
    })
    .join()
    .expect("collaborator thread should not panic");

    assert!(restarted);
    tokio::time::timeout(Duration::from_secs(5), generation.interrupted())
        .await
        .expect("interrupt should be delivered");
}

#[test]
fn test_restart_without_any_runtime_is_dropped() {
    let ctx = test_context(Settings::default());
    ctx.begin_generation();
    ctx.watch().set();

    ctx.request_restart(RestartSource::Manual, Duration::ZERO);

    assert_eq!(ctx.metrics().restarts_dropped_total.get(), 1);
    assert!(ctx.watch().is_set(), "nothing will restart, keep watching");
}
