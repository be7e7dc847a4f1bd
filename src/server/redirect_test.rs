//! Tests for the redirect & challenge responder

use super::*;
use crate::config::{FileSettingsStore, Settings};
use crate::server::metrics::create_metrics;

fn test_context(settings: Settings) -> Arc<SupervisorContext> {
    let store = Arc::new(FileSettingsStore::in_memory(settings));
    let metrics = create_metrics().expect("create metrics");
    Arc::new(SupervisorContext::new(store, metrics))
}

fn uri(s: &str) -> Uri {
    s.parse().expect("valid uri")
}

async fn serve(ctx: Arc<SupervisorContext>) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, redirect_router(ctx)).await;
    });
    port
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client")
}

#[test]
fn test_default_port_is_omitted() {
    assert_eq!(
        redirect_url("vpn.example.com", &uri("/login?next=%2F"), true, 443),
        "https://vpn.example.com/login?next=%2F"
    );
}

#[test]
fn test_non_default_port_is_appended() {
    assert_eq!(
        redirect_url("vpn.example.com", &uri("/"), true, 8443),
        "https://vpn.example.com:8443/"
    );
}

#[test]
fn test_plain_scheme_when_unsecured() {
    assert_eq!(
        redirect_url("vpn.example.com", &uri("/status"), false, 8080),
        "http://vpn.example.com:8080/status"
    );
}

#[test]
fn test_incoming_port_is_replaced() {
    assert_eq!(
        redirect_url("vpn.example.com:80", &uri("/"), true, 443),
        "https://vpn.example.com/"
    );
    assert_eq!(
        redirect_url("[2001:db8::1]:80", &uri("/"), true, 8443),
        "https://[2001:db8::1]:8443/"
    );
}

#[tokio::test]
async fn test_redirects_everything_else() {
    let ctx = test_context(Settings {
        server_port: 8443,
        ..Settings::default()
    });
    let port = serve(ctx).await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/servers?page=2", port))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), reqwest::StatusCode::FOUND);
    assert_eq!(
        response.headers()["location"],
        "https://127.0.0.1:8443/servers?page=2"
    );
}

#[tokio::test]
async fn test_challenge_answered_only_for_live_token() {
    let ctx = test_context(Settings::default());
    ctx.set_challenge("tok-1", "tok-1.thumbprint");
    let port = serve(ctx.clone()).await;
    let url = |token: &str| format!("http://127.0.0.1:{}{}{}", port, CHALLENGE_PREFIX, token);

    let response = client().get(url("tok-1")).send().await.expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.text().await.expect("body"), "tok-1.thumbprint");

    let response = client().get(url("other")).send().await.expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    // A new challenge replaces the old one
    ctx.set_challenge("tok-2", "tok-2.thumbprint");
    let response = client().get(url("tok-1")).send().await.expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let response = client().get(url("tok-2")).send().await.expect("request");
    assert_eq!(response.text().await.expect("body"), "tok-2.thumbprint");
}

#[tokio::test]
async fn test_challenge_prefix_is_never_redirected() {
    let ctx = test_context(Settings::default());
    let port = serve(ctx).await;

    let response = client()
        .get(format!("http://127.0.0.1:{}{}a/b", port, CHALLENGE_PREFIX))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_serve_redirect_stops_on_shutdown() {
    let ctx = test_context(Settings {
        bind_addr: "127.0.0.1".to_string(),
        redirect_port: {
            let l = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            l.local_addr().expect("addr").port()
        },
        ..Settings::default()
    });

    let handle = tokio::spawn(serve_redirect(ctx.clone()));
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    ctx.shutdown();

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("redirect server should stop")
        .expect("task");
    assert!(result.is_ok());
}
