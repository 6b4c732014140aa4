//! HTTP surface tests: subscribe/unsubscribe validation and the health
//! snapshot, over a real listener.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;

use nudge::api::app;
use nudge::bridge::Bridge;
use nudge::config::Config;

fn test_config() -> Config {
    Config {
        bind_addr: "127.0.0.1:0".to_string(),
        dedup_retention_secs: 60,
        reconnect_delay_secs: 1,
        reconnect_max_delay_secs: 2,
        connect_timeout_secs: 5,
        push_timeout_secs: 5,
    }
}

async fn start_api() -> (Arc<Bridge>, String, oneshot::Sender<()>) {
    let bridge = Bridge::new(test_config());
    let router = app(Arc::clone(&bridge));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind api");
    let addr = listener.local_addr().expect("api addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });
    (bridge, format!("http://{addr}"), shutdown_tx)
}

fn post_json(url: &str, body: Value) -> (u16, Value) {
    match ureq::post(url).send_json(body) {
        Ok(response) => {
            let status = response.status();
            (status, response.into_json().expect("response json"))
        }
        Err(ureq::Error::Status(status, response)) => {
            (status, response.into_json().expect("error json"))
        }
        Err(error) => panic!("request failed: {error}"),
    }
}

fn get_json(url: &str) -> Value {
    ureq::get(url)
        .call()
        .expect("get")
        .into_json()
        .expect("response json")
}

fn subscribe_body(subscriber_id: &str, relays: &[&str]) -> Value {
    serde_json::json!({
        "subscriber_id": subscriber_id,
        "endpoint": {
            "url": "https://push.example/token",
            "auth": "auth-key",
            "p256dh": "p256dh-key",
        },
        "channel_ids": ["c1"],
        "relay_urls": relays,
    })
}

#[tokio::test]
async fn subscribe_then_health_reflects_registration() {
    let (bridge, base, shutdown_tx) = start_api().await;

    // Unreachable relay: the link exists and retries, which is all the
    // health snapshot needs to show.
    let body = subscribe_body("alice", &["ws://127.0.0.1:1/"]);
    let (status, response) = tokio::task::spawn_blocking({
        let base = base.clone();
        move || post_json(&format!("{base}/subscribe"), body)
    })
    .await
    .expect("subscribe task");
    assert_eq!(status, 200);
    assert_eq!(response["status"], "ok");

    let health = tokio::task::spawn_blocking({
        let base = base.clone();
        move || get_json(&format!("{base}/health"))
    })
    .await
    .expect("health task");
    assert_eq!(health["status"], "ok");
    assert_eq!(health["subscribers"], 1);
    let relays = health["relays"].as_array().expect("relays array");
    assert_eq!(relays.len(), 1);
    assert_eq!(relays[0]["url"], "ws://127.0.0.1:1/");
    let state = relays[0]["state"].as_str().expect("state string");
    assert!(matches!(state, "disconnected" | "connecting" | "connected"));

    bridge.shutdown().await;
    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn invalid_subscribe_is_rejected_without_mutation() {
    let (bridge, base, shutdown_tx) = start_api().await;

    let body = subscribe_body("", &["ws://127.0.0.1:1/"]);
    let (status, response) = tokio::task::spawn_blocking({
        let base = base.clone();
        move || post_json(&format!("{base}/subscribe"), body)
    })
    .await
    .expect("subscribe task");
    assert_eq!(status, 400);
    assert_eq!(response["error"], "subscriber_id must not be empty");

    let body = subscribe_body("alice", &[]);
    let (status, response) = tokio::task::spawn_blocking({
        let base = base.clone();
        move || post_json(&format!("{base}/subscribe"), body)
    })
    .await
    .expect("subscribe task");
    assert_eq!(status, 400);
    assert_eq!(response["error"], "relay_urls must not be empty");

    let health = tokio::task::spawn_blocking({
        let base = base.clone();
        move || get_json(&format!("{base}/health"))
    })
    .await
    .expect("health task");
    assert_eq!(health["subscribers"], 0);
    assert_eq!(health["relays"].as_array().unwrap().len(), 0);

    bridge.shutdown().await;
    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn unsubscribe_is_idempotent_over_http() {
    let (bridge, base, shutdown_tx) = start_api().await;

    let (status, response) = tokio::task::spawn_blocking({
        let base = base.clone();
        move || {
            post_json(
                &format!("{base}/unsubscribe"),
                serde_json::json!({ "subscriber_id": "nobody" }),
            )
        }
    })
    .await
    .expect("unsubscribe task");
    assert_eq!(status, 200);
    assert_eq!(response["status"], "ok");

    bridge.shutdown().await;
    shutdown_tx.send(()).ok();
}
