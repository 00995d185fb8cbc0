use std::time::{Duration, Instant};

use axum::Router;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use deaddrop::mailbox::Mailbox;
use deaddrop::relay::{app, RelayConfig, RelayState};

async fn start_relay(config: RelayConfig) -> (String, oneshot::Sender<()>) {
    let mailbox = Mailbox::open_in_memory().expect("open mailbox");
    let state = RelayState::new(config, mailbox);
    let (sweep_shutdown_tx, sweep_shutdown_rx) = oneshot::channel();
    state.start_sweep_task(sweep_shutdown_rx);

    let app: Router = app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (format!("http://{}", addr), sweep_shutdown_tx)
}

fn short_ttl_config() -> RelayConfig {
    RelayConfig {
        ttl: Duration::from_millis(80),
        sweep_interval: Duration::from_millis(20),
        long_poll_timeout: Duration::from_millis(200),
        max_payload_bytes: 64 * 1024,
    }
}

fn envelope_json(id: &str, to_user: &str, created_at: u64, body_tag: &str) -> Value {
    json!({
        "id": id,
        "sender_id": "SENDER",
        "recipient_id": to_user,
        "created_at": created_at,
        "payload": { "nonce_b64": "bm9uY2U", "ciphertext_b64": body_tag },
    })
}

fn post_send(base_url: &str, to_user: &str, message: &Value) -> u16 {
    let result = ureq::post(&format!("{base_url}/queue/send"))
        .send_json(json!({ "to_user_id": to_user, "message": message }));
    match result {
        Ok(response) => response.status(),
        Err(ureq::Error::Status(code, _)) => code,
        Err(other) => panic!("send transport error: {other}"),
    }
}

fn fetch_sync(base_url: &str, user_id: &str, since: Option<u64>, wait: bool) -> Vec<Value> {
    let mut url = format!("{base_url}/queue/sync/{user_id}");
    let mut sep = '?';
    if let Some(since) = since {
        url.push_str(&format!("{sep}since={since}"));
        sep = '&';
    }
    if wait {
        url.push_str(&format!("{sep}wait=1"));
    }
    let response = ureq::get(&url).call().expect("sync call");
    response.into_json().expect("sync body")
}

fn post_ack(base_url: &str, user_id: &str, message_ids: &[&str]) -> u16 {
    let result = ureq::post(&format!("{base_url}/queue/ack"))
        .send_json(json!({ "user_id": user_id, "message_ids": message_ids }));
    match result {
        Ok(response) => response.status(),
        Err(ureq::Error::Status(code, _)) => code,
        Err(other) => panic!("ack transport error: {other}"),
    }
}

#[tokio::test]
async fn enqueue_is_idempotent_and_keeps_the_latest_payload() {
    let (base_url, shutdown_tx) = start_relay(RelayConfig::default()).await;

    let result = tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || {
            assert_eq!(post_send(&base_url, "bob", &envelope_json("m1", "bob", 10, "djE")), 200);
            assert_eq!(post_send(&base_url, "bob", &envelope_json("m1", "bob", 10, "djI")), 200);
            fetch_sync(&base_url, "bob", None, false)
        }
    })
    .await
    .expect("client task");

    shutdown_tx.send(()).ok();

    assert_eq!(result.len(), 1);
    assert_eq!(result[0]["payload"]["ciphertext_b64"], "djI");
}

#[tokio::test]
async fn sync_orders_by_timestamp_and_honours_since() {
    let (base_url, shutdown_tx) = start_relay(RelayConfig::default()).await;

    let (all, newer) = tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || {
            post_send(&base_url, "bob", &envelope_json("m2", "bob", 20, "Yg"));
            post_send(&base_url, "bob", &envelope_json("m1", "bob", 10, "YQ"));
            post_send(&base_url, "bob", &envelope_json("m3", "bob", 30, "Yw"));
            post_send(&base_url, "carol", &envelope_json("x1", "carol", 5, "eA"));
            (
                fetch_sync(&base_url, "bob", None, false),
                fetch_sync(&base_url, "bob", Some(10), false),
            )
        }
    })
    .await
    .expect("client task");

    shutdown_tx.send(()).ok();

    let ids: Vec<&str> = all.iter().map(|e| e["id"].as_str().unwrap()).collect();
    assert_eq!(ids, ["m1", "m2", "m3"]);
    let ids: Vec<&str> = newer.iter().map(|e| e["id"].as_str().unwrap()).collect();
    assert_eq!(ids, ["m2", "m3"]);
}

#[tokio::test]
async fn sync_is_non_destructive_until_ack() {
    let (base_url, shutdown_tx) = start_relay(RelayConfig::default()).await;

    tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || {
            post_send(&base_url, "bob", &envelope_json("m1", "bob", 10, "YQ"));
            assert_eq!(fetch_sync(&base_url, "bob", None, false).len(), 1);
            assert_eq!(fetch_sync(&base_url, "bob", None, false).len(), 1);

            assert_eq!(post_ack(&base_url, "bob", &["m1"]), 200);
            assert!(fetch_sync(&base_url, "bob", None, false).is_empty());
        }
    })
    .await
    .expect("client task");

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn ack_is_idempotent_and_scoped_to_the_user() {
    let (base_url, shutdown_tx) = start_relay(RelayConfig::default()).await;

    tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || {
            post_send(&base_url, "bob", &envelope_json("m1", "bob", 10, "YQ"));

            // Wrong user, ghost ids, repeated acks: all 200, none disturb bob.
            assert_eq!(post_ack(&base_url, "carol", &["m1"]), 200);
            assert_eq!(post_ack(&base_url, "bob", &["ghost"]), 200);
            assert_eq!(fetch_sync(&base_url, "bob", None, false).len(), 1);

            assert_eq!(post_ack(&base_url, "bob", &["m1"]), 200);
            assert_eq!(post_ack(&base_url, "bob", &["m1"]), 200);
            assert!(fetch_sync(&base_url, "bob", None, false).is_empty());
        }
    })
    .await
    .expect("client task");

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn unacknowledged_entries_expire_after_ttl() {
    let (base_url, shutdown_tx) = start_relay(short_ttl_config()).await;

    tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || {
            post_send(&base_url, "bob", &envelope_json("m1", "bob", 10, "YQ"));
            assert_eq!(fetch_sync(&base_url, "bob", None, false).len(), 1);
        }
    })
    .await
    .expect("post task");

    tokio::time::sleep(Duration::from_millis(150)).await;

    let inbox = tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || fetch_sync(&base_url, "bob", None, false)
    })
    .await
    .expect("fetch task");

    shutdown_tx.send(()).ok();

    assert!(inbox.is_empty(), "expected TTL to evict the entry");
}

#[tokio::test]
async fn long_poll_wakes_on_enqueue() {
    let (base_url, shutdown_tx) = start_relay(RelayConfig {
        long_poll_timeout: Duration::from_secs(5),
        ..RelayConfig::default()
    })
    .await;

    let poll = tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || {
            let started = Instant::now();
            let entries = fetch_sync(&base_url, "bob", None, true);
            (entries, started.elapsed())
        }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || post_send(&base_url, "bob", &envelope_json("m1", "bob", 10, "YQ"))
    })
    .await
    .expect("post task");

    let (entries, elapsed) = poll.await.expect("poll task");
    shutdown_tx.send(()).ok();

    assert_eq!(entries.len(), 1);
    assert!(
        elapsed < Duration::from_secs(4),
        "long-poll should return on enqueue, not on timeout (took {elapsed:?})"
    );
}

#[tokio::test]
async fn long_poll_returns_empty_after_timeout() {
    let (base_url, shutdown_tx) = start_relay(RelayConfig {
        long_poll_timeout: Duration::from_millis(150),
        ..RelayConfig::default()
    })
    .await;

    let (entries, elapsed) = tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || {
            let started = Instant::now();
            let entries = fetch_sync(&base_url, "nobody", None, true);
            (entries, started.elapsed())
        }
    })
    .await
    .expect("poll task");

    shutdown_tx.send(()).ok();

    assert!(entries.is_empty());
    assert!(elapsed >= Duration::from_millis(140));
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let (base_url, shutdown_tx) = start_relay(RelayConfig::default()).await;

    tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || {
            // Missing message id.
            let status = post_send(&base_url, "bob", &json!({ "sender_id": "SENDER" }));
            assert_eq!(status, 400);

            // Missing recipient.
            let status = post_send(&base_url, "", &envelope_json("m1", "", 10, "YQ"));
            assert_eq!(status, 400);
        }
    })
    .await
    .expect("client task");

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn register_and_lookup_roundtrip() {
    let (base_url, shutdown_tx) = start_relay(RelayConfig::default()).await;

    tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || {
            let response = ureq::post(&format!("{base_url}/register"))
                .send_json(json!({ "id": "ABC123", "public_key": "beef" }))
                .expect("register");
            let body: Value = response.into_json().expect("register body");
            assert_eq!(body["success"], true);

            let response = ureq::get(&format!("{base_url}/user/ABC123"))
                .call()
                .expect("lookup");
            let user: Value = response.into_json().expect("user body");
            assert_eq!(user["public_key"], "beef");

            let missing = ureq::get(&format!("{base_url}/user/NOPE")).call();
            assert!(matches!(missing, Err(ureq::Error::Status(404, _))));
        }
    })
    .await
    .expect("client task");

    shutdown_tx.send(()).ok();
}
