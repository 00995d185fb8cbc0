//! Store-and-forward relay service.
//!
//! A thin axum layer over [`Mailbox`]: enqueue is an idempotent upsert, sync
//! is a non-destructive ordered read with an optional long-poll, ack is an
//! idempotent delete, and a background task sweeps expired rows.  Per-user
//! broadcast channels wake suspended long-polls the moment something is
//! enqueued, which turns polling into near-real-time delivery without any
//! persistent connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::dlog;
use crate::mailbox::{Mailbox, QueuedEnvelope, UserRecord};
use crate::protocol::now_millis;

const WAKEUP_CHANNEL_CAPACITY: usize = 16;

#[derive(Clone)]
pub struct RelayConfig {
    /// Retention window; nothing outlives it, acknowledged or not.
    pub ttl: Duration,
    /// How often the sweep task deletes expired rows.
    pub sweep_interval: Duration,
    /// Upper bound on how long a long-poll sync is held open.  Kept under
    /// typical client and proxy timeouts of 30 s.
    pub long_poll_timeout: Duration,
    pub max_payload_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(600),
            long_poll_timeout: Duration::from_secs(25),
            max_payload_bytes: 256 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct RelayState {
    config: RelayConfig,
    mailbox: Arc<Mutex<Mailbox>>,
    wakeups: Arc<RwLock<HashMap<String, broadcast::Sender<()>>>>,
}

pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/register", post(register_user))
        .route("/user/:user_id", get(lookup_user))
        .route("/queue/send", post(queue_send))
        .route("/queue/sync/:user_id", get(queue_sync))
        .route("/queue/ack", post(queue_ack))
        .with_state(state)
}

impl RelayState {
    pub fn new(config: RelayConfig, mailbox: Mailbox) -> Self {
        RelayState {
            config,
            mailbox: Arc::new(Mutex::new(mailbox)),
            wakeups: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    async fn subscribe(&self, user_id: &str) -> broadcast::Receiver<()> {
        let wakeups = self.wakeups.read().await;
        if let Some(tx) = wakeups.get(user_id) {
            return tx.subscribe();
        }
        drop(wakeups);

        let mut wakeups = self.wakeups.write().await;
        let tx = wakeups
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(WAKEUP_CHANNEL_CAPACITY).0);
        tx.subscribe()
    }

    async fn wake(&self, user_id: &str) {
        let wakeups = self.wakeups.read().await;
        if let Some(tx) = wakeups.get(user_id) {
            let _ = tx.send(());
        }
    }

    /// Spawn the recurring TTL sweep.  Stops when `shutdown_rx` fires.
    pub fn start_sweep_task(&self, mut shutdown_rx: tokio::sync::oneshot::Receiver<()>) {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(state.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let cutoff = now_millis().saturating_sub(state.config.ttl.as_millis() as u64);
                        let removed = {
                            let mailbox = state.mailbox.lock().await;
                            mailbox.sweep(cutoff)
                        };
                        match removed {
                            Ok(0) => {}
                            Ok(n) => dlog!("relay: swept {n} expired envelope(s)"),
                            Err(e) => dlog!("relay: sweep failed: {e}"),
                        }
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
        });
    }
}

async fn healthcheck() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Deserialize)]
struct RegisterRequest {
    id: String,
    public_key: Option<String>,
    avatar: Option<String>,
}

async fn register_user(
    State(state): State<RelayState>,
    Json(request): Json<RegisterRequest>,
) -> impl IntoResponse {
    if request.id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "missing id").into_response();
    }

    let record = UserRecord {
        id: request.id.clone(),
        public_key: request.public_key,
        avatar: request.avatar,
        registered_at: now_millis(),
    };
    let mailbox = state.mailbox.lock().await;
    if let Err(e) = mailbox.register_user(&record) {
        dlog!("relay: register failed for {}: {e}", crate::logging::user_id(&request.id));
        return (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response();
    }
    dlog!("relay: registered {}", crate::logging::user_id(&request.id));
    Json(json!({ "success": true })).into_response()
}

async fn lookup_user(
    State(state): State<RelayState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let mailbox = state.mailbox.lock().await;
    match mailbox.get_user(&user_id) {
        Ok(Some(user)) => Json(user).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "unknown user").into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response(),
    }
}

#[derive(Deserialize)]
struct SendRequest {
    to_user_id: String,
    message: Value,
}

async fn queue_send(
    State(state): State<RelayState>,
    Json(request): Json<SendRequest>,
) -> impl IntoResponse {
    if request.to_user_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "missing to_user_id").into_response();
    }
    let message_id = match request.message.get("id").and_then(|v| v.as_str()) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return (StatusCode::BAD_REQUEST, "missing message id").into_response(),
    };

    let payload = request.message.to_string();
    if payload.len() > state.config.max_payload_bytes {
        return (StatusCode::PAYLOAD_TOO_LARGE, "payload exceeds max size").into_response();
    }

    let now = now_millis();
    let entry = QueuedEnvelope {
        id: message_id.clone(),
        to_user: request.to_user_id.clone(),
        payload,
        created_at: request
            .message
            .get("created_at")
            .and_then(|v| v.as_u64())
            .unwrap_or(now),
        enqueued_at: now,
    };

    {
        let mailbox = state.mailbox.lock().await;
        if let Err(e) = mailbox.enqueue(&entry) {
            dlog!("relay: enqueue failed for {}: {e}", crate::logging::msg_id(&message_id));
            return (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response();
        }
    }

    state.wake(&request.to_user_id).await;
    dlog!(
        "relay: queued {} -> {}",
        crate::logging::msg_id(&message_id),
        crate::logging::user_id(&request.to_user_id)
    );
    Json(json!({ "status": "queued" })).into_response()
}

#[derive(Deserialize)]
struct SyncQuery {
    since: Option<u64>,
    /// Nonzero suspends the request until data arrives or the long-poll
    /// timeout elapses.
    wait: Option<u8>,
}

async fn queue_sync(
    State(state): State<RelayState>,
    Path(user_id): Path<String>,
    Query(query): Query<SyncQuery>,
) -> impl IntoResponse {
    let wait = query.wait.unwrap_or(0) != 0;
    let deadline = tokio::time::Instant::now() + state.config.long_poll_timeout;

    // Subscribe before the first read so an enqueue racing this request
    // cannot slip between the read and the wait.
    let mut wakeup = if wait {
        Some(state.subscribe(&user_id).await)
    } else {
        None
    };

    loop {
        let cutoff = now_millis().saturating_sub(state.config.ttl.as_millis() as u64);
        let fetched = {
            let mailbox = state.mailbox.lock().await;
            mailbox.fetch_since(&user_id, query.since, cutoff)
        };
        let entries = match fetched {
            Ok(entries) => entries,
            Err(e) => {
                dlog!("relay: sync failed for {}: {e}", crate::logging::user_id(&user_id));
                return (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response();
            }
        };

        if !entries.is_empty() {
            let payloads: Vec<Value> = entries
                .iter()
                .filter_map(|entry| serde_json::from_str(&entry.payload).ok())
                .collect();
            dlog!(
                "relay: sync delivered {} envelope(s) to {}",
                payloads.len(),
                crate::logging::user_id(&user_id)
            );
            return Json(payloads).into_response();
        }

        let Some(rx) = wakeup.as_mut() else {
            return Json(Vec::<Value>::new()).into_response();
        };

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                return Json(Vec::<Value>::new()).into_response();
            }
            result = rx.recv() => {
                match result {
                    // Woken (or lagged, which still means new data): re-read.
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Json(Vec::<Value>::new()).into_response();
                    }
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct AckRequest {
    user_id: String,
    message_ids: Vec<String>,
}

async fn queue_ack(
    State(state): State<RelayState>,
    Json(request): Json<AckRequest>,
) -> impl IntoResponse {
    if request.user_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "missing user_id").into_response();
    }

    let mailbox = state.mailbox.lock().await;
    match mailbox.ack(&request.user_id, &request.message_ids) {
        Ok(removed) => {
            if removed > 0 {
                dlog!(
                    "relay: acked {removed} envelope(s) for {}",
                    crate::logging::user_id(&request.user_id)
                );
            }
            StatusCode::OK.into_response()
        }
        Err(e) => {
            dlog!("relay: ack failed for {}: {e}", crate::logging::user_id(&request.user_id));
            (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response()
        }
    }
}
