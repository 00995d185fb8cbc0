use std::env;
use std::path::PathBuf;
use std::time::Duration;

use deaddrop::dlog;
use deaddrop::mailbox::Mailbox;
use deaddrop::relay::{app, RelayConfig, RelayState};

#[tokio::main]
async fn main() {
    deaddrop::logging::init();

    let config = RelayConfig {
        ttl: Duration::from_secs(env_u64("DEADDROP_RELAY_TTL_SECS", 3_600)),
        sweep_interval: Duration::from_secs(env_u64("DEADDROP_RELAY_SWEEP_SECS", 600)),
        long_poll_timeout: Duration::from_secs(env_u64("DEADDROP_RELAY_POLL_TIMEOUT_SECS", 25)),
        max_payload_bytes: env_usize("DEADDROP_RELAY_MAX_BYTES", 256 * 1024),
    };

    let db_path = env::var("DEADDROP_RELAY_DB").unwrap_or_else(|_| "deaddrop-relay.db".to_string());
    let mailbox = Mailbox::open(&PathBuf::from(&db_path))
        .unwrap_or_else(|error| panic!("failed to open mailbox {db_path}: {error}"));

    let state = RelayState::new(config, mailbox);
    // Held for the lifetime of the process; dropping it would stop the sweep.
    let (_sweep_shutdown_tx, sweep_shutdown_rx) = tokio::sync::oneshot::channel();
    state.start_sweep_task(sweep_shutdown_rx);

    let app = app(state);
    let bind = env::var("DEADDROP_RELAY_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .unwrap_or_else(|error| panic!("failed to bind {bind}: {error}"));
    dlog!("relay: listening on {bind}, mailbox at {db_path}");

    axum::serve(listener, app)
        .await
        .unwrap_or_else(|error| panic!("server error: {error}"));
}

fn env_u64(key: &str, default_value: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default_value)
}

fn env_usize(key: &str, default_value: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default_value)
}
