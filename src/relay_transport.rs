//! Client-side relay HTTP operations.
//!
//! Blocking `ureq` calls; async callers wrap these in `spawn_blocking`.  The
//! sync call with `wait` set may legitimately hang for the relay's long-poll
//! window (~25 s), which stays inside ureq's defaults.

use serde_json::json;

use crate::protocol::Envelope;

#[derive(Debug)]
pub enum RelayClientError {
    /// Transport-level failure: connect refused, timeout, DNS.
    Http(String),
    /// The relay answered with a non-2xx status.
    Status(u16),
    /// The relay answered 2xx but the body made no sense.
    Protocol(String),
}

impl std::fmt::Display for RelayClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayClientError::Http(error) => write!(f, "http error: {error}"),
            RelayClientError::Status(code) => write!(f, "relay error: {code}"),
            RelayClientError::Protocol(error) => write!(f, "protocol error: {error}"),
        }
    }
}

impl std::error::Error for RelayClientError {}

fn map_ureq(error: ureq::Error) -> RelayClientError {
    match error {
        ureq::Error::Status(code, _) => RelayClientError::Status(code),
        other => RelayClientError::Http(other.to_string()),
    }
}

/// Enqueue an envelope for `to_user` at the relay.
pub fn post_enqueue(
    relay_url: &str,
    to_user: &str,
    envelope: &Envelope,
) -> Result<(), RelayClientError> {
    let url = format!("{}/queue/send", relay_url.trim_end_matches('/'));
    let message = serde_json::to_value(envelope)
        .map_err(|e| RelayClientError::Protocol(format!("serialize envelope: {e}")))?;
    ureq::post(&url)
        .send_json(json!({ "to_user_id": to_user, "message": message }))
        .map_err(map_ureq)?;
    Ok(())
}

/// Fetch queued envelopes for `user_id`, optionally only those newer than
/// `since`, optionally long-polling until data arrives or the relay's
/// timeout elapses.
pub fn fetch_sync(
    relay_url: &str,
    user_id: &str,
    since: Option<u64>,
    wait: bool,
) -> Result<Vec<Envelope>, RelayClientError> {
    let base = relay_url.trim_end_matches('/');
    let mut url = format!("{base}/queue/sync/{user_id}");
    let mut sep = '?';
    if let Some(since) = since {
        url.push_str(&format!("{sep}since={since}"));
        sep = '&';
    }
    if wait {
        url.push_str(&format!("{sep}wait=1"));
    }
    let response = ureq::get(&url).call().map_err(map_ureq)?;
    response
        .into_json()
        .map_err(|e| RelayClientError::Protocol(format!("deserialize sync: {e}")))
}

/// Acknowledge (delete) consumed envelopes.  Safe to repeat.
pub fn post_ack(
    relay_url: &str,
    user_id: &str,
    message_ids: &[String],
) -> Result<(), RelayClientError> {
    let url = format!("{}/queue/ack", relay_url.trim_end_matches('/'));
    ureq::post(&url)
        .send_json(json!({ "user_id": user_id, "message_ids": message_ids }))
        .map_err(map_ureq)?;
    Ok(())
}

/// Register identity metadata with the relay.
pub fn post_register(
    relay_url: &str,
    user_id: &str,
    public_key: Option<&str>,
) -> Result<(), RelayClientError> {
    let url = format!("{}/register", relay_url.trim_end_matches('/'));
    ureq::post(&url)
        .send_json(json!({ "id": user_id, "public_key": public_key }))
        .map_err(map_ureq)?;
    Ok(())
}
