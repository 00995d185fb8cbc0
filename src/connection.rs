//! Direct-transport connection management.
//!
//! A transport can report "open" while the remote end is already gone, so the
//! manager distinguishes an open socket from a verified, usable link: right
//! after a session opens it sends a liveness probe and only the matching
//! reply promotes the link to `Verified`.  While verified, a heartbeat keeps
//! probing; a missed reply window or any send failure demotes the link to
//! `Broken`, which is also where silent network loss ends up.
//!
//! The session itself comes from an opaque [`Rendezvous`] service that maps a
//! peer identity to a [`TransportSession`] (a pair of frame channels).  A
//! WebSocket-backed implementation is provided; tests wire two managers
//! together with [`memory_link`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::dlog;
use crate::protocol::Frame;

/// Connection lifecycle.  Owned by the [`ConnectionManager`]; everyone else
/// only reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    /// Transport reports open, liveness not yet confirmed.
    Open,
    /// Liveness confirmed; the direct path is usable.
    Verified,
    /// Dead or presumed dead; waiting for an explicit retry.
    Broken,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Probe interval while the link is up.
    pub ping_interval: Duration,
    /// Demote to `Broken` when no liveness reply lands within this window.
    pub pong_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            ping_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(15),
        }
    }
}

/// One established direct link: frames out, frames in.
pub struct TransportSession {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

#[derive(Debug)]
pub enum ConnectError {
    /// The rendezvous service could not produce a session.
    Broker(String),
    /// No peer is remembered for a retry.
    NoPeer,
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::Broker(error) => write!(f, "broker error: {error}"),
            ConnectError::NoPeer => write!(f, "no remembered peer"),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Maps a peer identity to a transport session.  The signaling broker behind
/// it is out of scope; implementations only promise to hand back a live
/// session or an error.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    async fn open_session(
        &self,
        local_id: &str,
        peer_id: &str,
    ) -> Result<TransportSession, ConnectError>;
}

const SESSION_CHANNEL_CAPACITY: usize = 64;

/// Build two crossed in-process sessions, each end seeing the other's frames.
pub fn memory_link() -> (TransportSession, TransportSession) {
    let (a_tx, b_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
    let (b_tx, a_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
    (
        TransportSession {
            outbound: a_tx,
            inbound: a_rx,
        },
        TransportSession {
            outbound: b_tx,
            inbound: b_rx,
        },
    )
}

/// In-process rendezvous handing out pre-arranged sessions, for tests and
/// demos that stand in for a real broker.
#[derive(Default)]
pub struct ChannelRendezvous {
    sessions: tokio::sync::Mutex<std::collections::VecDeque<TransportSession>>,
}

impl ChannelRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_session(&self, session: TransportSession) {
        self.sessions.lock().await.push_back(session);
    }
}

#[async_trait]
impl Rendezvous for ChannelRendezvous {
    async fn open_session(
        &self,
        _local_id: &str,
        _peer_id: &str,
    ) -> Result<TransportSession, ConnectError> {
        self.sessions
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| ConnectError::Broker("no session available".to_string()))
    }
}

/// Rendezvous over a WebSocket broker: frames travel as JSON text messages on
/// `ws(s)://broker/session/<local>/<peer>`.
pub struct WsRendezvous {
    broker_url: String,
}

impl WsRendezvous {
    pub fn new(broker_url: impl Into<String>) -> Self {
        WsRendezvous {
            broker_url: broker_url.into(),
        }
    }

    fn session_url(&self, local_id: &str, peer_id: &str) -> String {
        let base = self
            .broker_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/session/{local_id}/{peer_id}", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl Rendezvous for WsRendezvous {
    async fn open_session(
        &self,
        local_id: &str,
        peer_id: &str,
    ) -> Result<TransportSession, ConnectError> {
        let url = self.session_url(local_id, peer_id);
        let (ws_stream, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| ConnectError::Broker(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(SESSION_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(SESSION_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(_) => continue,
                };
                if write.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => {
                        let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
                            dlog!("transport: dropping unparseable frame");
                            continue;
                        };
                        if in_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Ok(TransportSession {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

struct ConnInner {
    peer_id: Option<String>,
    outbound: Option<mpsc::Sender<Frame>>,
    stop_tx: Option<oneshot::Sender<()>>,
    session_alive: Arc<AtomicBool>,
}

/// Supervises one peer relationship.  Constructed and torn down by the
/// hosting application; no process-wide singleton.
pub struct ConnectionManager {
    local_id: String,
    config: ConnectionConfig,
    rendezvous: Arc<dyn Rendezvous>,
    phase_tx: watch::Sender<Phase>,
    frames_tx: mpsc::Sender<Frame>,
    inner: Mutex<ConnInner>,
}

impl ConnectionManager {
    /// Returns the manager plus the receiver on which non-liveness frames
    /// from the peer arrive (consumed by the delivery pipeline).
    pub fn new(
        local_id: impl Into<String>,
        rendezvous: Arc<dyn Rendezvous>,
        config: ConnectionConfig,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (phase_tx, _) = watch::channel(Phase::Disconnected);
        let (frames_tx, frames_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let manager = Arc::new(ConnectionManager {
            local_id: local_id.into(),
            config,
            rendezvous,
            phase_tx,
            frames_tx,
            inner: Mutex::new(ConnInner {
                peer_id: None,
                outbound: None,
                stop_tx: None,
                session_alive: Arc::new(AtomicBool::new(false)),
            }),
        });
        (manager, frames_rx)
    }

    pub fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    pub fn peer_id(&self) -> Option<String> {
        self.inner.lock().unwrap().peer_id.clone()
    }

    /// Open a session to `peer_id` and start supervising it.  On success the
    /// phase passes through `Open` and reaches `Verified` once the peer
    /// answers the initial liveness probe.
    pub async fn connect_to_peer(&self, peer_id: &str) -> Result<(), ConnectError> {
        self.stop_current_session();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.peer_id = Some(peer_id.to_string());
        }
        self.phase_tx.send_replace(Phase::Connecting);
        dlog!(
            "conn: connecting to {}",
            crate::logging::user_id(peer_id)
        );

        let session = match self.rendezvous.open_session(&self.local_id, peer_id).await {
            Ok(session) => session,
            Err(error) => {
                dlog!("conn: connect failed: {error}");
                self.phase_tx.send_replace(Phase::Broken);
                return Err(error);
            }
        };
        self.adopt_session(session);
        Ok(())
    }

    /// Explicit re-attempt from `Broken`, reusing the remembered peer.
    pub async fn retry_connection(&self) -> Result<(), ConnectError> {
        let peer_id = self
            .inner
            .lock()
            .unwrap()
            .peer_id
            .clone()
            .ok_or(ConnectError::NoPeer)?;
        self.connect_to_peer(&peer_id).await
    }

    /// Close the transport and forget the peer.  Terminal until a new
    /// connect is requested.
    pub fn unlink(&self) {
        self.stop_current_session();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.peer_id = None;
            inner.outbound = None;
        }
        self.phase_tx.send_replace(Phase::Disconnected);
        dlog!("conn: unlinked");
    }

    /// Called when the hosting application returns to the foreground.  If a
    /// peer is remembered but the session task has died (backgrounding often
    /// kills sockets without a close event), force `Broken` so the relay
    /// fallback engages immediately instead of after a heartbeat timeout.
    pub fn notify_resumed(&self) {
        let (has_peer, alive) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.peer_id.is_some(),
                inner.session_alive.load(Ordering::SeqCst),
            )
        };
        if has_peer && !alive && self.phase() != Phase::Disconnected {
            dlog!("conn: resumed with dead transport, marking broken");
            self.phase_tx.send_replace(Phase::Broken);
        }
    }

    /// Hand a frame to the live session.  Any failure demotes the link to
    /// `Broken` and surfaces an error so the caller can fall back to the
    /// relay.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), ConnectError> {
        let outbound = {
            let inner = self.inner.lock().unwrap();
            inner.outbound.clone()
        };
        let Some(outbound) = outbound else {
            return Err(ConnectError::Broker("no live session".to_string()));
        };
        if outbound.send(frame).await.is_err() {
            self.mark_broken();
            return Err(ConnectError::Broker("transport write failed".to_string()));
        }
        Ok(())
    }

    fn mark_broken(&self) {
        // Unlink wins over any late failure report.
        if self.phase() != Phase::Disconnected {
            self.phase_tx.send_replace(Phase::Broken);
        }
    }

    fn stop_current_session(&self) {
        let stop_tx = {
            let mut inner = self.inner.lock().unwrap();
            inner.session_alive.store(false, Ordering::SeqCst);
            inner.outbound = None;
            inner.stop_tx.take()
        };
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(());
        }
    }

    fn adopt_session(&self, session: TransportSession) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let alive = Arc::new(AtomicBool::new(true));
        {
            let mut inner = self.inner.lock().unwrap();
            inner.outbound = Some(session.outbound.clone());
            inner.stop_tx = Some(stop_tx);
            inner.session_alive = alive.clone();
        }
        self.phase_tx.send_replace(Phase::Open);

        let phase_tx = self.phase_tx.clone();
        let frames_tx = self.frames_tx.clone();
        let config = self.config.clone();
        tokio::spawn(run_session(
            session,
            stop_rx,
            alive,
            phase_tx,
            frames_tx,
            config,
        ));
    }
}

/// One session's supervisor: answers pings, promotes to `Verified` on the
/// first pong, runs the heartbeat, and forwards everything else to the
/// pipeline.  Exits on unlink, transport closure, or liveness timeout.
async fn run_session(
    session: TransportSession,
    mut stop_rx: oneshot::Receiver<()>,
    alive: Arc<AtomicBool>,
    phase_tx: watch::Sender<Phase>,
    frames_tx: mpsc::Sender<Frame>,
    config: ConnectionConfig,
) {
    let TransportSession {
        outbound,
        mut inbound,
    } = session;

    let broken = |phase_tx: &watch::Sender<Phase>| {
        if *phase_tx.borrow() != Phase::Disconnected {
            phase_tx.send_replace(Phase::Broken);
        }
    };

    // Verification probe: only the reply proves the remote end is there.
    if outbound.send(Frame::LivenessPing).await.is_err() {
        broken(&phase_tx);
        alive.store(false, Ordering::SeqCst);
        return;
    }

    let mut last_reply = Instant::now();
    let mut ticker = tokio::time::interval(config.ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                break;
            }
            frame = inbound.recv() => {
                match frame {
                    None => {
                        dlog!("conn: transport closed");
                        broken(&phase_tx);
                        break;
                    }
                    Some(Frame::LivenessPing) => {
                        if outbound.send(Frame::LivenessPong).await.is_err() {
                            broken(&phase_tx);
                            break;
                        }
                    }
                    Some(Frame::LivenessPong) => {
                        last_reply = Instant::now();
                        if *phase_tx.borrow() == Phase::Open {
                            dlog!("conn: link verified");
                            phase_tx.send_replace(Phase::Verified);
                        }
                    }
                    Some(other) => {
                        if frames_tx.send(other).await.is_err() {
                            break;
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                if last_reply.elapsed() > config.pong_timeout {
                    dlog!("conn: liveness timeout, marking broken");
                    broken(&phase_tx);
                    break;
                }
                if outbound.send(Frame::LivenessPing).await.is_err() {
                    dlog!("conn: probe write failed, marking broken");
                    broken(&phase_tx);
                    break;
                }
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
}
