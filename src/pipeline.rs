//! The send/receive API consumed by the hosting application.
//!
//! All mutable delivery state (outbox, seen-id set, chunk reassembly buffers)
//! is owned by a single actor task and mutated only from its event loop, so
//! there is no shared-memory concurrency to guard.  The actor multiplexes
//! four sources: caller commands, direct-transport frames, relay poll
//! batches, and connection phase changes.
//!
//! Send policy: try the verified direct path first; any write failure demotes
//! the link and falls through to the relay; a relay failure leaves the
//! message `Pending`, to be retried on the next verified link or relay
//! opportunity.  Nothing is ever dropped on the sending side.
//!
//! Both receive paths converge on one ingest step: decrypt, drop on failure,
//! deduplicate against the durable seen-id set, then surface the message.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::connection::{ConnectionManager, Phase};
use crate::crypto::ConversationKey;
use crate::dlog;
use crate::protocol::{
    now_millis, open_envelope, seal_message, split_into_chunks, ChunkAssembler, DeliveryStatus,
    Envelope, Frame, Message, MessageId, MessageKind, CHUNK_THRESHOLD,
};
use crate::relay_transport::{fetch_sync, post_ack, post_enqueue};
use crate::storage::{ClientStore, StoreError};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub relay_url: String,
    /// Bodies above this go chunked over the direct transport.
    pub chunk_threshold: usize,
    /// Long-poll the relay (`true`, production) or plain-poll with a pause
    /// between rounds (`false`, useful under test).
    pub poll_wait: bool,
    /// Pause between poll rounds when not long-polling, and after a relay
    /// error either way.
    pub poll_retry_delay: Duration,
    /// Incomplete chunk transfers older than this are abandoned.
    pub transfer_max_age: Duration,
}

impl PipelineConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        PipelineConfig {
            relay_url: relay_url.into(),
            chunk_threshold: CHUNK_THRESHOLD,
            poll_wait: true,
            poll_retry_delay: Duration::from_secs(3),
            transfer_max_age: Duration::from_secs(120),
        }
    }
}

/// What the pipeline reports back to the hosting application.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A new inbound message (already deduplicated and persisted).
    Received(Message),
    /// An outbound message moved forward.
    StatusChanged {
        id: MessageId,
        status: DeliveryStatus,
    },
    /// Out-of-band profile/control frame from the peer, passed through for
    /// the hosting application to interpret.
    Control(serde_json::Value),
}

#[derive(Debug)]
pub enum PipelineError {
    Store(StoreError),
    /// The pipeline task is gone.
    Closed,
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Store(error) => write!(f, "store error: {error}"),
            PipelineError::Closed => write!(f, "pipeline closed"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<StoreError> for PipelineError {
    fn from(error: StoreError) -> Self {
        PipelineError::Store(error)
    }
}

enum PipelineCommand {
    Send {
        kind: MessageKind,
        body: String,
        reply: oneshot::Sender<Result<Message, PipelineError>>,
    },
    MarkDelivered {
        id: MessageId,
        reply: oneshot::Sender<Result<(), PipelineError>>,
    },
    Feed {
        reply: oneshot::Sender<Result<Vec<Message>, PipelineError>>,
    },
    Status {
        id: MessageId,
        reply: oneshot::Sender<Result<Option<DeliveryStatus>, PipelineError>>,
    },
}

/// Cloneable handle to the pipeline actor.
#[derive(Clone)]
pub struct DeliveryPipeline {
    commands: mpsc::Sender<PipelineCommand>,
}

impl DeliveryPipeline {
    /// Fire-and-forget send with observable status: the returned message is
    /// already persisted as `Pending` and visible; delivery continues in the
    /// background.
    pub async fn send(&self, kind: MessageKind, body: String) -> Result<Message, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(PipelineCommand::Send { kind, body, reply })
            .await
            .map_err(|_| PipelineError::Closed)?;
        rx.await.map_err(|_| PipelineError::Closed)?
    }

    /// Record an external delivery receipt for one of our messages.
    pub async fn mark_delivered(&self, id: MessageId) -> Result<(), PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(PipelineCommand::MarkDelivered { id, reply })
            .await
            .map_err(|_| PipelineError::Closed)?;
        rx.await.map_err(|_| PipelineError::Closed)?
    }

    /// Received messages in sender-timestamp order.
    pub async fn feed(&self) -> Result<Vec<Message>, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(PipelineCommand::Feed { reply })
            .await
            .map_err(|_| PipelineError::Closed)?;
        rx.await.map_err(|_| PipelineError::Closed)?
    }

    /// Current delivery status of an outbound message.
    pub async fn message_status(
        &self,
        id: MessageId,
    ) -> Result<Option<DeliveryStatus>, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(PipelineCommand::Status { id, reply })
            .await
            .map_err(|_| PipelineError::Closed)?;
        rx.await.map_err(|_| PipelineError::Closed)?
    }
}

struct PolledBatch {
    envelopes: Vec<Envelope>,
    watermark: u64,
}

/// Start the pipeline for one conversation.  Returns the command handle and
/// the event stream.
pub fn spawn(
    local_id: impl Into<String>,
    peer_id: impl Into<String>,
    key: ConversationKey,
    store: ClientStore,
    conn: Arc<ConnectionManager>,
    frames_rx: mpsc::Receiver<Frame>,
    config: PipelineConfig,
) -> Result<(DeliveryPipeline, mpsc::Receiver<PipelineEvent>), PipelineError> {
    let local_id = local_id.into();
    let peer_id = peer_id.into();

    let (commands_tx, commands_rx) = mpsc::channel(32);
    let (events_tx, events_rx) = mpsc::channel(64);
    let (batches_tx, batches_rx) = mpsc::channel(8);

    let initial_since = store.last_sync()?;
    let last_created = store.last_created_at()?;
    store.set_last_peer(&peer_id)?;

    tokio::spawn(run_relay_poll(
        config.relay_url.clone(),
        local_id.clone(),
        initial_since,
        config.poll_wait,
        config.poll_retry_delay,
        batches_tx,
    ));

    let phase_rx = conn.subscribe_phase();
    let actor = PipelineActor {
        local_id,
        peer_id,
        key,
        store,
        conn,
        config,
        assembler: ChunkAssembler::new(),
        events_tx,
        last_created,
    };
    tokio::spawn(actor.run(commands_rx, frames_rx, batches_rx, phase_rx));

    Ok((
        DeliveryPipeline {
            commands: commands_tx,
        },
        events_rx,
    ))
}

/// Recurring relay poll: fetch, hand the batch to the actor, then ack every
/// fetched id — decryptable or not, so a permanently undecryptable entry is
/// never left to retry forever.
async fn run_relay_poll(
    relay_url: String,
    user_id: String,
    initial_since: u64,
    wait: bool,
    retry_delay: Duration,
    batches_tx: mpsc::Sender<PolledBatch>,
) {
    let mut since = initial_since;
    loop {
        if batches_tx.is_closed() {
            return;
        }

        let fetch = {
            let relay_url = relay_url.clone();
            let user_id = user_id.clone();
            tokio::task::spawn_blocking(move || {
                fetch_sync(&relay_url, &user_id, Some(since), wait)
            })
            .await
        };

        let envelopes = match fetch {
            Ok(Ok(envelopes)) => envelopes,
            Ok(Err(error)) => {
                dlog!("poll: relay unreachable, retrying: {error}");
                tokio::time::sleep(retry_delay).await;
                continue;
            }
            Err(_) => return,
        };

        if envelopes.is_empty() {
            if !wait {
                tokio::time::sleep(retry_delay).await;
            }
            continue;
        }

        let ids: Vec<String> = envelopes.iter().map(|e| e.id.0.clone()).collect();
        since = envelopes
            .iter()
            .map(|e| e.created_at)
            .max()
            .unwrap_or(since)
            .max(since);

        let batch = PolledBatch {
            envelopes,
            watermark: since,
        };
        if batches_tx.send(batch).await.is_err() {
            return;
        }

        let ack = {
            let relay_url = relay_url.clone();
            let user_id = user_id.clone();
            tokio::task::spawn_blocking(move || post_ack(&relay_url, &user_id, &ids)).await
        };
        match ack {
            Ok(Ok(())) => {}
            // Failed acks are safe: the entries come back next round and the
            // seen-id set absorbs them.
            Ok(Err(error)) => dlog!("poll: ack failed: {error}"),
            Err(_) => return,
        }
    }
}

struct PipelineActor {
    local_id: String,
    peer_id: String,
    key: ConversationKey,
    store: ClientStore,
    conn: Arc<ConnectionManager>,
    config: PipelineConfig,
    assembler: ChunkAssembler,
    events_tx: mpsc::Sender<PipelineEvent>,
    last_created: u64,
}

impl PipelineActor {
    async fn run(
        mut self,
        mut commands_rx: mpsc::Receiver<PipelineCommand>,
        mut frames_rx: mpsc::Receiver<Frame>,
        mut batches_rx: mpsc::Receiver<PolledBatch>,
        mut phase_rx: watch::Receiver<Phase>,
    ) {
        loop {
            tokio::select! {
                command = commands_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                Some(frame) = frames_rx.recv() => {
                    self.handle_frame(frame).await;
                }
                Some(batch) = batches_rx.recv() => {
                    self.handle_batch(batch).await;
                }
                result = phase_rx.changed() => {
                    if result.is_err() {
                        break;
                    }
                    let phase = *phase_rx.borrow_and_update();
                    if phase == Phase::Verified {
                        self.flush_pending().await;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: PipelineCommand) {
        match command {
            PipelineCommand::Send { kind, body, reply } => {
                let message = match self.accept_send(kind, body) {
                    Ok(message) => message,
                    Err(error) => {
                        let _ = reply.send(Err(error));
                        return;
                    }
                };
                // Visible to the caller immediately; dispatch continues after.
                let _ = reply.send(Ok(message.clone()));
                self.dispatch(&message).await;
            }
            PipelineCommand::MarkDelivered { id, reply } => {
                let result = self.promote(&id, DeliveryStatus::Delivered).await;
                let _ = reply.send(result);
            }
            PipelineCommand::Feed { reply } => {
                let _ = reply.send(self.store.list_feed().map_err(PipelineError::Store));
            }
            PipelineCommand::Status { id, reply } => {
                let _ = reply.send(self.store.message_status(&id).map_err(PipelineError::Store));
            }
        }
    }

    fn accept_send(&mut self, kind: MessageKind, body: String) -> Result<Message, PipelineError> {
        self.last_created = now_millis().max(self.last_created + 1);
        let message = Message::new(
            &self.local_id,
            &self.peer_id,
            kind,
            body,
            self.last_created,
        );
        self.store.insert_outbox(&message)?;
        Ok(message)
    }

    async fn dispatch(&mut self, message: &Message) {
        if self.conn.phase() == Phase::Verified {
            match self.send_direct(message).await {
                Ok(()) => {
                    let _ = self.promote(&message.id, DeliveryStatus::Sent).await;
                    return;
                }
                Err(()) => {
                    // send_frame already demoted the link; fall through.
                    dlog!(
                        "send: direct path failed for {}, falling back to relay",
                        crate::logging::msg_id(&message.id.0)
                    );
                }
            }
        }
        self.enqueue_at_relay(message).await;
    }

    async fn send_direct(&mut self, message: &Message) -> Result<(), ()> {
        if message.body.len() > self.config.chunk_threshold {
            let frames = match split_into_chunks(&self.key, message) {
                Ok(frames) => frames,
                Err(error) => {
                    dlog!("send: chunking failed: {error}");
                    return Err(());
                }
            };
            for frame in frames {
                self.conn.send_frame(frame).await.map_err(|_| ())?;
                // Keep the heartbeat and inbound frames moving between slices.
                tokio::task::yield_now().await;
            }
        } else {
            let envelope = match seal_message(&self.key, message) {
                Ok(envelope) => envelope,
                Err(error) => {
                    dlog!("send: seal failed: {error}");
                    return Err(());
                }
            };
            self.conn
                .send_frame(Frame::Message { envelope })
                .await
                .map_err(|_| ())?;
        }
        Ok(())
    }

    async fn enqueue_at_relay(&mut self, message: &Message) {
        let envelope = match seal_message(&self.key, message) {
            Ok(envelope) => envelope,
            Err(error) => {
                dlog!("send: seal failed, leaving pending: {error}");
                return;
            }
        };
        let relay_url = self.config.relay_url.clone();
        let to_user = message.recipient_id.clone();
        let result =
            tokio::task::spawn_blocking(move || post_enqueue(&relay_url, &to_user, &envelope))
                .await;
        match result {
            Ok(Ok(())) => {
                dlog!(
                    "send: relayed {} -> {}",
                    crate::logging::msg_id(&message.id.0),
                    crate::logging::user_id(&message.recipient_id)
                );
                let _ = self.promote(&message.id, DeliveryStatus::Sent).await;
            }
            Ok(Err(error)) => {
                dlog!(
                    "send: relay unavailable, {} stays pending: {error}",
                    crate::logging::msg_id(&message.id.0)
                );
            }
            Err(_) => {}
        }
    }

    /// Retry everything still pending over the now-verified direct link.
    async fn flush_pending(&mut self) {
        let pending = match self.store.list_pending() {
            Ok(pending) => pending,
            Err(error) => {
                dlog!("flush: cannot list pending: {error}");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        dlog!("flush: retrying {} pending message(s)", pending.len());
        for message in pending {
            if self.conn.phase() != Phase::Verified {
                break;
            }
            if self.send_direct(&message).await.is_ok() {
                let _ = self.promote(&message.id, DeliveryStatus::Sent).await;
            } else {
                break;
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Message { envelope } => self.ingest_envelope(&envelope).await,
            Frame::ChunkStart { header } => {
                self.assembler.prune(self.config.transfer_max_age);
                if let Some(message) = self.assembler.accept_start(&self.key, &header) {
                    self.ingest_message(message).await;
                }
            }
            Frame::Chunk {
                id,
                index,
                total,
                data,
            } => {
                if let Some(message) =
                    self.assembler.accept_chunk(&self.key, &id, index, total, &data)
                {
                    self.ingest_message(message).await;
                }
            }
            Frame::Control { payload } => {
                let _ = self.events_tx.send(PipelineEvent::Control(payload)).await;
            }
            // Liveness frames are consumed by the connection manager.
            Frame::LivenessPing | Frame::LivenessPong => {}
        }
    }

    async fn handle_batch(&mut self, batch: PolledBatch) {
        for envelope in &batch.envelopes {
            self.ingest_envelope(envelope).await;
        }
        if let Err(error) = self.store.set_last_sync(batch.watermark) {
            dlog!("poll: cannot persist sync watermark: {error}");
        }
    }

    async fn ingest_envelope(&mut self, envelope: &Envelope) {
        match open_envelope(&self.key, envelope) {
            Ok(message) => self.ingest_message(message).await,
            Err(error) => {
                dlog!(
                    "ingest: discarding undecryptable {}: {error}",
                    crate::logging::msg_id(&envelope.id.0)
                );
            }
        }
    }

    /// The single funnel both receive paths converge on.
    async fn ingest_message(&mut self, message: Message) {
        match self.store.has_seen(&message.id) {
            Ok(true) => {
                dlog!(
                    "ingest: duplicate {}, dropping",
                    crate::logging::msg_id(&message.id.0)
                );
                return;
            }
            Ok(false) => {}
            Err(error) => {
                dlog!("ingest: seen-id check failed: {error}");
                return;
            }
        }
        let now = now_millis();
        if let Err(error) = self.store.record_seen(&message.id, now) {
            dlog!("ingest: cannot record seen id: {error}");
            return;
        }
        if let Err(error) = self.store.insert_feed(&message, now) {
            dlog!("ingest: cannot persist message: {error}");
            return;
        }
        dlog!(
            "ingest: received {} from {}",
            crate::logging::msg_id(&message.id.0),
            crate::logging::user_id(&message.sender_id)
        );
        let _ = self.events_tx.send(PipelineEvent::Received(message)).await;
    }

    async fn promote(
        &mut self,
        id: &MessageId,
        status: DeliveryStatus,
    ) -> Result<(), PipelineError> {
        if let Some(new_status) = self.store.advance_status(id, status)? {
            let _ = self
                .events_tx
                .send(PipelineEvent::StatusChanged {
                    id: id.clone(),
                    status: new_status,
                })
                .await;
        }
        Ok(())
    }
}
