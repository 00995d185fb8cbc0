//! Wire and domain types for two-party delivery.
//!
//! ## Overview
//! - [`Message`] is the unit of conversation content; its `id` is a salted
//!   content hash assigned once at creation and never mutated.
//! - [`Envelope`] binds the routing header fields (clear) to a sealed body and
//!   is the unit shipped over both the direct transport and the relay.
//! - [`Frame`] is the direct-transport framing: liveness probes, chunk
//!   transfer frames, and whole-message envelopes, discriminated by a `type`
//!   tag.
//! - Payloads above [`CHUNK_THRESHOLD`] are split into [`CHUNK_SIZE`] slices,
//!   each sealed independently and tagged `(transfer_id, index, total)`, so
//!   no single encryption call holds the whole payload and slices may arrive
//!   in any order.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{open, seal, ConversationKey, CryptoError};
use crate::dlog;

/// Payloads larger than this are sent chunked over the direct transport.
pub const CHUNK_THRESHOLD: usize = 32 * 1024;

/// Size of each independently sealed slice.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A unique message identifier derived from content plus a random salt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Compute an ID from arbitrary bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        MessageId(URL_SAFE_NO_PAD.encode(digest))
    }

    /// Compute a fresh ID for `body`, salted so identical bodies still get
    /// distinct IDs.
    pub fn salted(body: &str) -> Self {
        let mut salt = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let mut bytes = Vec::with_capacity(body.len() + salt.len());
        bytes.extend_from_slice(body.as_bytes());
        bytes.extend_from_slice(&salt);
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kinds of conversation content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Reaction,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Audio => "audio",
            MessageKind::Reaction => "reaction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "video" => Some(MessageKind::Video),
            "audio" => Some(MessageKind::Audio),
            "reaction" => Some(MessageKind::Reaction),
            _ => None,
        }
    }
}

/// Client-local delivery state.  Transitions are monotonic: a message never
/// moves backwards from `Delivered` or `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
}

impl DeliveryStatus {
    fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Pending => 0,
            DeliveryStatus::Sent => 1,
            DeliveryStatus::Delivered => 2,
        }
    }

    /// Advance to `next` only if it is a forward transition.
    pub fn advance(self, next: DeliveryStatus) -> DeliveryStatus {
        if next.rank() > self.rank() {
            next
        } else {
            self
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            _ => None,
        }
    }
}

/// The unit of conversation content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: String,
    pub recipient_id: String,
    pub kind: MessageKind,
    /// Text or reaction content; base64 payload reference for media kinds.
    pub body: String,
    /// Sender-assigned milliseconds, monotonic per sender.
    pub created_at: u64,
    pub delivery_status: DeliveryStatus,
}

impl Message {
    /// Build a new outbound message in the `Pending` state with a fresh ID.
    pub fn new(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        kind: MessageKind,
        body: impl Into<String>,
        created_at: u64,
    ) -> Self {
        let body = body.into();
        Message {
            id: MessageId::salted(&body),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            kind,
            body,
            created_at,
            delivery_status: DeliveryStatus::Pending,
        }
    }
}

/// A sealed blob on the wire: base64 nonce plus base64 ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SealedPayload {
    pub nonce_b64: String,
    pub ciphertext_b64: String,
}

impl SealedPayload {
    fn from_parts(nonce: &[u8], ciphertext: &[u8]) -> Self {
        SealedPayload {
            nonce_b64: URL_SAFE_NO_PAD.encode(nonce),
            ciphertext_b64: URL_SAFE_NO_PAD.encode(ciphertext),
        }
    }

    fn decode(&self) -> Result<(Vec<u8>, Vec<u8>), base64::DecodeError> {
        let nonce = URL_SAFE_NO_PAD.decode(self.nonce_b64.as_bytes())?;
        let ciphertext = URL_SAFE_NO_PAD.decode(self.ciphertext_b64.as_bytes())?;
        Ok((nonce, ciphertext))
    }
}

/// Routing header in the clear, content sealed.  The unit accepted by the
/// relay and carried whole over the direct transport for small payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Envelope {
    pub id: MessageId,
    pub sender_id: String,
    pub recipient_id: String,
    pub created_at: u64,
    pub payload: SealedPayload,
}

/// Sealed content of a single-frame message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
struct CipherBody {
    kind: MessageKind,
    body: String,
}

#[derive(Debug)]
pub enum EnvelopeError {
    Crypto(CryptoError),
    Serde(serde_json::Error),
    Base64(base64::DecodeError),
    Utf8(std::string::FromUtf8Error),
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::Crypto(error) => write!(f, "crypto error: {error}"),
            EnvelopeError::Serde(error) => write!(f, "serde error: {error}"),
            EnvelopeError::Base64(error) => write!(f, "base64 error: {error}"),
            EnvelopeError::Utf8(error) => write!(f, "utf-8 error: {error}"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl From<CryptoError> for EnvelopeError {
    fn from(error: CryptoError) -> Self {
        EnvelopeError::Crypto(error)
    }
}

impl From<serde_json::Error> for EnvelopeError {
    fn from(error: serde_json::Error) -> Self {
        EnvelopeError::Serde(error)
    }
}

impl From<base64::DecodeError> for EnvelopeError {
    fn from(error: base64::DecodeError) -> Self {
        EnvelopeError::Base64(error)
    }
}

impl From<std::string::FromUtf8Error> for EnvelopeError {
    fn from(error: std::string::FromUtf8Error) -> Self {
        EnvelopeError::Utf8(error)
    }
}

fn envelope_aad(id: &MessageId, sender: &str, recipient: &str, created_at: u64) -> Vec<u8> {
    format!("{}|{}|{}|{}", id.0, sender, recipient, created_at).into_bytes()
}

/// Seal a message's kind and body into an [`Envelope`], binding the header
/// fields as associated data so they cannot be swapped in transit.
pub fn seal_message(key: &ConversationKey, message: &Message) -> Result<Envelope, EnvelopeError> {
    let plaintext = serde_json::to_vec(&CipherBody {
        kind: message.kind,
        body: message.body.clone(),
    })?;
    let aad = envelope_aad(
        &message.id,
        &message.sender_id,
        &message.recipient_id,
        message.created_at,
    );
    let (nonce, ciphertext) = seal(key, &plaintext, &aad, None)?;
    Ok(Envelope {
        id: message.id.clone(),
        sender_id: message.sender_id.clone(),
        recipient_id: message.recipient_id.clone(),
        created_at: message.created_at,
        payload: SealedPayload::from_parts(&nonce, &ciphertext),
    })
}

/// Open an [`Envelope`] back into a [`Message`].
///
/// The reconstructed message carries `Delivered` status: status is never
/// transmitted, only derived on the receiving side.
pub fn open_envelope(key: &ConversationKey, envelope: &Envelope) -> Result<Message, EnvelopeError> {
    let (nonce, ciphertext) = envelope.payload.decode()?;
    let aad = envelope_aad(
        &envelope.id,
        &envelope.sender_id,
        &envelope.recipient_id,
        envelope.created_at,
    );
    let plaintext = open(key, &nonce, &ciphertext, &aad)?;
    let content: CipherBody = serde_json::from_slice(&plaintext)?;
    Ok(Message {
        id: envelope.id.clone(),
        sender_id: envelope.sender_id.clone(),
        recipient_id: envelope.recipient_id.clone(),
        kind: content.kind,
        body: content.body,
        created_at: envelope.created_at,
        delivery_status: DeliveryStatus::Delivered,
    })
}

/// Direct-transport framing.
///
/// Liveness frames are consumed by the connection manager; everything else is
/// forwarded to the delivery pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    LivenessPing,
    LivenessPong,
    /// Opens a chunked transfer; `header` seals a [`TransferHeader`].
    ChunkStart { header: SealedPayload },
    /// One sealed slice of a chunked transfer.
    Chunk {
        id: MessageId,
        index: u32,
        total: u32,
        data: SealedPayload,
    },
    /// Out-of-band profile/control traffic, opaque to delivery; handed to the
    /// hosting application untouched.
    Control { payload: serde_json::Value },
    Message { envelope: Envelope },
}

/// Metadata for a chunked transfer, sealed into the `CHUNK_START` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TransferHeader {
    pub message_id: MessageId,
    pub sender_id: String,
    pub recipient_id: String,
    pub created_at: u64,
    pub kind: MessageKind,
    pub total_chunks: u32,
    pub total_len: u64,
}

/// The header's id lives inside its own ciphertext, so it is sealed under a
/// fixed context string; the AEAD tag still covers the full header.
const TRANSFER_HEADER_AAD: &[u8] = b"deaddrop-transfer-header";

fn chunk_aad(message_id: &MessageId, index: u32, total: u32) -> Vec<u8> {
    format!("{}|{}|{}", message_id.0, index, total).into_bytes()
}

/// Split a large message into transfer frames: one `CHUNK_START` followed by
/// one `CHUNK` per [`CHUNK_SIZE`] slice, each sealed independently.
pub fn split_into_chunks(
    key: &ConversationKey,
    message: &Message,
) -> Result<Vec<Frame>, EnvelopeError> {
    let body = message.body.as_bytes();
    let total = body.len().div_ceil(CHUNK_SIZE).max(1) as u32;

    let header = TransferHeader {
        message_id: message.id.clone(),
        sender_id: message.sender_id.clone(),
        recipient_id: message.recipient_id.clone(),
        created_at: message.created_at,
        kind: message.kind,
        total_chunks: total,
        total_len: body.len() as u64,
    };
    let header_plain = serde_json::to_vec(&header)?;
    let (nonce, ciphertext) = seal(key, &header_plain, TRANSFER_HEADER_AAD, None)?;

    let mut frames = Vec::with_capacity(total as usize + 1);
    frames.push(Frame::ChunkStart {
        header: SealedPayload::from_parts(&nonce, &ciphertext),
    });

    for (index, slice) in body.chunks(CHUNK_SIZE).enumerate() {
        let index = index as u32;
        let (nonce, ciphertext) = seal(key, slice, &chunk_aad(&message.id, index, total), None)?;
        frames.push(Frame::Chunk {
            id: message.id.clone(),
            index,
            total,
            data: SealedPayload::from_parts(&nonce, &ciphertext),
        });
    }

    Ok(frames)
}

struct PendingTransfer {
    header: Option<TransferHeader>,
    total: Option<u32>,
    parts: BTreeMap<u32, Vec<u8>>,
    started_at: Instant,
}

impl PendingTransfer {
    fn empty() -> Self {
        PendingTransfer {
            header: None,
            total: None,
            parts: BTreeMap::new(),
            started_at: Instant::now(),
        }
    }
}

/// Buffers sealed slices per transfer and reassembles complete messages.
///
/// Each slice is decrypted as it arrives, so peak decryption work is bounded
/// by one slice regardless of payload size.  Arrival order does not matter;
/// the `CHUNK_START` header may even land after the last slice.
#[derive(Default)]
pub struct ChunkAssembler {
    transfers: HashMap<String, PendingTransfer>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of in-flight transfers, for diagnostics.
    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }

    /// Handle a `CHUNK_START` frame.  Returns the reassembled message if all
    /// slices had already arrived.
    pub fn accept_start(
        &mut self,
        key: &ConversationKey,
        sealed: &SealedPayload,
    ) -> Option<Message> {
        let header = match self.open_header(key, sealed) {
            Some(header) => header,
            None => return None,
        };
        let id = header.message_id.0.clone();
        let transfer = self
            .transfers
            .entry(id.clone())
            .or_insert_with(PendingTransfer::empty);
        transfer.total = Some(header.total_chunks);
        transfer.header = Some(header);
        self.try_complete(&id)
    }

    /// Handle a `CHUNK` frame.  Returns the reassembled message once
    /// `count == total` and the header has arrived.
    pub fn accept_chunk(
        &mut self,
        key: &ConversationKey,
        id: &MessageId,
        index: u32,
        total: u32,
        data: &SealedPayload,
    ) -> Option<Message> {
        if index >= total {
            dlog!(
                "chunk: dropping out-of-range slice {}/{} for {}",
                index,
                total,
                crate::logging::msg_id(&id.0)
            );
            return None;
        }

        let (nonce, ciphertext) = match data.decode() {
            Ok(parts) => parts,
            Err(error) => {
                dlog!("chunk: undecodable slice for {}: {error}", crate::logging::msg_id(&id.0));
                return None;
            }
        };
        let slice = match open(key, &nonce, &ciphertext, &chunk_aad(id, index, total)) {
            Ok(plain) => plain,
            Err(error) => {
                dlog!(
                    "chunk: discarding undecryptable slice {}/{} for {}: {error}",
                    index,
                    total,
                    crate::logging::msg_id(&id.0)
                );
                return None;
            }
        };

        let transfer = self
            .transfers
            .entry(id.0.clone())
            .or_insert_with(PendingTransfer::empty);
        match transfer.total {
            Some(known) if known != total => {
                dlog!(
                    "chunk: inconsistent total for {} ({known} vs {total}), dropping transfer",
                    crate::logging::msg_id(&id.0)
                );
                self.transfers.remove(&id.0);
                return None;
            }
            None => transfer.total = Some(total),
            _ => {}
        }
        transfer.parts.insert(index, slice);
        self.try_complete(&id.0)
    }

    /// Drop transfers that have been incomplete for longer than `max_age`.
    pub fn prune(&mut self, max_age: Duration) -> usize {
        let before = self.transfers.len();
        self.transfers
            .retain(|_, transfer| transfer.started_at.elapsed() <= max_age);
        before - self.transfers.len()
    }

    fn open_header(&self, key: &ConversationKey, sealed: &SealedPayload) -> Option<TransferHeader> {
        let (nonce, ciphertext) = match sealed.decode() {
            Ok(parts) => parts,
            Err(error) => {
                dlog!("chunk: undecodable transfer header: {error}");
                return None;
            }
        };
        let plain = match open(key, &nonce, &ciphertext, TRANSFER_HEADER_AAD) {
            Ok(plain) => plain,
            Err(error) => {
                dlog!("chunk: discarding undecryptable transfer header: {error}");
                return None;
            }
        };
        match serde_json::from_slice(&plain) {
            Ok(header) => Some(header),
            Err(error) => {
                dlog!("chunk: unparseable transfer header: {error}");
                None
            }
        }
    }

    fn try_complete(&mut self, id: &str) -> Option<Message> {
        let ready = {
            let transfer = self.transfers.get(id)?;
            match (transfer.header.as_ref(), transfer.total) {
                (Some(_), Some(total)) => transfer.parts.len() == total as usize,
                _ => false,
            }
        };
        if !ready {
            return None;
        }

        let transfer = self.transfers.remove(id)?;
        let header = transfer.header?;
        let mut bytes = Vec::with_capacity(header.total_len as usize);
        for part in transfer.parts.into_values() {
            bytes.extend_from_slice(&part);
        }
        let body = match String::from_utf8(bytes) {
            Ok(body) => body,
            Err(error) => {
                dlog!(
                    "chunk: reassembled body for {} is not utf-8: {error}",
                    crate::logging::msg_id(&header.message_id.0)
                );
                return None;
            }
        };
        Some(Message {
            id: header.message_id,
            sender_id: header.sender_id,
            recipient_id: header.recipient_id,
            kind: header.kind,
            body,
            created_at: header.created_at,
            delivery_status: DeliveryStatus::Delivered,
        })
    }
}
