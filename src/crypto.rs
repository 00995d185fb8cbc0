//! Symmetric message encryption for a two-party conversation.
//!
//! Both ends derive the same [`ConversationKey`] from a shared secret plus the
//! two identity strings, so no key material ever crosses the network.  The
//! identities are sorted before derivation, making the key independent of
//! which side performs it.  Individual payloads are sealed with
//! ChaCha20-Poly1305 under a fresh random nonce per call.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

/// Domain-separation salt for conversation key derivation.
const DERIVE_SALT: &[u8] = b"deaddrop-conversation-v1";

/// A derived symmetric key for one two-party conversation.
#[derive(Clone)]
pub struct ConversationKey([u8; KEY_SIZE]);

impl ConversationKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        ConversationKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        write!(f, "ConversationKey(..)")
    }
}

#[derive(Debug)]
pub enum CryptoError {
    InvalidLength(&'static str),
    Aead(chacha20poly1305::aead::Error),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::InvalidLength(what) => write!(f, "invalid length: {what}"),
            CryptoError::Aead(_) => write!(f, "aead failure"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<chacha20poly1305::aead::Error> for CryptoError {
    fn from(error: chacha20poly1305::aead::Error) -> Self {
        CryptoError::Aead(error)
    }
}

/// Derive the conversation key shared by identities `a` and `b`.
///
/// Deterministic and symmetric: `derive_conversation_key(s, a, b)` equals
/// `derive_conversation_key(s, b, a)`.  HKDF-SHA256 with the shared secret as
/// input key material and the sorted identity pair as the info string.
pub fn derive_conversation_key(secret: &str, a: &str, b: &str) -> ConversationKey {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let info = format!("{lo}:{hi}");
    let hk = Hkdf::<Sha256>::new(Some(DERIVE_SALT), secret.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(info.as_bytes(), &mut okm)
        .expect("32-byte okm is a valid hkdf output length");
    ConversationKey(okm)
}

/// Derive a short user ID from a display name and secret.
///
/// Uppercased first six hex chars of SHA-256(`name:secret`), with the name
/// trimmed and lowercased first so casing and whitespace don't fork identities.
pub fn derive_user_id(name: &str, secret: &str) -> String {
    let raw = format!("{}:{}", name.trim().to_lowercase(), secret.trim());
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(digest)[..6].to_uppercase()
}

/// Encrypt `plaintext` under `key`, binding `aad`.
///
/// Pass `None` for `nonce` to generate a fresh random one (the normal path);
/// an explicit nonce is only for deterministic test fixtures.  Returns the
/// nonce actually used together with the ciphertext.
pub fn seal(
    key: &ConversationKey,
    plaintext: &[u8],
    aad: &[u8],
    nonce: Option<&[u8]>,
) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let nonce_bytes = match nonce {
        Some(value) => {
            if value.len() != NONCE_SIZE {
                return Err(CryptoError::InvalidLength("nonce must be 12 bytes"));
            }
            value.to_vec()
        }
        None => {
            let mut generated = [0u8; NONCE_SIZE];
            rand::rngs::OsRng.fill_bytes(&mut generated);
            generated.to_vec()
        }
    };

    let aead = ChaCha20Poly1305::new(Key::from_slice(&key.0));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = aead.encrypt(
        nonce,
        chacha20poly1305::aead::Payload { msg: plaintext, aad },
    )?;
    Ok((nonce_bytes, ciphertext))
}

/// Decrypt a sealed payload.
///
/// Wrong key, truncated input, or a tampered ciphertext all surface as a
/// [`CryptoError`]; this never panics, so callers can drop the unit and move
/// on.
pub fn open(
    key: &ConversationKey,
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidLength("nonce must be 12 bytes"));
    }

    let aead = ChaCha20Poly1305::new(Key::from_slice(&key.0));
    let nonce = Nonce::from_slice(nonce);
    let plaintext = aead.decrypt(
        nonce,
        chacha20poly1305::aead::Payload { msg: ciphertext, aad },
    )?;
    Ok(plaintext)
}
