//! Wire frame types for the relaywire protocol.
//!
//! Every message exchanged between a client and the relay is one [`Frame`].
//! Only [`EncryptedEnvelope`] carries confidential data; everything else is
//! routing metadata the relay is allowed to read.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Length of a raw X25519 or Ed25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of an envelope nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Media type tag for a sealed text message.
pub const MEDIA_TEXT: &str = "text";

/// Media type tag for a sealed transfer announcement.
pub const MEDIA_TRANSFER_REQUEST: &str = "transfer-request";

/// Media type tag for a sealed transfer chunk.
pub const MEDIA_CHUNK: &str = "chunk";

/// Logical-name prefix marking a transfer as a voice recording.
pub const VOICE_NAME_PREFIX: &str = "voice-";

/// Raw 32-byte public key.
pub type PublicKeyBytes = [u8; PUBLIC_KEY_LEN];

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Falls back to 0 if the system clock is before the epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// First frame a client sends after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Username the client wants to be known by.
    pub username: String,
    /// The client's X25519 public key, if it takes part in encryption.
    pub public_key: Option<PublicKeyBytes>,
}

/// A peer's public key, optionally signed with its Ed25519 identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    /// Owner of the key.
    pub username: String,
    /// Raw X25519 public key.
    pub public_key: PublicKeyBytes,
    /// Ed25519 verifying key used for `signature`.
    pub signing_key: Option<Vec<u8>>,
    /// Ed25519 signature over [`KeyBundle::signed_message`].
    pub signature: Option<Vec<u8>>,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl KeyBundle {
    /// Bytes covered by the bundle signature: `username || public_key`.
    #[must_use]
    pub fn signed_message(username: &str, public_key: &PublicKeyBytes) -> Vec<u8> {
        let mut message = Vec::with_capacity(username.len() + PUBLIC_KEY_LEN);
        message.extend_from_slice(username.as_bytes());
        message.extend_from_slice(public_key);
        message
    }

    /// Returns `true` if both a signing key and a signature are attached.
    #[must_use]
    pub const fn is_signed(&self) -> bool {
        self.signing_key.is_some() && self.signature.is_some()
    }
}

/// Directory of every known public key, pushed by the relay on membership changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDirectorySnapshot {
    /// Username to base64-encoded X25519 public key.
    pub keys: BTreeMap<String, String>,
}

/// Whether a chat message was typed by a user or generated by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Typed by a user.
    User,
    /// Generated by a client or the relay (joins, errors, notices).
    System,
}

/// A plaintext chat message broadcast to everyone on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender username.
    pub from: String,
    /// Message body.
    pub text: String,
    /// User or system message.
    pub kind: MessageKind,
}

impl ChatMessage {
    /// Creates a user message.
    #[must_use]
    pub fn user(from: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            text: text.into(),
            kind: MessageKind::User,
        }
    }

    /// Creates a system message.
    #[must_use]
    pub fn system(from: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            text: text.into(),
            kind: MessageKind::System,
        }
    }
}

/// An authenticated ciphertext addressed from one peer to another.
///
/// `from`, `to`, `media_type`, `chunk_index` and `last` travel in the clear
/// so the relay can route, but they are bound into the AEAD tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Sender username.
    pub from: String,
    /// Recipient username.
    pub to: String,
    /// Random per-envelope nonce.
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext with the 16-byte Poly1305 tag appended.
    pub ciphertext: Vec<u8>,
    /// What the plaintext holds (see the `MEDIA_*` constants).
    pub media_type: String,
    /// Sequence index when the envelope carries a transfer chunk.
    pub chunk_index: Option<u32>,
    /// Last-chunk flag when the envelope carries a transfer chunk.
    pub last: Option<bool>,
}

/// Announces a chunk stream that follows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Username of the sending peer.
    pub sender: String,
    /// Logical name that identifies the stream (file name, voice clip id).
    pub name: String,
    /// Total payload size in bytes.
    pub total_size: u64,
}

impl TransferRequest {
    /// Returns `true` if this transfer carries a voice recording.
    #[must_use]
    pub fn is_voice(&self) -> bool {
        is_voice_transfer(&self.name)
    }
}

/// One slice of a transfer payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Logical name of the transfer this chunk belongs to.
    pub name: String,
    /// Raw payload bytes.
    pub data: Vec<u8>,
    /// Sequence index, starting at 0. Informational only.
    pub index: u32,
    /// Set on the final chunk of the stream.
    pub last: bool,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .field("index", &self.index)
            .field("last", &self.last)
            .finish()
    }
}

/// Ordered list of usernames currently connected to the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserListUpdate {
    /// Connected usernames in join order.
    pub users: Vec<String>,
}

/// A single unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Client introduction; must be the first frame on a connection.
    Hello(Hello),
    /// A peer's (optionally signed) public key.
    KeyBundle(KeyBundle),
    /// Full key directory pushed by the relay.
    KeyDirectory(KeyDirectorySnapshot),
    /// Plaintext broadcast chat message.
    Chat(ChatMessage),
    /// Encrypted direct payload.
    Envelope(EncryptedEnvelope),
    /// Announcement of a plaintext chunk stream.
    TransferRequest(TransferRequest),
    /// One plaintext chunk.
    Chunk(Chunk),
    /// Connected-user list pushed by the relay.
    UserList(UserListUpdate),
}

impl Frame {
    /// Short label for logging.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::KeyBundle(_) => "key-bundle",
            Self::KeyDirectory(_) => "key-directory",
            Self::Chat(_) => "chat",
            Self::Envelope(_) => "envelope",
            Self::TransferRequest(_) => "transfer-request",
            Self::Chunk(_) => "chunk",
            Self::UserList(_) => "user-list",
        }
    }
}

/// Plaintext carried inside an [`EncryptedEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectPayload {
    /// A private text message.
    Text(String),
    /// A private transfer announcement.
    TransferRequest(TransferRequest),
    /// A private transfer chunk.
    Chunk(Chunk),
}

impl DirectPayload {
    /// Media type tag that accompanies this payload in the envelope header.
    #[must_use]
    pub const fn media_type(&self) -> &'static str {
        match self {
            Self::Text(_) => MEDIA_TEXT,
            Self::TransferRequest(_) => MEDIA_TRANSFER_REQUEST,
            Self::Chunk(_) => MEDIA_CHUNK,
        }
    }

    /// Chunk index and last flag exposed in the envelope header, if any.
    #[must_use]
    pub const fn chunk_marker(&self) -> Option<(u32, bool)> {
        match self {
            Self::Chunk(chunk) => Some((chunk.index, chunk.last)),
            Self::Text(_) | Self::TransferRequest(_) => None,
        }
    }
}

/// Builds a logical transfer name for a voice recording.
#[must_use]
pub fn voice_transfer_name(sender: &str, timestamp_ms: u64) -> String {
    format!("{VOICE_NAME_PREFIX}{sender}-{timestamp_ms}")
}

/// Returns `true` if `name` follows the voice transfer naming convention.
#[must_use]
pub fn is_voice_transfer(name: &str) -> bool {
    name.starts_with(VOICE_NAME_PREFIX)
}
