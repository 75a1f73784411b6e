//! Sealing and opening of [`EncryptedEnvelope`]s.
//!
//! ChaCha20-Poly1305 keyed by the per-peer session key from the
//! [`KeyDirectory`], with a fresh random nonce per envelope. The routing
//! header (`from`, `to`, media type, chunk marker) is authenticated as
//! associated data, so a relay that rewrites any of it breaks the tag.

use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand_core::{OsRng, RngCore};
use serde::Serialize;

use relaywire_proto::codec;
use relaywire_proto::frame::{DirectPayload, EncryptedEnvelope, MEDIA_TEXT, NONCE_LEN};

use super::CryptoError;
use super::keys::{KeyDirectory, SessionKey};

/// Associated data bound into every envelope tag.
#[derive(Serialize)]
struct EnvelopeHeader<'a> {
    from: &'a str,
    to: &'a str,
    media_type: &'a str,
    chunk_index: Option<u32>,
    last: Option<bool>,
}

impl<'a> EnvelopeHeader<'a> {
    fn of(envelope: &'a EncryptedEnvelope) -> Self {
        Self {
            from: &envelope.from,
            to: &envelope.to,
            media_type: &envelope.media_type,
            chunk_index: envelope.chunk_index,
            last: envelope.last,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        postcard::to_allocvec(self).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }
}

/// Seals payloads for peers and opens payloads from them.
///
/// This is the only place where direct-message plaintext exists on the
/// wire side of the client.
pub struct EncryptionEngine {
    local: String,
    keys: Arc<KeyDirectory>,
}

impl EncryptionEngine {
    /// Create an engine acting as `local` over the shared key directory.
    #[must_use]
    pub fn new(local: impl Into<String>, keys: Arc<KeyDirectory>) -> Self {
        Self {
            local: local.into(),
            keys,
        }
    }

    /// Username this engine seals as.
    #[must_use]
    pub fn local_username(&self) -> &str {
        &self.local
    }

    /// The key directory backing this engine.
    #[must_use]
    pub const fn keys(&self) -> &Arc<KeyDirectory> {
        &self.keys
    }

    /// Seal raw `plaintext` for `to` with the text media type.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NoSessionKey`] if `to`'s public key is unknown.
    pub fn seal_for(&self, to: &str, plaintext: &[u8]) -> Result<EncryptedEnvelope, CryptoError> {
        self.seal(to, plaintext, MEDIA_TEXT, None)
    }

    /// Encode and seal a [`DirectPayload`] for `to`.
    ///
    /// The payload's media type and chunk marker go into the clear header.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NoSessionKey`] if `to`'s public key is unknown,
    /// or [`CryptoError::EncryptionFailed`] if the payload cannot be encoded.
    pub fn seal_payload(
        &self,
        to: &str,
        payload: &DirectPayload,
    ) -> Result<EncryptedEnvelope, CryptoError> {
        let plaintext = codec::encode_direct(payload)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        self.seal(to, &plaintext, payload.media_type(), payload.chunk_marker())
    }

    /// Open an envelope that claims to come from `from`.
    ///
    /// Fails without yielding any plaintext if the sender or recipient does
    /// not match, no session key exists, or the tag does not verify.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NoSessionKey`] or [`CryptoError::DecryptionFailed`].
    pub fn open_from(
        &self,
        from: &str,
        envelope: &EncryptedEnvelope,
    ) -> Result<Vec<u8>, CryptoError> {
        if envelope.from != from {
            return Err(CryptoError::DecryptionFailed(format!(
                "sender mismatch: envelope from {}, expected {from}",
                envelope.from
            )));
        }
        if envelope.to != self.local {
            return Err(CryptoError::DecryptionFailed(format!(
                "envelope addressed to {}",
                envelope.to
            )));
        }

        let key = self
            .keys
            .session_key_for(from)
            .ok_or_else(|| CryptoError::NoSessionKey(from.to_string()))?;
        let aad = EnvelopeHeader::of(envelope).to_bytes()?;

        cipher(&key)
            .decrypt(
                Nonce::from_slice(&envelope.nonce),
                Payload {
                    msg: &envelope.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed(format!("authentication failed for {from}")))
    }

    /// Open an envelope and decode the [`DirectPayload`] inside.
    ///
    /// # Errors
    ///
    /// As [`open_from`](Self::open_from), plus [`CryptoError::DecryptionFailed`]
    /// if the plaintext is not a payload matching the header's media type.
    pub fn open_payload(
        &self,
        from: &str,
        envelope: &EncryptedEnvelope,
    ) -> Result<DirectPayload, CryptoError> {
        let plaintext = self.open_from(from, envelope)?;
        let payload = codec::decode_direct(&plaintext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("bad payload from {from}: {e}")))?;
        if payload.media_type() != envelope.media_type
            || payload.chunk_marker() != envelope.chunk_index.zip(envelope.last)
        {
            return Err(CryptoError::DecryptionFailed(format!(
                "payload from {from} does not match its header"
            )));
        }
        Ok(payload)
    }

    fn seal(
        &self,
        to: &str,
        plaintext: &[u8],
        media_type: &str,
        marker: Option<(u32, bool)>,
    ) -> Result<EncryptedEnvelope, CryptoError> {
        let key = self
            .keys
            .session_key_for(to)
            .ok_or_else(|| CryptoError::NoSessionKey(to.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut envelope = EncryptedEnvelope {
            from: self.local.clone(),
            to: to.to_string(),
            nonce,
            ciphertext: Vec::new(),
            media_type: media_type.to_string(),
            chunk_index: marker.map(|(index, _)| index),
            last: marker.map(|(_, last)| last),
        };
        let aad = EnvelopeHeader::of(&envelope).to_bytes()?;

        envelope.ciphertext = cipher(&key)
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        Ok(envelope)
    }
}

fn cipher(key: &SessionKey) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()))
}
