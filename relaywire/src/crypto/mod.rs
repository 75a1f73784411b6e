//! Cryptographic layer for relaywire.
//!
//! - [`keys`]: local identity, peer key records and cached session keys
//! - [`envelope`]: the authenticated-encryption engine that seals and opens
//!   [`EncryptedEnvelope`](relaywire_proto::frame::EncryptedEnvelope)s
//!
//! The [`envelope::EncryptionEngine`] is the only place where direct-message
//! plaintext is turned into ciphertext or back.

pub mod envelope;
pub mod keys;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// No public key is on record for the peer, so no session key exists.
    #[error("no session key for {0}; their public key is unknown")]
    NoSessionKey(String),

    /// Decryption failed (tampered data, wrong key, truncated input).
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// A key had the wrong length or encoding.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A key bundle signature did not verify.
    #[error("signature verification failed for {0}")]
    SignatureInvalid(String),
}
