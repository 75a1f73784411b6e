//! Identity and key directory for relaywire.
//!
//! The [`KeyDirectory`] owns the local [`Identity`], every peer's public key
//! record, and the session keys derived from them. All peer state lives
//! behind one lock, so replacing a peer's key and evicting its cached
//! session key happen atomically: once [`KeyDirectory::record_peer_key`]
//! returns, no caller can obtain the old session key.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use relaywire_proto::frame::{KeyBundle, KeyDirectorySnapshot, PUBLIC_KEY_LEN, PublicKeyBytes, now_millis};

use super::CryptoError;

/// HKDF info label for session keys. Never reused by another derivation.
const SESSION_KEY_INFO: &[u8] = b"relaywire/session-key/v1";

/// A long-term identity: an X25519 key-agreement keypair and an optional
/// Ed25519 signing keypair.
///
/// Secret material is zeroized on drop.
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
    signing: Option<SigningKey>,
}

impl Identity {
    /// Generate a new identity with both key-agreement and signing keys.
    #[must_use]
    pub fn generate() -> Self {
        let mut identity = Self::generate_unsigned();
        identity.signing = Some(SigningKey::generate(&mut OsRng));
        identity
    }

    /// Generate an identity without a signing key; its bundles are unsigned.
    #[must_use]
    pub fn generate_unsigned() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            signing: None,
        }
    }

    /// The raw X25519 public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKeyBytes {
        self.public.to_bytes()
    }

    /// The Ed25519 verifying key, if this identity can sign.
    #[must_use]
    pub fn verifying_key(&self) -> Option<[u8; PUBLIC_KEY_LEN]> {
        self.signing.as_ref().map(|s| s.verifying_key().to_bytes())
    }

    /// Hex string of the first 8 bytes of the public key, for display.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        use std::fmt::Write;
        self.public.as_bytes()[..8]
            .iter()
            .fold(String::new(), |mut output, b| {
                let _ = write!(output, "{b:02x}");
                output
            })
    }

    /// Build this identity's key bundle for `username`, signed if possible.
    #[must_use]
    pub fn key_bundle(&self, username: &str) -> KeyBundle {
        let public_key = self.public_key();
        let (signing_key, signature) = self.signing.as_ref().map_or((None, None), |signing| {
            let message = KeyBundle::signed_message(username, &public_key);
            (
                Some(signing.verifying_key().to_bytes().to_vec()),
                Some(signing.sign(&message).to_bytes().to_vec()),
            )
        });
        KeyBundle {
            username: username.to_string(),
            public_key,
            signing_key,
            signature,
            timestamp_ms: now_millis(),
        }
    }

    /// Derive the session key shared with the holder of `peer_public`.
    ///
    /// X25519 followed by HKDF-SHA256. The salt is the two public keys in
    /// ascending order, so both sides derive the same key. Returns `None` for
    /// low-order peer keys that yield an all-zero shared secret.
    fn derive_session_key(&self, peer_public: &PublicKeyBytes) -> Option<SessionKey> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return None;
        }

        let own = self.public.as_bytes();
        let (low, high) = if own.as_slice() <= peer_public.as_slice() {
            (own, peer_public)
        } else {
            (peer_public, own)
        };
        let mut salt = [0u8; PUBLIC_KEY_LEN * 2];
        salt[..PUBLIC_KEY_LEN].copy_from_slice(low);
        salt[PUBLIC_KEY_LEN..].copy_from_slice(high);

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
        let mut key = SessionKey([0u8; 32]);
        hk.expand(SESSION_KEY_INFO, &mut key.0).ok()?;
        Some(key)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .field("can_sign", &self.signing.is_some())
            .finish_non_exhaustive()
    }
}

/// A symmetric 256-bit key shared with one peer.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// What is known about one peer's key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerKeyRecord {
    /// Peer username.
    pub username: String,
    /// Raw X25519 public key.
    pub public_key: PublicKeyBytes,
    /// The bundle this key arrived in, if any.
    pub bundle: Option<KeyBundle>,
    /// `Some(true)` if the bundle signature verified, `None` if unsigned.
    pub verified: Option<bool>,
}

/// Outcome of recording a peer key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUpdate {
    /// First key seen for this peer.
    Inserted,
    /// The peer's key changed; its session key was evicted.
    Replaced,
    /// Same key as before; the cached session key was kept.
    Unchanged,
    /// The update was ignored (conflicts with a verified record).
    Ignored,
}

struct PeerEntry {
    record: PeerKeyRecord,
    session: Option<SessionKey>,
}

/// Owner of the local identity, peer key records and session keys.
///
/// Shared via `Arc` between the read path (incoming key updates) and the
/// send path (sealing).
pub struct KeyDirectory {
    identity: OnceLock<Identity>,
    peers: parking_lot::Mutex<HashMap<String, PeerEntry>>,
}

impl KeyDirectory {
    /// Create a directory whose identity is generated on first use.
    #[must_use]
    pub fn new() -> Self {
        Self {
            identity: OnceLock::new(),
            peers: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Create a directory around an existing identity.
    #[must_use]
    pub fn with_identity(identity: Identity) -> Self {
        let directory = Self::new();
        let _ = directory.identity.set(identity);
        directory
    }

    /// The local identity, generated on first call and reused afterwards.
    pub fn local_identity(&self) -> &Identity {
        self.identity.get_or_init(|| {
            let identity = Identity::generate();
            tracing::info!(fingerprint = %identity.fingerprint(), "generated local identity");
            identity
        })
    }

    /// Store or overwrite a peer's public key.
    ///
    /// A changed key evicts the cached session key under the same lock.
    pub fn record_peer_key(&self, username: &str, public_key: PublicKeyBytes) -> KeyUpdate {
        self.store(PeerKeyRecord {
            username: username.to_string(),
            public_key,
            bundle: None,
            verified: None,
        })
    }

    /// Verify and store a key bundle.
    ///
    /// Signed bundles must verify under their attached signing key; unsigned
    /// bundles are stored with `verified: None`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SignatureInvalid`] or [`CryptoError::InvalidKey`]
    /// if the bundle is rejected. The directory is left untouched.
    pub fn record_bundle(&self, bundle: &KeyBundle) -> Result<KeyUpdate, CryptoError> {
        let verified = match (&bundle.signing_key, &bundle.signature) {
            (Some(_), Some(_)) => {
                verify_bundle(bundle)?;
                Some(true)
            }
            (None, None) => None,
            _ => {
                return Err(CryptoError::SignatureInvalid(format!(
                    "{}: bundle carries only half of a signature",
                    bundle.username
                )));
            }
        };

        Ok(self.store(PeerKeyRecord {
            username: bundle.username.clone(),
            public_key: bundle.public_key,
            bundle: Some(bundle.clone()),
            verified,
        }))
    }

    /// Apply a relay key directory snapshot.
    ///
    /// Entries for `local_username`, undecodable entries and entries that
    /// contradict a signature-verified record are skipped. Returns the number
    /// of peers whose key was inserted or replaced.
    pub fn apply_snapshot(&self, snapshot: &KeyDirectorySnapshot, local_username: &str) -> usize {
        let mut changed = 0;
        for (username, encoded) in &snapshot.keys {
            if username == local_username {
                continue;
            }
            let public_key = match decode_public_key(encoded) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(peer = %username, err = %e, "skipping bad directory entry");
                    continue;
                }
            };
            if self.conflicts_with_verified(username, &public_key) {
                tracing::warn!(
                    peer = %username,
                    "directory key contradicts signed bundle, keeping signed key"
                );
                continue;
            }
            if matches!(
                self.record_peer_key(username, public_key),
                KeyUpdate::Inserted | KeyUpdate::Replaced
            ) {
                changed += 1;
            }
        }
        changed
    }

    /// Session key for `username`, derived and cached on first use.
    ///
    /// Returns `None` if no public key is on record for the peer.
    pub fn session_key_for(&self, username: &str) -> Option<SessionKey> {
        let identity = self.local_identity();
        let mut peers = self.peers.lock();
        let entry = peers.get_mut(username)?;
        if let Some(key) = &entry.session {
            return Some(key.clone());
        }
        let Some(key) = identity.derive_session_key(&entry.record.public_key) else {
            tracing::warn!(peer = %username, "peer key yields no shared secret");
            return None;
        };
        entry.session = Some(key.clone());
        Some(key)
    }

    /// The current record for `username`.
    #[must_use]
    pub fn peer(&self, username: &str) -> Option<PeerKeyRecord> {
        self.peers.lock().get(username).map(|e| e.record.clone())
    }

    /// Whether a session key is currently cached for `username`.
    #[must_use]
    pub fn has_cached_session(&self, username: &str) -> bool {
        self.peers
            .lock()
            .get(username)
            .is_some_and(|e| e.session.is_some())
    }

    /// Remove a peer and its session key. Returns `true` if it was known.
    pub fn forget_peer(&self, username: &str) -> bool {
        self.peers.lock().remove(username).is_some()
    }

    /// Usernames with a key on record, sorted.
    #[must_use]
    pub fn known_peers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn store(&self, record: PeerKeyRecord) -> KeyUpdate {
        let mut peers = self.peers.lock();
        match peers.get_mut(&record.username) {
            Some(entry) if entry.record.public_key == record.public_key => {
                // A verified record is never traded for an unverified one.
                let downgrade =
                    entry.record.verified == Some(true) && record.verified != Some(true);
                if record.bundle.is_some() && !downgrade {
                    entry.record = record;
                }
                KeyUpdate::Unchanged
            }
            Some(entry) => {
                tracing::info!(peer = %record.username, "peer key changed, session key evicted");
                entry.record = record;
                entry.session = None;
                KeyUpdate::Replaced
            }
            None => {
                tracing::debug!(peer = %record.username, "recorded new peer key");
                peers.insert(
                    record.username.clone(),
                    PeerEntry {
                        record,
                        session: None,
                    },
                );
                KeyUpdate::Inserted
            }
        }
    }

    fn conflicts_with_verified(&self, username: &str, public_key: &PublicKeyBytes) -> bool {
        self.peers.lock().get(username).is_some_and(|e| {
            e.record.verified == Some(true) && &e.record.public_key != public_key
        })
    }
}

impl Default for KeyDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a bundle's Ed25519 signature over `username || public_key`.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKey`] for a malformed signing key, or
/// [`CryptoError::SignatureInvalid`] if the signature is missing, malformed,
/// or does not verify.
pub fn verify_bundle(bundle: &KeyBundle) -> Result<(), CryptoError> {
    let (Some(signing_key), Some(signature)) = (&bundle.signing_key, &bundle.signature) else {
        return Err(CryptoError::SignatureInvalid(bundle.username.clone()));
    };

    let key_bytes: [u8; PUBLIC_KEY_LEN] = signing_key.as_slice().try_into().map_err(|_| {
        CryptoError::InvalidKey(format!("{}: signing key must be 32 bytes", bundle.username))
    })?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| CryptoError::InvalidKey(format!("{}: {e}", bundle.username)))?;
    let signature = Signature::from_slice(signature)
        .map_err(|_| CryptoError::SignatureInvalid(bundle.username.clone()))?;

    let message = KeyBundle::signed_message(&bundle.username, &bundle.public_key);
    verifying_key
        .verify_strict(&message, &signature)
        .map_err(|_| CryptoError::SignatureInvalid(bundle.username.clone()))
}

/// Base64-encode a public key for a [`KeyDirectorySnapshot`].
#[must_use]
pub fn encode_public_key(key: &PublicKeyBytes) -> String {
    BASE64.encode(key)
}

/// Decode a base64 public key from a [`KeyDirectorySnapshot`].
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKey`] if the input is not base64 or not 32 bytes.
pub fn decode_public_key(encoded: &str) -> Result<PublicKeyBytes, CryptoError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))
}
