use crate::canonical::canonical_task_bytes;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use dts_types::Task;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePublicKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_KDF_ITERATIONS: u32 = 150_000;

/// Salt shared by every node of a deployment. All nodes must derive the same
/// key from the same secret, so the salt cannot be per-node.
const KDF_SALT: &[u8] = b"dts_shared_key_salt_v1";

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("Encryption failed: {0}")]
    Encryption(String),
    #[error("Decryption failed")]
    Decryption,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Derive the 256-bit symmetric key from the pre-shared secret.
pub fn derive_key(secret: &str, iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), KDF_SALT, iterations, &mut key);
    key
}

/// An encrypted task ready to be posted to a peer's `/run` endpoint.
#[derive(Debug, Clone)]
pub struct SealedTask {
    /// `nonce || ciphertext || tag`
    pub body: Vec<u8>,
    /// Hex form of the inner Ed25519 signature, sent as `X-Signature`
    pub signature_hex: String,
}

/// Per-node security state.
///
/// Peer keys are pinned the first time a sender presents a key that verifies
/// its message. Pinned keys are never replaced or revoked.
pub struct SecurityContext {
    node_id: String,
    cipher: Aes256Gcm,
    signing_key: SigningKey,
    public_pem: String,
    peer_keys: RwLock<HashMap<String, VerifyingKey>>,
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("node_id", &self.node_id)
            .field("known_peers", &self.peer_keys.read().len())
            .finish_non_exhaustive()
    }
}

impl SecurityContext {
    /// Build a context with a fresh Ed25519 identity.
    pub fn new(node_id: impl Into<String>, shared_secret: &str, iterations: u32) -> Result<Self, SecurityError> {
        Self::with_signing_key(node_id, shared_secret, iterations, SigningKey::generate(&mut OsRng))
    }

    pub fn with_signing_key(
        node_id: impl Into<String>,
        shared_secret: &str,
        iterations: u32,
        signing_key: SigningKey,
    ) -> Result<Self, SecurityError> {
        let key = derive_key(shared_secret, iterations);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let public_pem = signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| SecurityError::InvalidKey(e.to_string()))?;

        Ok(Self {
            node_id: node_id.into(),
            cipher,
            signing_key,
            public_pem,
            peer_keys: RwLock::new(HashMap::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// PEM SubjectPublicKeyInfo of this node's signing key.
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| SecurityError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Short, tampered or foreign blobs all fail with `Decryption`.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, SecurityError> {
        if blob.len() <= NONCE_LEN {
            return Err(SecurityError::Decryption);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SecurityError::Decryption)
    }

    /// Return a signed copy of `task`, sent from this node.
    pub fn sign(&self, task: &Task) -> Result<Task, SecurityError> {
        let mut signed = task.clone();
        signed.strip_signature();
        signed.sender_id = self.node_id.clone();

        let bytes = canonical_task_bytes(&signed)?;
        let signature = self.signing_key.sign(&bytes);

        signed.signature = Some(BASE64.encode(signature.to_bytes()));
        signed.sender_public_key = Some(self.public_pem.clone());
        Ok(signed)
    }

    /// Check a task's signature against the sender's pinned key, pinning the
    /// embedded key on first contact. Never fails loudly: every problem is a
    /// `false`.
    pub fn verify(&self, task: &Task) -> bool {
        let Some(encoded) = task.signature.as_deref() else {
            debug!(task_id = %task.task_id, "Task carries no signature");
            return false;
        };
        let signature = match BASE64.decode(encoded).ok().and_then(|b| Signature::from_slice(&b).ok()) {
            Some(signature) => signature,
            None => {
                warn!(sender = %task.sender_id, "Malformed task signature");
                return false;
            }
        };

        let embedded = match task.sender_public_key.as_deref() {
            Some(pem) => match VerifyingKey::from_public_key_pem(pem) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(sender = %task.sender_id, error = %e, "Malformed sender public key");
                    return false;
                }
            },
            None => None,
        };

        let pinned = self.peer_key(&task.sender_id);
        let key = match (pinned, embedded) {
            (Some(pinned), Some(embedded)) if pinned != embedded => {
                warn!(sender = %task.sender_id, "Sender presented a key that differs from the pinned key");
                return false;
            }
            (Some(pinned), _) => pinned,
            (None, Some(embedded)) => embedded,
            (None, None) => {
                debug!(sender = %task.sender_id, "Unknown sender and no embedded key");
                return false;
            }
        };

        let bytes = match canonical_task_bytes(task) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        if key.verify_strict(&bytes, &signature).is_err() {
            return false;
        }

        let mut keys = self.peer_keys.write();
        match keys.get(&task.sender_id) {
            Some(existing) => *existing == key,
            None => {
                debug!(sender = %task.sender_id, "Pinning sender key on first use");
                keys.insert(task.sender_id.clone(), key);
                true
            }
        }
    }

    /// Store or replace the key for `peer_id`.
    pub fn add_peer_key(&self, peer_id: &str, public_key_pem: &str) -> Result<(), SecurityError> {
        let key = VerifyingKey::from_public_key_pem(public_key_pem)
            .map_err(|e| SecurityError::InvalidKey(e.to_string()))?;
        self.peer_keys.write().insert(peer_id.to_string(), key);
        Ok(())
    }

    pub fn peer_key(&self, peer_id: &str) -> Option<VerifyingKey> {
        self.peer_keys.read().get(peer_id).copied()
    }

    pub fn known_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.peer_keys.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Sign, serialize and encrypt a task for the wire.
    pub fn seal_task(&self, task: &Task) -> Result<SealedTask, SecurityError> {
        let signed = self.sign(task)?;
        let signature_hex = signed
            .signature
            .as_deref()
            .and_then(|s| BASE64.decode(s).ok())
            .map(hex::encode)
            .unwrap_or_default();
        let body = self.encrypt(&serde_json::to_vec(&signed)?)?;
        Ok(SealedTask { body, signature_hex })
    }

    /// Decrypt and authenticate a sealed task. When a header signature is
    /// supplied it must match the inner signature. The returned task has its
    /// signature fields stripped.
    pub fn open_task(&self, body: &[u8], signature_hex: Option<&str>) -> Result<Task, SecurityError> {
        let plaintext = self.decrypt(body)?;
        let mut task: Task = serde_json::from_slice(&plaintext)?;

        if let Some(header) = signature_hex.filter(|h| !h.is_empty()) {
            let inner = task.signature.as_deref().and_then(|s| BASE64.decode(s).ok());
            let header = hex::decode(header.trim()).ok();
            if inner.is_none() || inner != header {
                return Err(SecurityError::InvalidSignature);
            }
        }

        if task.is_signed() && !self.verify(&task) {
            return Err(SecurityError::InvalidSignature);
        }
        task.strip_signature();
        Ok(task)
    }
}
