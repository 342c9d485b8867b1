use crate::error::RebalancerError;
use crate::types::{Identity, SignedOperation};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use std::collections::HashMap;
use std::sync::RwLock;

/// Canonical 32-byte digest of a signed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationDigest(pub [u8; 32]);

impl OperationDigest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Key of the global used-signature set: a digest/signature pair.
    pub fn signature_key(&self, signature: &[u8]) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.0);
        hasher.update(signature);
        hasher.finalize().to_hex().to_string()
    }
}

/// Digest over (owner, delegate, nonce, op type, payload, timestamp, policy hash).
///
/// The policy hash is the one recorded on the session, so a signature issued
/// under one set of bounds never verifies under another.
pub fn operation_digest(
    op: &SignedOperation,
    policy_hash: &str,
) -> Result<OperationDigest, RebalancerError> {
    let material = serde_json::json!({
        "owner": op.owner,
        "delegate": op.delegate,
        "nonce": op.nonce,
        "op_type": op.op_type,
        "payload": op.payload,
        "timestamp": op.timestamp.to_rfc3339(),
        "policy_hash": policy_hash,
    });
    let encoded = serde_json::to_string(&material)
        .map_err(|e| RebalancerError::Serialization(e.to_string()))?;
    Ok(OperationDigest(*blake3::hash(encoded.as_bytes()).as_bytes()))
}

/// Pluggable signature capability.
///
/// The core never talks to a signer; it only asks whether a signature over a
/// digest resolves to an identity.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, digest: &OperationDigest, signature: &[u8], identity: &Identity) -> bool;

    /// Identity a signature resolves to, for schemes that support recovery.
    fn recover(&self, _digest: &OperationDigest, _signature: &[u8]) -> Option<Identity> {
        None
    }
}

/// Ed25519 public keys registered per owner identity.
#[derive(Debug, Default)]
pub struct Ed25519KeyRing {
    keys: RwLock<HashMap<Identity, VerifyingKey>>,
}

impl Ed25519KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_key(
        &self,
        identity: Identity,
        key: VerifyingKey,
    ) -> Result<(), RebalancerError> {
        if identity.is_empty() {
            return Err(RebalancerError::EmptyIdentity { field: "identity" });
        }
        self.keys
            .write()
            .map_err(|_| RebalancerError::LockPoisoned("signer keys"))?
            .insert(identity, key);
        Ok(())
    }

    /// Register a hex-encoded 32-byte public key.
    pub fn register_hex_key(&self, identity: Identity, key_hex: &str) -> Result<(), RebalancerError> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|e| RebalancerError::InvalidInput(format!("public key for {identity}: {e}")))?;
        let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            RebalancerError::InvalidInput(format!("public key for {identity} must be 32 bytes"))
        })?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| RebalancerError::InvalidInput(format!("public key for {identity}: {e}")))?;
        self.register_key(identity, key)
    }

    pub fn has_key(&self, identity: &Identity) -> bool {
        self.keys
            .read()
            .map(|keys| keys.contains_key(identity))
            .unwrap_or(false)
    }
}

fn parse_signature(signature: &[u8]) -> Option<Signature> {
    let bytes: [u8; 64] = signature.try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}

impl SignatureVerifier for Ed25519KeyRing {
    fn verify(&self, digest: &OperationDigest, signature: &[u8], identity: &Identity) -> bool {
        let Some(signature) = parse_signature(signature) else {
            return false;
        };
        let Ok(keys) = self.keys.read() else {
            return false;
        };
        keys.get(identity)
            .map(|key| key.verify(digest.as_bytes(), &signature).is_ok())
            .unwrap_or(false)
    }

    fn recover(&self, digest: &OperationDigest, signature: &[u8]) -> Option<Identity> {
        let signature = parse_signature(signature)?;
        let keys = self.keys.read().ok()?;
        keys.iter()
            .find(|(_, key)| key.verify(digest.as_bytes(), &signature).is_ok())
            .map(|(identity, _)| identity.clone())
    }
}
