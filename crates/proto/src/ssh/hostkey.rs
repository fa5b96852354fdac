//! Built-in ssh-ed25519 host key (RFC 8709).
//!
//! [`Ed25519HostKey`] signs the exchange hash on the server side;
//! [`Ed25519Verifier`] checks that signature on the client side. Trust of the
//! presented key is decided by an optional pinned key; without one, any
//! correctly signed key is accepted (known-hosts policy is left to callers
//! that register their own [`HostKeyVerifier`]).
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::algorithm::{HostKeySigner, HostKeyVerifier};
//! use skiff_proto::ssh::hostkey::{Ed25519HostKey, Ed25519Verifier};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hostkey = Ed25519HostKey::generate();
//! let signature = hostkey.sign(b"exchange hash")?;
//!
//! let verifier = Ed25519Verifier::pinned(hostkey.public_key_blob());
//! verifier.verify(&hostkey.public_key_blob(), b"exchange hash", &signature)?;
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use super::algorithm::{AlgorithmRegistry, HostKeySigner, HostKeyVerifier};
use super::wire::{read_bytes, read_string, write_bytes, write_string};
use bytes::BytesMut;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::Arc;
use zeroize::Zeroizing;

/// SSH name of the algorithm.
pub const SSH_ED25519: &str = "ssh-ed25519";

/// Ed25519 host key (ssh-ed25519)
///
/// Provides 128-bit security with constant-time operations.
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519HostKey {
    /// Generate a new Ed25519 key pair
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        let secret_bytes: Zeroizing<[u8; SECRET_KEY_LENGTH]> =
            Zeroizing::new(rand::Rng::gen(&mut csprng));
        let signing_key = SigningKey::from_bytes(&secret_bytes);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from raw key bytes (32-byte secret key)
    pub fn from_bytes(secret_bytes: &[u8]) -> SkiffResult<Self> {
        let key_bytes: Zeroizing<[u8; SECRET_KEY_LENGTH]> =
            Zeroizing::new(secret_bytes.try_into().map_err(|_| {
                SkiffError::Security("Ed25519 secret key must be 32 bytes".to_string())
            })?);
        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Get the verifying key
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

impl HostKeySigner for Ed25519HostKey {
    fn algorithm(&self) -> &'static str {
        SSH_ED25519
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_string(&mut buf, SSH_ED25519);
        write_bytes(&mut buf, self.verifying_key.as_bytes());
        buf.to_vec()
    }

    fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);

        let mut buf = BytesMut::new();
        write_string(&mut buf, SSH_ED25519);
        write_bytes(&mut buf, &signature.to_bytes());
        Ok(buf.to_vec())
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &SSH_ED25519)
            .field("public_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Client side ssh-ed25519 signature check.
#[derive(Debug, Clone, Default)]
pub struct Ed25519Verifier {
    pinned: Option<Vec<u8>>,
}

impl Ed25519Verifier {
    /// Accepts any host key that signs the exchange hash correctly.
    pub fn accept_any() -> Self {
        Self::default()
    }

    /// Accepts only the given public key blob.
    pub fn pinned(key_blob: Vec<u8>) -> Self {
        Self {
            pinned: Some(key_blob),
        }
    }
}

fn parse_blob(blob: &[u8], what: &str) -> SkiffResult<Vec<u8>> {
    let mut offset = 0;
    let algorithm = read_string(blob, &mut offset)?;
    if algorithm != SSH_ED25519 {
        return Err(SkiffError::Security(format!(
            "Expected {} {}, got {}",
            SSH_ED25519, what, algorithm
        )));
    }
    read_bytes(blob, &mut offset)
}

impl HostKeyVerifier for Ed25519Verifier {
    fn verify(&self, key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> SkiffResult<()> {
        if let Some(pinned) = &self.pinned {
            if pinned.as_slice() != key_blob {
                return Err(SkiffError::Security(
                    "Host key does not match the pinned key".to_string(),
                ));
            }
        }

        let public_key: [u8; 32] = parse_blob(key_blob, "key")?
            .as_slice()
            .try_into()
            .map_err(|_| SkiffError::Security("Ed25519 public key must be 32 bytes".to_string()))?;
        let signature: [u8; 64] = parse_blob(signature_blob, "signature")?
            .as_slice()
            .try_into()
            .map_err(|_| SkiffError::Security("Ed25519 signature must be 64 bytes".to_string()))?;

        let verifying_key = VerifyingKey::from_bytes(&public_key)
            .map_err(|e| SkiffError::Security(format!("Invalid Ed25519 public key: {}", e)))?;

        verifying_key
            .verify(data, &Signature::from_bytes(&signature))
            .map_err(|_| SkiffError::Security("Host key signature is invalid".to_string()))
    }
}

/// Registers the accept-any ssh-ed25519 verifier.
pub(crate) fn register(registry: &mut AlgorithmRegistry) {
    registry.register_host_key_verifier(SSH_ED25519, Arc::new(Ed25519Verifier::accept_any()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = Ed25519HostKey::generate();
        let signature = key.sign(b"hash").unwrap();

        let verifier = Ed25519Verifier::accept_any();
        assert!(verifier
            .verify(&key.public_key_blob(), b"hash", &signature)
            .is_ok());
        assert!(verifier
            .verify(&key.public_key_blob(), b"other", &signature)
            .is_err());
    }

    #[test]
    fn test_pinned_rejects_other_key() {
        let trusted = Ed25519HostKey::generate();
        let attacker = Ed25519HostKey::generate();
        let signature = attacker.sign(b"hash").unwrap();

        let verifier = Ed25519Verifier::pinned(trusted.public_key_blob());
        assert!(matches!(
            verifier.verify(&attacker.public_key_blob(), b"hash", &signature),
            Err(SkiffError::Security(_))
        ));
    }

    #[test]
    fn test_from_bytes_is_deterministic() {
        let a = Ed25519HostKey::from_bytes(&[7u8; 32]).unwrap();
        let b = Ed25519HostKey::from_bytes(&[7u8; 32]).unwrap();
        assert_eq!(a.public_key_blob(), b.public_key_blob());
        assert!(Ed25519HostKey::from_bytes(&[7u8; 31]).is_err());
    }

    #[test]
    fn test_blob_format() {
        let key = Ed25519HostKey::from_bytes(&[1u8; 32]).unwrap();
        let blob = key.public_key_blob();
        assert_eq!(&blob[..4], &[0, 0, 0, 11]);
        assert_eq!(&blob[4..15], b"ssh-ed25519");
        assert_eq!(blob.len(), 4 + 11 + 4 + 32);
    }
}
