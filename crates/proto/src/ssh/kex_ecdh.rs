//! Curve25519 key exchange (RFC 8731).
//!
//! Implements curve25519-sha256 and its pre-standard alias
//! curve25519-sha256@libssh.org. The ephemeral private key is consumed by
//! the agreement and never leaves `ring`.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::algorithm::KeyExchange;
//! use skiff_proto::ssh::kex_ecdh::Curve25519Exchange;
//!
//! let mut client = Curve25519Exchange::new().unwrap();
//! let mut server = Curve25519Exchange::new().unwrap();
//!
//! let client_public = client.public_key().to_vec();
//! let server_public = server.public_key().to_vec();
//!
//! let k1 = client.agree(&server_public).unwrap();
//! let k2 = server.agree(&client_public).unwrap();
//! assert_eq!(k1, k2);
//! ```

use super::algorithm::{AlgorithmRegistry, KexFactory, KexHash, KeyExchange};
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::Arc;

/// Standard name.
pub const CURVE25519_SHA256: &str = "curve25519-sha256";

/// libssh alias of the same method.
pub const CURVE25519_SHA256_LIBSSH: &str = "curve25519-sha256@libssh.org";

/// Curve25519 key exchange.
pub struct Curve25519Exchange {
    private_key: Option<EphemeralPrivateKey>,
    public_key: [u8; 32],
}

impl std::fmt::Debug for Curve25519Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Curve25519Exchange")
            .field("public_key", &hex::encode(self.public_key))
            .field("consumed", &self.private_key.is_none())
            .finish()
    }
}

impl Curve25519Exchange {
    /// Generates a new ephemeral key pair.
    pub fn new() -> SkiffResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| SkiffError::Security("Failed to generate Curve25519 key".to_string()))?;

        let public_key = private_key.compute_public_key().map_err(|_| {
            SkiffError::Security("Failed to compute Curve25519 public key".to_string())
        })?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            private_key: Some(private_key),
            public_key: public_key_bytes,
        })
    }
}

impl KeyExchange for Curve25519Exchange {
    fn hash(&self) -> KexHash {
        KexHash::Sha256
    }

    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn agree(&mut self, peer_public: &[u8]) -> SkiffResult<Vec<u8>> {
        if peer_public.len() != 32 {
            return Err(SkiffError::Protocol(format!(
                "Curve25519 public key must be 32 bytes, got {}",
                peer_public.len()
            )));
        }
        let private_key = self.private_key.take().ok_or_else(|| {
            SkiffError::Security("Curve25519 private key already used".to_string())
        })?;

        let peer_public_key = UnparsedPublicKey::new(&X25519, peer_public);
        let shared = agree_ephemeral(private_key, &peer_public_key, |key_material| {
            key_material.to_vec()
        })
        .map_err(|_| SkiffError::Security("Curve25519 key agreement failed".to_string()))?;

        // RFC 8731 Section 3: an all-zero result must be rejected.
        if shared.iter().all(|&b| b == 0) {
            return Err(SkiffError::Security(
                "Curve25519 shared secret is zero".to_string(),
            ));
        }
        Ok(shared)
    }
}

/// Factory registered under both curve25519 names.
#[derive(Debug, Clone, Copy, Default)]
pub struct Curve25519Factory;

impl KexFactory for Curve25519Factory {
    fn start(&self) -> SkiffResult<Box<dyn KeyExchange>> {
        Ok(Box::new(Curve25519Exchange::new()?))
    }
}

pub(crate) fn register(registry: &mut AlgorithmRegistry) {
    registry.register_kex(CURVE25519_SHA256, Arc::new(Curve25519Factory));
    registry.register_kex(CURVE25519_SHA256_LIBSSH, Arc::new(Curve25519Factory));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curve25519_key_exchange() {
        let mut client = Curve25519Exchange::new().unwrap();
        let mut server = Curve25519Exchange::new().unwrap();

        let client_public = client.public_key().to_vec();
        let server_public = server.public_key().to_vec();

        let client_secret = client.agree(&server_public).unwrap();
        let server_secret = server.agree(&client_public).unwrap();

        assert_eq!(client_secret, server_secret);
        assert_eq!(client_secret.len(), 32);
    }

    #[test]
    fn test_private_key_single_use() {
        let mut client = Curve25519Exchange::new().unwrap();
        let peer = Curve25519Exchange::new().unwrap();
        let peer_public = peer.public_key().to_vec();

        client.agree(&peer_public).unwrap();
        assert!(client.agree(&peer_public).is_err());
    }

    #[test]
    fn test_rejects_bad_length() {
        let mut client = Curve25519Exchange::new().unwrap();
        assert!(matches!(
            client.agree(&[1u8; 31]),
            Err(SkiffError::Protocol(_))
        ));
    }
}
