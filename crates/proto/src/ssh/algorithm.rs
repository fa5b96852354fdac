//! Algorithm capabilities and the name-keyed registry.
//!
//! The transport never names a concrete primitive. Every cipher, MAC,
//! compression method, key exchange and host key algorithm is looked up by
//! its SSH name in an [`AlgorithmRegistry`] and driven through the traits in
//! this module. The registry's insertion order is the local preference order
//! advertised in KEXINIT.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::algorithm::AlgorithmRegistry;
//!
//! let registry = AlgorithmRegistry::with_defaults();
//! assert_eq!(registry.cipher_names()[0], "chacha20-poly1305@openssh.com");
//! assert!(registry.cipher("aes128-ctr").is_some());
//! assert!(registry.mac("hmac-sha2-256-etm@openssh.com").unwrap().is_etm());
//! ```

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use skiff_platform::SkiffResult;
use std::sync::Arc;

/// Direction a cipher instance is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    /// Outbound: encrypt
    Encrypt,
    /// Inbound: decrypt
    Decrypt,
}

/// A non-AEAD cipher instance bound to one direction.
///
/// `apply` is called with whole blocks for block ciphers. Chaining state
/// (CBC) and keystream position (CTR) carry across calls.
pub trait Cipher: Send {
    /// Cipher block size in bytes (stream ciphers report their keystream block).
    fn block_size(&self) -> usize;

    /// Encrypts or decrypts `data` in place.
    fn apply(&mut self, data: &mut [u8]) -> SkiffResult<()>;
}

/// An AEAD cipher instance bound to one direction.
pub trait AeadCipher: Send {
    /// Authentication tag length appended to every packet.
    fn tag_len(&self) -> usize;

    /// Block size used for padding alignment.
    fn block_size(&self) -> usize;

    /// Recovers the packet length from its 4 wire bytes. Ciphers that keep
    /// the length in clear return it unchanged.
    fn decrypt_length(&self, sequence: u32, length: [u8; 4]) -> [u8; 4];

    /// Encrypts `packet` (length field included) in place and appends the tag.
    fn seal(&mut self, sequence: u32, packet: &mut Vec<u8>) -> SkiffResult<()>;

    /// Verifies and decrypts `packet` (length field included, tag appended).
    ///
    /// On success `packet[4..4 + len]` holds the plaintext; the returned value
    /// is the plaintext length excluding the length field.
    fn open(&mut self, sequence: u32, packet: &mut [u8]) -> SkiffResult<usize>;
}

/// A cipher instance of either family.
pub enum CipherInstance {
    /// Block or stream cipher; integrity comes from a separate MAC
    Plain(Box<dyn Cipher>),
    /// Authenticated cipher; no MAC is negotiated for its direction
    Aead(Box<dyn AeadCipher>),
}

/// Creates cipher instances for one SSH cipher name.
pub trait CipherFactory: Send + Sync {
    /// Key length in bytes.
    fn key_len(&self) -> usize;
    /// IV length in bytes.
    fn iv_len(&self) -> usize;
    /// Block size in bytes.
    fn block_size(&self) -> usize;
    /// True for AEAD ciphers.
    fn is_aead(&self) -> bool;
    /// Builds an instance for `direction`.
    fn create(
        &self,
        direction: CipherDirection,
        key: &[u8],
        iv: &[u8],
    ) -> SkiffResult<CipherInstance>;
}

/// A keyed MAC instance.
pub trait PacketMac: Send {
    /// MAC output length in bytes.
    fn mac_len(&self) -> usize;

    /// Computes the MAC over `uint32 sequence || data`.
    fn compute(&self, sequence: u32, data: &[u8]) -> Vec<u8>;

    /// Verifies `received` in constant time.
    fn verify(&self, sequence: u32, data: &[u8], received: &[u8]) -> SkiffResult<()>;
}

/// Creates MAC instances for one SSH MAC name.
pub trait MacFactory: Send + Sync {
    /// Key length in bytes.
    fn key_len(&self) -> usize;
    /// Output length in bytes.
    fn mac_len(&self) -> usize;
    /// True for encrypt-then-MAC variants.
    fn is_etm(&self) -> bool;
    /// Builds a keyed instance.
    fn create(&self, key: &[u8]) -> SkiffResult<Box<dyn PacketMac>>;
}

/// Outbound payload compression.
pub trait Compressor: Send {
    /// Compresses one payload; stream state carries across calls.
    fn compress(&mut self, payload: &[u8]) -> SkiffResult<Vec<u8>>;
}

/// Inbound payload decompression.
pub trait Decompressor: Send {
    /// Decompresses one payload; stream state carries across calls.
    fn decompress(&mut self, payload: &[u8]) -> SkiffResult<Vec<u8>>;
}

/// Creates compression state for one SSH compression name.
pub trait CompressionFactory: Send + Sync {
    /// True when compression starts only after authentication
    /// (`zlib@openssh.com`).
    fn is_delayed(&self) -> bool {
        false
    }
    /// Outbound state, `None` for "none".
    fn compressor(&self) -> Option<Box<dyn Compressor>>;
    /// Inbound state, `None` for "none".
    fn decompressor(&self) -> Option<Box<dyn Decompressor>>;
}

/// Hash function negotiated with the key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexHash {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
}

impl KexHash {
    /// Output length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            KexHash::Sha1 => 20,
            KexHash::Sha256 => 32,
            KexHash::Sha512 => 64,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }

        match self {
            KexHash::Sha1 => run::<Sha1>(parts),
            KexHash::Sha256 => run::<Sha256>(parts),
            KexHash::Sha512 => run::<Sha512>(parts),
        }
    }
}

/// One side of an ephemeral key agreement (ECDH style: one public value per
/// side, exchanged in KEX_ECDH_INIT / KEX_ECDH_REPLY).
pub trait KeyExchange: Send {
    /// Hash used for the exchange hash and key derivation.
    fn hash(&self) -> KexHash;

    /// This side's ephemeral public value.
    fn public_key(&self) -> &[u8];

    /// Computes the shared secret K as an unsigned big-endian magnitude.
    /// Consumes the ephemeral private key.
    fn agree(&mut self, peer_public: &[u8]) -> SkiffResult<Vec<u8>>;
}

/// Creates key exchange state for one SSH kex name.
pub trait KexFactory: Send + Sync {
    /// Starts a new exchange with fresh ephemeral keys.
    fn start(&self) -> SkiffResult<Box<dyn KeyExchange>>;
}

/// Server side host key: proves the server's identity in the exchange hash.
pub trait HostKeySigner: Send + Sync {
    /// SSH algorithm name (e.g. "ssh-ed25519").
    fn algorithm(&self) -> &'static str;

    /// Public key blob in SSH wire format.
    fn public_key_blob(&self) -> Vec<u8>;

    /// Signs `data`, returning the signature blob in SSH wire format.
    fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>>;
}

/// Client side host key check. Trust policy (known hosts) lives behind this
/// trait.
pub trait HostKeyVerifier: Send + Sync {
    /// Verifies `signature_blob` over `data` for `key_blob` and decides whether
    /// the key is trusted.
    fn verify(&self, key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> SkiffResult<()>;
}

/// Name-keyed algorithm registry. Insertion order is preference order.
#[derive(Clone, Default)]
pub struct AlgorithmRegistry {
    kex: Vec<(String, Arc<dyn KexFactory>)>,
    host_key_verifiers: Vec<(String, Arc<dyn HostKeyVerifier>)>,
    ciphers: Vec<(String, Arc<dyn CipherFactory>)>,
    macs: Vec<(String, Arc<dyn MacFactory>)>,
    compression: Vec<(String, Arc<dyn CompressionFactory>)>,
}

impl std::fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgorithmRegistry")
            .field("kex", &self.kex_names())
            .field("host_key", &self.host_key_names())
            .field("ciphers", &self.cipher_names())
            .field("macs", &self.mac_names())
            .field("compression", &self.compression_names())
            .finish()
    }
}

fn lookup<T: ?Sized>(entries: &[(String, Arc<T>)], name: &str) -> Option<Arc<T>> {
    entries
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, f)| Arc::clone(f))
}

fn insert<T: ?Sized>(entries: &mut Vec<(String, Arc<T>)>, name: &str, factory: Arc<T>) {
    match entries.iter_mut().find(|(n, _)| n == name) {
        Some(entry) => entry.1 = factory,
        None => entries.push((name.to_string(), factory)),
    }
}

fn names<T: ?Sized>(entries: &[(String, Arc<T>)]) -> Vec<String> {
    entries.iter().map(|(n, _)| n.clone()).collect()
}

impl AlgorithmRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in algorithms, strongest first.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        super::kex_ecdh::register(&mut registry);
        super::hostkey::register(&mut registry);
        super::crypto::register(&mut registry);
        registry
    }

    /// Registers (or replaces) a key exchange method.
    pub fn register_kex(&mut self, name: &str, factory: Arc<dyn KexFactory>) -> &mut Self {
        insert(&mut self.kex, name, factory);
        self
    }

    /// Registers (or replaces) a host key verifier.
    pub fn register_host_key_verifier(
        &mut self,
        name: &str,
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> &mut Self {
        insert(&mut self.host_key_verifiers, name, verifier);
        self
    }

    /// Registers (or replaces) a cipher.
    pub fn register_cipher(&mut self, name: &str, factory: Arc<dyn CipherFactory>) -> &mut Self {
        insert(&mut self.ciphers, name, factory);
        self
    }

    /// Registers (or replaces) a MAC.
    pub fn register_mac(&mut self, name: &str, factory: Arc<dyn MacFactory>) -> &mut Self {
        insert(&mut self.macs, name, factory);
        self
    }

    /// Registers (or replaces) a compression method.
    pub fn register_compression(
        &mut self,
        name: &str,
        factory: Arc<dyn CompressionFactory>,
    ) -> &mut Self {
        insert(&mut self.compression, name, factory);
        self
    }

    /// Drops every algorithm of each kind not named in `keep`, preserving
    /// the order given by `keep`.
    pub fn restrict_ciphers(&mut self, keep: &[&str]) -> &mut Self {
        self.ciphers = keep
            .iter()
            .filter_map(|name| lookup(&self.ciphers, name).map(|f| (name.to_string(), f)))
            .collect();
        self
    }

    /// Same as [`AlgorithmRegistry::restrict_ciphers`] for MACs.
    pub fn restrict_macs(&mut self, keep: &[&str]) -> &mut Self {
        self.macs = keep
            .iter()
            .filter_map(|name| lookup(&self.macs, name).map(|f| (name.to_string(), f)))
            .collect();
        self
    }

    /// Same as [`AlgorithmRegistry::restrict_ciphers`] for compression.
    pub fn restrict_compression(&mut self, keep: &[&str]) -> &mut Self {
        self.compression = keep
            .iter()
            .filter_map(|name| lookup(&self.compression, name).map(|f| (name.to_string(), f)))
            .collect();
        self
    }

    /// Looks up a key exchange method.
    pub fn kex(&self, name: &str) -> Option<Arc<dyn KexFactory>> {
        lookup(&self.kex, name)
    }

    /// Looks up a host key verifier.
    pub fn host_key_verifier(&self, name: &str) -> Option<Arc<dyn HostKeyVerifier>> {
        lookup(&self.host_key_verifiers, name)
    }

    /// Looks up a cipher.
    pub fn cipher(&self, name: &str) -> Option<Arc<dyn CipherFactory>> {
        lookup(&self.ciphers, name)
    }

    /// Looks up a MAC.
    pub fn mac(&self, name: &str) -> Option<Arc<dyn MacFactory>> {
        lookup(&self.macs, name)
    }

    /// Looks up a compression method.
    pub fn compression(&self, name: &str) -> Option<Arc<dyn CompressionFactory>> {
        lookup(&self.compression, name)
    }

    /// Key exchange names in preference order.
    pub fn kex_names(&self) -> Vec<String> {
        names(&self.kex)
    }

    /// Host key algorithm names this side can verify, in preference order.
    pub fn host_key_names(&self) -> Vec<String> {
        names(&self.host_key_verifiers)
    }

    /// Cipher names in preference order.
    pub fn cipher_names(&self) -> Vec<String> {
        names(&self.ciphers)
    }

    /// MAC names in preference order.
    pub fn mac_names(&self) -> Vec<String> {
        names(&self.macs)
    }

    /// Compression names in preference order.
    pub fn compression_names(&self) -> Vec<String> {
        names(&self.compression)
    }
}
