//! Built-in ciphers, MACs and compression.
//!
//! This module implements the symmetric algorithms registered by
//! [`AlgorithmRegistry::with_defaults`]:
//! - ChaCha20-Poly1305 (OpenSSH AEAD construction, encrypted length)
//! - AES-128-GCM, AES-256-GCM (RFC 5647, length as associated data)
//! - AES-128-CTR, AES-256-CTR (stream ciphers with separate MAC)
//! - AES-128-CBC, AES-256-CBC (block ciphers with separate MAC)
//! - HMAC-SHA1, HMAC-SHA256, HMAC-SHA512 and their encrypt-then-MAC variants
//! - zlib and delayed zlib@openssh.com compression
//!
//! # Security
//!
//! - **AEAD ciphers** - Authenticated encryption with associated data
//! - **Nonce management** - GCM invocation counter advances once per packet
//! - **Constant-time MAC comparison** via `subtle`
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::algorithm::{CipherDirection, CipherFactory, CipherInstance};
//! use skiff_proto::ssh::crypto::CipherAlgorithm;
//!
//! let alg = CipherAlgorithm::Aes128Ctr;
//! let mut enc = match alg.create(CipherDirection::Encrypt, &[7; 16], &[1; 16]).unwrap() {
//!     CipherInstance::Plain(c) => c,
//!     CipherInstance::Aead(_) => unreachable!(),
//! };
//! let mut data = *b"sixteen byte msg";
//! enc.apply(&mut data).unwrap();
//! assert_ne!(&data, b"sixteen byte msg");
//! ```
//!
//! [`AlgorithmRegistry::with_defaults`]: super::algorithm::AlgorithmRegistry::with_defaults

use super::algorithm::{
    AeadCipher, AlgorithmRegistry, Cipher, CipherDirection, CipherFactory, CipherInstance,
    CompressionFactory, Compressor, Decompressor, MacFactory, PacketMac,
};
use aes::{Aes128, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use hmac::{Hmac, Mac};
use ring::aead::chacha20_poly1305_openssh::{
    OpeningKey as ChaChaOpeningKey, SealingKey as ChaChaSealingKey, KEY_LEN as CHACHA_KEY_LEN,
    TAG_LEN as CHACHA_TAG_LEN,
};
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_128_GCM,
    AES_256_GCM,
};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Largest payload a single compressed packet may inflate to.
pub const MAX_DECOMPRESSED_SIZE: usize = 256 * 1024;

/// GCM nonce: 4 fixed bytes followed by a 64-bit invocation counter that
/// advances once per packet (RFC 5647 Section 7.1).
struct GcmNonce {
    fixed: [u8; 4],
    invocation: u64,
}

impl GcmNonce {
    fn new(iv: &[u8]) -> Self {
        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&iv[4..12]);
        Self {
            fixed,
            invocation: u64::from_be_bytes(counter),
        }
    }
}

impl NonceSequence for GcmNonce {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[..4].copy_from_slice(&self.fixed);
        nonce_bytes[4..].copy_from_slice(&self.invocation.to_be_bytes());
        self.invocation = self.invocation.wrapping_add(1);
        Nonce::try_assume_unique_for_key(&nonce_bytes)
    }
}

/// Cipher algorithms shipped with the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// ChaCha20-Poly1305 AEAD cipher
    ChaCha20Poly1305,
    /// AES-128-GCM AEAD cipher
    Aes128Gcm,
    /// AES-256-GCM AEAD cipher
    Aes256Gcm,
    /// AES-128-CTR stream cipher (requires separate MAC)
    Aes128Ctr,
    /// AES-256-CTR stream cipher (requires separate MAC)
    Aes256Ctr,
    /// AES-128-CBC block cipher (requires separate MAC)
    Aes128Cbc,
    /// AES-256-CBC block cipher (requires separate MAC)
    Aes256Cbc,
}

impl CipherAlgorithm {
    /// All built-in ciphers, strongest first.
    pub const ALL: [CipherAlgorithm; 7] = [
        CipherAlgorithm::ChaCha20Poly1305,
        CipherAlgorithm::Aes256Gcm,
        CipherAlgorithm::Aes128Gcm,
        CipherAlgorithm::Aes256Ctr,
        CipherAlgorithm::Aes128Ctr,
        CipherAlgorithm::Aes256Cbc,
        CipherAlgorithm::Aes128Cbc,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
        }
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.name() == name)
    }
}

impl CipherFactory for CipherAlgorithm {
    fn key_len(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => CHACHA_KEY_LEN,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes256Cbc => 32,
        }
    }

    fn iv_len(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 0,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 12,
            _ => 16,
        }
    }

    fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 8,
            _ => 16,
        }
    }

    fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherAlgorithm::ChaCha20Poly1305
                | CipherAlgorithm::Aes128Gcm
                | CipherAlgorithm::Aes256Gcm
        )
    }

    fn create(
        &self,
        direction: CipherDirection,
        key: &[u8],
        iv: &[u8],
    ) -> SkiffResult<CipherInstance> {
        if key.len() < self.key_len() || iv.len() < self.iv_len() {
            return Err(SkiffError::Security(format!(
                "Insufficient key material for {}: key {} of {}, iv {} of {}",
                self.name(),
                key.len(),
                self.key_len(),
                iv.len(),
                self.iv_len()
            )));
        }
        let key = &key[..self.key_len()];
        let iv = &iv[..self.iv_len()];

        let instance = match self {
            CipherAlgorithm::ChaCha20Poly1305 => {
                let mut material = [0u8; CHACHA_KEY_LEN];
                material.copy_from_slice(key);
                let cipher = match direction {
                    CipherDirection::Encrypt => {
                        ChaChaPoly::Sealing(ChaChaSealingKey::new(&material))
                    }
                    CipherDirection::Decrypt => {
                        ChaChaPoly::Opening(ChaChaOpeningKey::new(&material))
                    }
                };
                zeroize::Zeroize::zeroize(&mut material);
                CipherInstance::Aead(Box::new(cipher))
            }
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => {
                let algorithm = if *self == CipherAlgorithm::Aes128Gcm {
                    &AES_128_GCM
                } else {
                    &AES_256_GCM
                };
                let unbound = UnboundKey::new(algorithm, key).map_err(|_| {
                    SkiffError::Security(format!("Failed to create {} key", self.name()))
                })?;
                let cipher = match direction {
                    CipherDirection::Encrypt => {
                        AesGcm::Sealing(SealingKey::new(unbound, GcmNonce::new(iv)))
                    }
                    CipherDirection::Decrypt => {
                        AesGcm::Opening(OpeningKey::new(unbound, GcmNonce::new(iv)))
                    }
                };
                CipherInstance::Aead(Box::new(cipher))
            }
            CipherAlgorithm::Aes128Ctr => CipherInstance::Plain(Box::new(StreamMode(
                ctr::Ctr128BE::<Aes128>::new_from_slices(key, iv).map_err(invalid_length)?,
            ))),
            CipherAlgorithm::Aes256Ctr => CipherInstance::Plain(Box::new(StreamMode(
                ctr::Ctr128BE::<Aes256>::new_from_slices(key, iv).map_err(invalid_length)?,
            ))),
            CipherAlgorithm::Aes128Cbc => CipherInstance::Plain(match direction {
                CipherDirection::Encrypt => Box::new(CbcEncrypt(
                    cbc::Encryptor::<Aes128>::new_from_slices(key, iv).map_err(invalid_length)?,
                )),
                CipherDirection::Decrypt => Box::new(CbcDecrypt(
                    cbc::Decryptor::<Aes128>::new_from_slices(key, iv).map_err(invalid_length)?,
                )),
            }),
            CipherAlgorithm::Aes256Cbc => CipherInstance::Plain(match direction {
                CipherDirection::Encrypt => Box::new(CbcEncrypt(
                    cbc::Encryptor::<Aes256>::new_from_slices(key, iv).map_err(invalid_length)?,
                )),
                CipherDirection::Decrypt => Box::new(CbcDecrypt(
                    cbc::Decryptor::<Aes256>::new_from_slices(key, iv).map_err(invalid_length)?,
                )),
            }),
        };

        Ok(instance)
    }
}

fn invalid_length(_: cipher::InvalidLength) -> SkiffError {
    SkiffError::Security("Invalid cipher key or IV length".to_string())
}

/// CTR keystream applied in place.
struct StreamMode<C>(C);

impl<C: StreamCipher + Send> Cipher for StreamMode<C> {
    fn block_size(&self) -> usize {
        16
    }

    fn apply(&mut self, data: &mut [u8]) -> SkiffResult<()> {
        self.0.apply_keystream(data);
        Ok(())
    }
}

/// CBC encryption; the chaining value carries across packets.
struct CbcEncrypt<C>(C);

impl<C: BlockEncryptMut + Send> Cipher for CbcEncrypt<C> {
    fn block_size(&self) -> usize {
        C::block_size()
    }

    fn apply(&mut self, data: &mut [u8]) -> SkiffResult<()> {
        let block_size = C::block_size();
        if data.len() % block_size != 0 {
            return Err(SkiffError::Protocol(format!(
                "CBC input of {} bytes is not block aligned",
                data.len()
            )));
        }
        for block in data.chunks_exact_mut(block_size) {
            self.0.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

/// CBC decryption; the chaining value carries across packets.
struct CbcDecrypt<C>(C);

impl<C: BlockDecryptMut + Send> Cipher for CbcDecrypt<C> {
    fn block_size(&self) -> usize {
        C::block_size()
    }

    fn apply(&mut self, data: &mut [u8]) -> SkiffResult<()> {
        let block_size = C::block_size();
        if data.len() % block_size != 0 {
            return Err(SkiffError::Protocol(format!(
                "CBC input of {} bytes is not block aligned",
                data.len()
            )));
        }
        for block in data.chunks_exact_mut(block_size) {
            self.0.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

/// chacha20-poly1305@openssh.com in one direction.
enum ChaChaPoly {
    Sealing(ChaChaSealingKey),
    Opening(ChaChaOpeningKey),
}

impl AeadCipher for ChaChaPoly {
    fn tag_len(&self) -> usize {
        CHACHA_TAG_LEN
    }

    fn block_size(&self) -> usize {
        8
    }

    fn decrypt_length(&self, sequence: u32, length: [u8; 4]) -> [u8; 4] {
        match self {
            ChaChaPoly::Opening(key) => key.decrypt_packet_length(sequence, length),
            ChaChaPoly::Sealing(_) => length,
        }
    }

    fn seal(&mut self, sequence: u32, packet: &mut Vec<u8>) -> SkiffResult<()> {
        let ChaChaPoly::Sealing(key) = self else {
            return Err(wrong_direction());
        };
        let mut tag = [0u8; CHACHA_TAG_LEN];
        key.seal_in_place(sequence, packet, &mut tag);
        packet.extend_from_slice(&tag);
        Ok(())
    }

    fn open(&mut self, sequence: u32, packet: &mut [u8]) -> SkiffResult<usize> {
        let ChaChaPoly::Opening(key) = self else {
            return Err(wrong_direction());
        };
        if packet.len() < 4 + CHACHA_TAG_LEN {
            return Err(SkiffError::Protocol("AEAD packet too short".to_string()));
        }
        let split = packet.len() - CHACHA_TAG_LEN;
        let (body, tag) = packet.split_at_mut(split);
        let mut tag_bytes = [0u8; CHACHA_TAG_LEN];
        tag_bytes.copy_from_slice(tag);
        let plaintext = key
            .open_in_place(sequence, body, &tag_bytes)
            .map_err(|_| SkiffError::Security("Authentication tag mismatch".to_string()))?;
        Ok(plaintext.len())
    }
}

/// aesN-gcm@openssh.com in one direction.
enum AesGcm {
    Sealing(SealingKey<GcmNonce>),
    Opening(OpeningKey<GcmNonce>),
}

impl AeadCipher for AesGcm {
    fn tag_len(&self) -> usize {
        16
    }

    fn block_size(&self) -> usize {
        16
    }

    fn decrypt_length(&self, _sequence: u32, length: [u8; 4]) -> [u8; 4] {
        length
    }

    fn seal(&mut self, _sequence: u32, packet: &mut Vec<u8>) -> SkiffResult<()> {
        let AesGcm::Sealing(key) = self else {
            return Err(wrong_direction());
        };
        let aad = [packet[0], packet[1], packet[2], packet[3]];
        let tag = key
            .seal_in_place_separate_tag(Aad::from(aad), &mut packet[4..])
            .map_err(|_| SkiffError::Security("Encryption failed".to_string()))?;
        packet.extend_from_slice(tag.as_ref());
        Ok(())
    }

    fn open(&mut self, _sequence: u32, packet: &mut [u8]) -> SkiffResult<usize> {
        let AesGcm::Opening(key) = self else {
            return Err(wrong_direction());
        };
        if packet.len() < 4 + 16 {
            return Err(SkiffError::Protocol("AEAD packet too short".to_string()));
        }
        let aad = [packet[0], packet[1], packet[2], packet[3]];
        let plaintext = key
            .open_in_place(Aad::from(aad), &mut packet[4..])
            .map_err(|_| {
                SkiffError::Security(
                    "Decryption failed or authentication tag mismatch".to_string(),
                )
            })?;
        Ok(plaintext.len())
    }
}

fn wrong_direction() -> SkiffError {
    SkiffError::Security("Cipher used in the wrong direction".to_string())
}

/// MAC algorithms shipped with the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA256, encrypt-then-MAC
    HmacSha256Etm,
    /// HMAC-SHA512, encrypt-then-MAC
    HmacSha512Etm,
    /// HMAC-SHA1, encrypt-then-MAC
    HmacSha1Etm,
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
    /// HMAC-SHA1
    HmacSha1,
}

impl MacAlgorithm {
    /// All built-in MACs, preferred first.
    pub const ALL: [MacAlgorithm; 6] = [
        MacAlgorithm::HmacSha256Etm,
        MacAlgorithm::HmacSha512Etm,
        MacAlgorithm::HmacSha1Etm,
        MacAlgorithm::HmacSha256,
        MacAlgorithm::HmacSha512,
        MacAlgorithm::HmacSha1,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256Etm => "hmac-sha2-256-etm@openssh.com",
            MacAlgorithm::HmacSha512Etm => "hmac-sha2-512-etm@openssh.com",
            MacAlgorithm::HmacSha1Etm => "hmac-sha1-etm@openssh.com",
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
            MacAlgorithm::HmacSha1 => "hmac-sha1",
        }
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.name() == name)
    }
}

impl MacFactory for MacAlgorithm {
    fn key_len(&self) -> usize {
        self.mac_len()
    }

    fn mac_len(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 | MacAlgorithm::HmacSha1Etm => 20,
            MacAlgorithm::HmacSha256 | MacAlgorithm::HmacSha256Etm => 32,
            MacAlgorithm::HmacSha512 | MacAlgorithm::HmacSha512Etm => 64,
        }
    }

    fn is_etm(&self) -> bool {
        matches!(
            self,
            MacAlgorithm::HmacSha1Etm | MacAlgorithm::HmacSha256Etm | MacAlgorithm::HmacSha512Etm
        )
    }

    fn create(&self, key: &[u8]) -> SkiffResult<Box<dyn PacketMac>> {
        Ok(Box::new(MacKey::new(*self, key)?))
    }
}

enum HmacState {
    Sha1(Hmac<Sha1>),
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

/// Keyed HMAC instance.
pub struct MacKey {
    algorithm: MacAlgorithm,
    state: HmacState,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a new MAC key.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> SkiffResult<Self> {
        let key_len = algorithm.key_len();
        if key_material.len() < key_len {
            return Err(SkiffError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                key_len,
                key_material.len()
            )));
        }
        let key = &key_material[..key_len];
        let invalid = |_| SkiffError::Security("Invalid HMAC key".to_string());

        let state = match algorithm {
            MacAlgorithm::HmacSha1 | MacAlgorithm::HmacSha1Etm => {
                HmacState::Sha1(Hmac::<Sha1>::new_from_slice(key).map_err(invalid)?)
            }
            MacAlgorithm::HmacSha256 | MacAlgorithm::HmacSha256Etm => {
                HmacState::Sha256(Hmac::<Sha256>::new_from_slice(key).map_err(invalid)?)
            }
            MacAlgorithm::HmacSha512 | MacAlgorithm::HmacSha512Etm => {
                HmacState::Sha512(Hmac::<Sha512>::new_from_slice(key).map_err(invalid)?)
            }
        };

        Ok(Self { algorithm, state })
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

impl PacketMac for MacKey {
    fn mac_len(&self) -> usize {
        self.algorithm.mac_len()
    }

    fn compute(&self, sequence: u32, data: &[u8]) -> Vec<u8> {
        let seq = sequence.to_be_bytes();
        match &self.state {
            HmacState::Sha1(mac) => {
                let mut mac = mac.clone();
                mac.update(&seq);
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            HmacState::Sha256(mac) => {
                let mut mac = mac.clone();
                mac.update(&seq);
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            HmacState::Sha512(mac) => {
                let mut mac = mac.clone();
                mac.update(&seq);
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    fn verify(&self, sequence: u32, data: &[u8], received: &[u8]) -> SkiffResult<()> {
        let computed = self.compute(sequence, data);

        if computed.len() != received.len() {
            return Err(SkiffError::Security("MAC length mismatch".to_string()));
        }

        if computed.ct_eq(received).into() {
            Ok(())
        } else {
            Err(SkiffError::Security("MAC verification failed".to_string()))
        }
    }
}

/// Compression methods shipped with the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// zlib from the first packet after NEWKEYS
    Zlib,
    /// zlib, enabled only once authentication succeeds
    ZlibOpenssh,
}

impl CompressionAlgorithm {
    /// All built-in methods, preferred first.
    pub const ALL: [CompressionAlgorithm; 3] = [
        CompressionAlgorithm::None,
        CompressionAlgorithm::ZlibOpenssh,
        CompressionAlgorithm::Zlib,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::ZlibOpenssh => "zlib@openssh.com",
        }
    }
}

impl CompressionFactory for CompressionAlgorithm {
    fn is_delayed(&self) -> bool {
        *self == CompressionAlgorithm::ZlibOpenssh
    }

    fn compressor(&self) -> Option<Box<dyn Compressor>> {
        match self {
            CompressionAlgorithm::None => None,
            _ => Some(Box::new(ZlibCompressor {
                inner: Compress::new(Compression::default(), true),
            })),
        }
    }

    fn decompressor(&self) -> Option<Box<dyn Decompressor>> {
        match self {
            CompressionAlgorithm::None => None,
            _ => Some(Box::new(ZlibDecompressor {
                inner: Decompress::new(true),
            })),
        }
    }
}

/// Streaming zlib with a partial flush after every payload.
struct ZlibCompressor {
    inner: Compress,
}

impl Compressor for ZlibCompressor {
    fn compress(&mut self, payload: &[u8]) -> SkiffResult<Vec<u8>> {
        let mut output = Vec::with_capacity(payload.len() + 64);
        let mut consumed = 0;

        loop {
            let before = self.inner.total_in();
            self.inner
                .compress_vec(&payload[consumed..], &mut output, FlushCompress::Partial)
                .map_err(|e| SkiffError::Protocol(format!("zlib compression failed: {}", e)))?;
            consumed += (self.inner.total_in() - before) as usize;

            if consumed == payload.len() && output.len() < output.capacity() {
                return Ok(output);
            }
            output.reserve(output.capacity().max(64));
        }
    }
}

/// Streaming zlib inflater, synced at every payload boundary.
struct ZlibDecompressor {
    inner: Decompress,
}

impl Decompressor for ZlibDecompressor {
    fn decompress(&mut self, payload: &[u8]) -> SkiffResult<Vec<u8>> {
        let mut output = Vec::with_capacity(payload.len() * 4 + 64);
        let mut consumed = 0;

        loop {
            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();
            let status = self
                .inner
                .decompress_vec(&payload[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|e| SkiffError::Protocol(format!("zlib decompression failed: {}", e)))?;
            let read = (self.inner.total_in() - before_in) as usize;
            consumed += read;

            if output.len() > MAX_DECOMPRESSED_SIZE {
                return Err(SkiffError::Protocol(format!(
                    "Decompressed payload exceeds {} bytes",
                    MAX_DECOMPRESSED_SIZE
                )));
            }
            let stalled = read == 0 && self.inner.total_out() == before_out;
            if status == Status::StreamEnd
                || (consumed == payload.len() && (stalled || output.len() < output.capacity()))
            {
                return Ok(output);
            }
            if stalled && output.len() < output.capacity() {
                return Err(SkiffError::Protocol(
                    "zlib stream made no progress".to_string(),
                ));
            }
            output.reserve(output.capacity().max(256));
        }
    }
}

/// Registers every built-in cipher, MAC and compression method.
pub(crate) fn register(registry: &mut AlgorithmRegistry) {
    for alg in CipherAlgorithm::ALL {
        registry.register_cipher(alg.name(), Arc::new(alg));
    }
    for alg in MacAlgorithm::ALL {
        registry.register_mac(alg.name(), Arc::new(alg));
    }
    for alg in CompressionAlgorithm::ALL {
        registry.register_compression(alg.name(), Arc::new(alg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(instance: CipherInstance) -> Box<dyn Cipher> {
        match instance {
            CipherInstance::Plain(c) => c,
            CipherInstance::Aead(_) => panic!("expected plain cipher"),
        }
    }

    fn aead(instance: CipherInstance) -> Box<dyn AeadCipher> {
        match instance {
            CipherInstance::Aead(c) => c,
            CipherInstance::Plain(_) => panic!("expected AEAD cipher"),
        }
    }

    #[test]
    fn test_cipher_from_name() {
        assert_eq!(
            CipherAlgorithm::from_name("aes256-cbc"),
            Some(CipherAlgorithm::Aes256Cbc)
        );
        assert_eq!(CipherAlgorithm::from_name("blowfish-cbc"), None);
        assert_eq!(CipherAlgorithm::ChaCha20Poly1305.key_len(), 64);
        assert_eq!(CipherAlgorithm::Aes128Gcm.iv_len(), 12);
    }

    #[test]
    fn test_cbc_chains_across_calls() {
        let key = [3u8; 32];
        let iv = [9u8; 16];
        let alg = CipherAlgorithm::Aes256Cbc;
        let mut enc = plain(alg.create(CipherDirection::Encrypt, &key, &iv).unwrap());
        let mut dec = plain(alg.create(CipherDirection::Decrypt, &key, &iv).unwrap());

        let mut first = [0x41u8; 32];
        let mut second = [0x41u8; 32];
        enc.apply(&mut first).unwrap();
        enc.apply(&mut second).unwrap();
        // Identical plaintext encrypts differently once the chain advances.
        assert_ne!(first, second);

        dec.apply(&mut first[..16]).unwrap();
        dec.apply(&mut first[16..]).unwrap();
        dec.apply(&mut second).unwrap();
        assert_eq!(first, [0x41u8; 32]);
        assert_eq!(second, [0x41u8; 32]);
    }

    #[test]
    fn test_cbc_rejects_partial_block() {
        let mut enc = plain(
            CipherAlgorithm::Aes128Cbc
                .create(CipherDirection::Encrypt, &[1; 16], &[2; 16])
                .unwrap(),
        );
        assert!(enc.apply(&mut [0u8; 15]).is_err());
    }

    #[test]
    fn test_chacha20_seal_open() {
        let key = [0x42u8; 64];
        let alg = CipherAlgorithm::ChaCha20Poly1305;
        let mut sealer = aead(alg.create(CipherDirection::Encrypt, &key, &[]).unwrap());
        let mut opener = aead(alg.create(CipherDirection::Decrypt, &key, &[]).unwrap());

        let mut packet = vec![0, 0, 0, 12, 4, 1, 2, 3, 4, 5, 6, 7, 0, 0, 0, 0];
        let original = packet.clone();
        sealer.seal(7, &mut packet).unwrap();
        assert_eq!(packet.len(), original.len() + 16);

        let length = opener.decrypt_length(7, [packet[0], packet[1], packet[2], packet[3]]);
        assert_eq!(length, [0, 0, 0, 12]);

        let plain_len = opener.open(7, &mut packet).unwrap();
        assert_eq!(plain_len, 12);
        assert_eq!(&packet[4..16], &original[4..]);
    }

    #[test]
    fn test_chacha20_wrong_sequence_fails() {
        let key = [0x42u8; 64];
        let alg = CipherAlgorithm::ChaCha20Poly1305;
        let mut sealer = aead(alg.create(CipherDirection::Encrypt, &key, &[]).unwrap());
        let mut opener = aead(alg.create(CipherDirection::Decrypt, &key, &[]).unwrap());

        let mut packet = vec![0, 0, 0, 8, 4, 9, 9, 9, 0, 0, 0, 0];
        sealer.seal(1, &mut packet).unwrap();
        assert!(matches!(
            opener.open(2, &mut packet),
            Err(SkiffError::Security(_))
        ));
    }

    #[test]
    fn test_aes_gcm_seal_open() {
        let key = [0x11u8; 16];
        let iv = [0x22u8; 12];
        let alg = CipherAlgorithm::Aes128Gcm;
        let mut sealer = aead(alg.create(CipherDirection::Encrypt, &key, &iv).unwrap());
        let mut opener = aead(alg.create(CipherDirection::Decrypt, &key, &iv).unwrap());

        for round in 0..3u8 {
            let mut packet = vec![0, 0, 0, 16, 10, round, 1, 2, 3, 4, 5, 0, 0, 0, 0, 0, 0, 0, 0, 0];
            let original = packet.clone();
            sealer.seal(0, &mut packet).unwrap();
            // Length stays in clear as associated data.
            assert_eq!(&packet[..4], &original[..4]);
            let plain_len = opener.open(0, &mut packet).unwrap();
            assert_eq!(plain_len, 16);
            assert_eq!(&packet[4..20], &original[4..]);
        }
    }

    #[test]
    fn test_mac_compute_and_verify() {
        let mac = MacKey::new(MacAlgorithm::HmacSha256, &[0x42; 32]).unwrap();
        let tag = mac.compute(5, b"packet");
        assert_eq!(tag.len(), 32);
        assert!(mac.verify(5, b"packet", &tag).is_ok());
        assert!(mac.verify(6, b"packet", &tag).is_err());
        assert!(mac.verify(5, b"packet", &tag[..31]).is_err());
    }

    #[test]
    fn test_mac_properties() {
        assert!(MacAlgorithm::HmacSha1Etm.is_etm());
        assert!(!MacAlgorithm::HmacSha1.is_etm());
        assert_eq!(MacAlgorithm::HmacSha512.mac_len(), 64);
        assert_eq!(
            MacAlgorithm::from_name("hmac-sha2-512-etm@openssh.com"),
            Some(MacAlgorithm::HmacSha512Etm)
        );
        assert!(MacKey::new(MacAlgorithm::HmacSha512, &[0; 32]).is_err());
    }

    #[test]
    fn test_zlib_stream_across_payloads() {
        let alg = CompressionAlgorithm::Zlib;
        let mut compressor = alg.compressor().unwrap();
        let mut decompressor = alg.decompressor().unwrap();

        let first = b"hello hello hello hello hello".to_vec();
        let second = vec![b'x'; 10_000];

        let c1 = compressor.compress(&first).unwrap();
        let c2 = compressor.compress(&second).unwrap();
        assert!(c2.len() < second.len());

        assert_eq!(decompressor.decompress(&c1).unwrap(), first);
        assert_eq!(decompressor.decompress(&c2).unwrap(), second);
    }

    #[test]
    fn test_none_compression() {
        assert!(CompressionAlgorithm::None.compressor().is_none());
        assert!(!CompressionAlgorithm::Zlib.is_delayed());
        assert!(CompressionAlgorithm::ZlibOpenssh.is_delayed());
    }
}
