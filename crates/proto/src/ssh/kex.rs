//! SSH key exchange (KEX) implementation (RFC 4253 Section 7).
//!
//! This module implements the pieces of SSH key exchange that do not depend
//! on connection state:
//! - SSH_MSG_KEXINIT message
//! - SSH_MSG_NEWKEYS message
//! - Algorithm negotiation
//! - SSH_MSG_KEX_ECDH_INIT / SSH_MSG_KEX_ECDH_REPLY (RFC 5656 Section 4)
//! - Exchange hash and key derivation
//!
//! The orchestration of a key exchange (who sends what, when keys are
//! staged) lives in [`crate::ssh::transport`].
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client entry the server supports wins)
//! 3. Key exchange (ECDH)
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Switch to the new keys
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::algorithm::AlgorithmRegistry;
//! use skiff_proto::ssh::kex::{KexInit, NewKeys};
//!
//! let registry = AlgorithmRegistry::with_defaults();
//! let kexinit = KexInit::from_registry(&registry, registry.host_key_names());
//! assert!(kexinit.kex_algorithms().contains(&"curve25519-sha256".to_string()));
//!
//! let bytes = NewKeys::new().to_bytes();
//! assert_eq!(bytes, vec![21]);
//! ```

use super::algorithm::{AlgorithmRegistry, CipherDirection, KexHash};
use super::message::{expect_type, MessageType};
use super::packet::DirectionKeys;
use super::wire::{
    encode_mpint, read_bool, read_bytes, read_name_list, read_u32, write_bool, write_bytes,
    write_name_list,
};
use bytes::{BufMut, BytesMut};
use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};
use zeroize::Zeroizing;

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference (most preferred first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT with a fresh random cookie and the same lists in
    /// both directions.
    pub fn new(
        kex_algorithms: Vec<String>,
        server_host_key_algorithms: Vec<String>,
        ciphers: Vec<String>,
        macs: Vec<String>,
        compression: Vec<String>,
    ) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server: ciphers.clone(),
            encryption_algorithms_server_to_client: ciphers,
            mac_algorithms_client_to_server: macs.clone(),
            mac_algorithms_server_to_client: macs,
            compression_algorithms_client_to_server: compression.clone(),
            compression_algorithms_server_to_client: compression,
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Builds our proposal from everything registered, in registry order.
    ///
    /// `host_key_algorithms` is the verifier list for a client and the list
    /// of loaded host keys for a server.
    pub fn from_registry(registry: &AlgorithmRegistry, host_key_algorithms: Vec<String>) -> Self {
        Self::new(
            registry.kex_names(),
            host_key_algorithms,
            registry.cipher_names(),
            registry.mac_names(),
            registry.compression_names(),
        )
    }

    /// Sets the first_kex_packet_follows flag.
    pub fn with_first_kex_packet_follows(mut self, follows: bool) -> Self {
        self.first_kex_packet_follows = follows;
        self
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the MAC algorithms (client to server).
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the MAC algorithms (server to client).
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns the compression algorithms (client to server).
    pub fn compression_algorithms_client_to_server(&self) -> &[String] {
        &self.compression_algorithms_client_to_server
    }

    /// Returns the compression algorithms (server to client).
    pub fn compression_algorithms_server_to_client(&self) -> &[String] {
        &self.compression_algorithms_server_to_client
    }

    /// Returns whether first KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the KEXINIT message to bytes (without packet framing).
    ///
    /// Format (RFC 4253 Section 7.1):
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie (random bytes)
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved for future extension)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        write_name_list(&mut buf, &self.kex_algorithms);
        write_name_list(&mut buf, &self.server_host_key_algorithms);
        write_name_list(&mut buf, &self.encryption_algorithms_client_to_server);
        write_name_list(&mut buf, &self.encryption_algorithms_server_to_client);
        write_name_list(&mut buf, &self.mac_algorithms_client_to_server);
        write_name_list(&mut buf, &self.mac_algorithms_server_to_client);
        write_name_list(&mut buf, &self.compression_algorithms_client_to_server);
        write_name_list(&mut buf, &self.compression_algorithms_server_to_client);
        write_name_list(&mut buf, &self.languages_client_to_server);
        write_name_list(&mut buf, &self.languages_server_to_client);

        write_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0);

        buf.to_vec()
    }

    /// Parses a KEXINIT message from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if the message type is wrong or any
    /// field is truncated.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::KexInit)?;

        if data.len() < 17 {
            return Err(SkiffError::Protocol(format!(
                "KEXINIT message too short: {} bytes (minimum 17)",
                data.len()
            )));
        }
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&data[1..17]);
        offset = 17;

        let kex_algorithms = read_name_list(data, &mut offset)?;
        let server_host_key_algorithms = read_name_list(data, &mut offset)?;
        let encryption_algorithms_client_to_server = read_name_list(data, &mut offset)?;
        let encryption_algorithms_server_to_client = read_name_list(data, &mut offset)?;
        let mac_algorithms_client_to_server = read_name_list(data, &mut offset)?;
        let mac_algorithms_server_to_client = read_name_list(data, &mut offset)?;
        let compression_algorithms_client_to_server = read_name_list(data, &mut offset)?;
        let compression_algorithms_server_to_client = read_name_list(data, &mut offset)?;
        let languages_client_to_server = read_name_list(data, &mut offset)?;
        let languages_server_to_client = read_name_list(data, &mut offset)?;
        let first_kex_packet_follows = read_bool(data, &mut offset)?;
        // reserved
        read_u32(data, &mut offset)?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// After a side sends NEWKEYS, every packet it sends uses the new keys;
/// after it receives NEWKEYS, every packet it reads does. Sequence numbers
/// are never reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the NEWKEYS message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS message from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::NewKeys)?;
        Ok(Self)
    }
}

/// SSH_MSG_KEX_ECDH_INIT (RFC 5656 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexEcdhInit {
    /// Client ephemeral public key (Q_C)
    pub client_public: Vec<u8>,
}

impl KexEcdhInit {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexEcdhInit as u8);
        write_bytes(&mut buf, &self.client_public);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::KexEcdhInit)?;
        Ok(Self {
            client_public: read_bytes(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_KEX_ECDH_REPLY (RFC 5656 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexEcdhReply {
    /// Server public host key blob (K_S)
    pub host_key: Vec<u8>,
    /// Server ephemeral public key (Q_S)
    pub server_public: Vec<u8>,
    /// Signature blob over the exchange hash
    pub signature: Vec<u8>,
}

impl KexEcdhReply {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexEcdhReply as u8);
        write_bytes(&mut buf, &self.host_key);
        write_bytes(&mut buf, &self.server_public);
        write_bytes(&mut buf, &self.signature);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::KexEcdhReply)?;
        Ok(Self {
            host_key: read_bytes(data, &mut offset)?,
            server_public: read_bytes(data, &mut offset)?,
            signature: read_bytes(data, &mut offset)?,
        })
    }
}

/// Negotiates algorithms between client and server.
///
/// Uses the first algorithm from the client's list that also appears in the
/// server's list (RFC 4253 Section 7.1).
///
/// # Example
///
/// ```rust
/// use skiff_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
/// let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
///
/// let result = negotiate_algorithm(&client, &server).unwrap();
/// assert_eq!(result, "aes256-ctr");
/// ```
pub fn negotiate_algorithm(client_list: &[String], server_list: &[String]) -> SkiffResult<String> {
    client_list
        .iter()
        .find(|name| server_list.contains(name))
        .cloned()
        .ok_or_else(|| {
            SkiffError::Protocol(format!(
                "No common algorithm: client={:?}, server={:?}",
                client_list, server_list
            ))
        })
}

/// Outcome of negotiating two KEXINIT messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Key exchange method
    pub kex: String,
    /// Server host key algorithm
    pub host_key: String,
    /// Cipher client to server
    pub cipher_client_to_server: String,
    /// Cipher server to client
    pub cipher_server_to_client: String,
    /// MAC client to server (None when the cipher is AEAD)
    pub mac_client_to_server: Option<String>,
    /// MAC server to client (None when the cipher is AEAD)
    pub mac_server_to_client: Option<String>,
    /// Compression client to server
    pub compression_client_to_server: String,
    /// Compression server to client
    pub compression_server_to_client: String,
}

impl Negotiated {
    /// Runs the selection rule over every algorithm category.
    ///
    /// The registry decides which ciphers are AEAD; for those the MAC list
    /// of that direction is not consulted.
    pub fn negotiate(
        client: &KexInit,
        server: &KexInit,
        registry: &AlgorithmRegistry,
    ) -> SkiffResult<Self> {
        let kex = negotiate_algorithm(&client.kex_algorithms, &server.kex_algorithms)?;
        let host_key = negotiate_algorithm(
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
        )?;
        let cipher_client_to_server = negotiate_algorithm(
            &client.encryption_algorithms_client_to_server,
            &server.encryption_algorithms_client_to_server,
        )?;
        let cipher_server_to_client = negotiate_algorithm(
            &client.encryption_algorithms_server_to_client,
            &server.encryption_algorithms_server_to_client,
        )?;

        let mac_for = |cipher: &str, client_list: &[String], server_list: &[String]| {
            let factory = registry.cipher(cipher).ok_or_else(|| {
                SkiffError::Protocol(format!("Cipher {} is not registered", cipher))
            })?;
            if factory.is_aead() {
                Ok(None)
            } else {
                negotiate_algorithm(client_list, server_list).map(Some)
            }
        };
        let mac_client_to_server = mac_for(
            &cipher_client_to_server,
            &client.mac_algorithms_client_to_server,
            &server.mac_algorithms_client_to_server,
        )?;
        let mac_server_to_client = mac_for(
            &cipher_server_to_client,
            &client.mac_algorithms_server_to_client,
            &server.mac_algorithms_server_to_client,
        )?;

        let compression_client_to_server = negotiate_algorithm(
            &client.compression_algorithms_client_to_server,
            &server.compression_algorithms_client_to_server,
        )?;
        let compression_server_to_client = negotiate_algorithm(
            &client.compression_algorithms_server_to_client,
            &server.compression_algorithms_server_to_client,
        )?;

        Ok(Self {
            kex,
            host_key,
            cipher_client_to_server,
            cipher_server_to_client,
            mac_client_to_server,
            mac_server_to_client,
            compression_client_to_server,
            compression_server_to_client,
        })
    }
}

/// Whether a guessed first kex packet matches the negotiated methods.
///
/// RFC 4253 Section 7: the guess is wrong when the preferred kex or host key
/// algorithm differs between the two sides.
pub fn guess_is_correct(client: &KexInit, server: &KexInit) -> bool {
    client.kex_algorithms.first() == server.kex_algorithms.first()
        && client.server_host_key_algorithms.first() == server.server_host_key_algorithms.first()
}

/// Inputs to the ECDH exchange hash (RFC 5656 Section 4).
#[derive(Debug, Clone, Copy)]
pub struct ExchangeHashInput<'a> {
    /// Client identification line, without CR LF
    pub client_id: &'a [u8],
    /// Server identification line, without CR LF
    pub server_id: &'a [u8],
    /// Client KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// Server KEXINIT payload
    pub server_kexinit: &'a [u8],
    /// Server host key blob
    pub host_key: &'a [u8],
    /// Client ephemeral public key
    pub client_public: &'a [u8],
    /// Server ephemeral public key
    pub server_public: &'a [u8],
    /// Shared secret as a big-endian magnitude
    pub shared_secret: &'a [u8],
}

/// Computes `H = HASH(V_C || V_S || I_C || I_S || K_S || Q_C || Q_S || K)`.
pub fn exchange_hash(hash: KexHash, input: &ExchangeHashInput<'_>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_bytes(&mut buf, input.client_id);
    write_bytes(&mut buf, input.server_id);
    write_bytes(&mut buf, input.client_kexinit);
    write_bytes(&mut buf, input.server_kexinit);
    write_bytes(&mut buf, input.host_key);
    write_bytes(&mut buf, input.client_public);
    write_bytes(&mut buf, input.server_public);
    let k = encode_mpint(input.shared_secret);
    hash.digest(&[&buf[..], &k[..]])
}

/// Derives one key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || key_type || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// key = K1 || K2 || K3 || ...
/// ```
///
/// `key_type` is one of b'A'..=b'F'.
pub fn derive_key(
    hash: KexHash,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    key_type: u8,
    key_length: usize,
) -> Zeroizing<Vec<u8>> {
    let k_mpint = Zeroizing::new(encode_mpint(shared_secret));

    let mut key = Zeroizing::new(hash.digest(&[
        &k_mpint[..],
        exchange_hash,
        &[key_type],
        session_id,
    ]));
    while key.len() < key_length {
        let block = hash.digest(&[&k_mpint[..], exchange_hash, &key[..]]);
        key.extend_from_slice(&block);
    }
    key.truncate(key_length);
    key
}

/// Direction state for both halves of the connection after a key exchange.
#[derive(Debug)]
pub struct SessionKeys {
    /// Keys for packets we send
    pub outbound: DirectionKeys,
    /// Keys for packets we receive
    pub inbound: DirectionKeys,
}

/// Everything key derivation needs from a finished exchange.
#[derive(Debug, Clone, Copy)]
pub struct KeyMaterial<'a> {
    /// Kex hash function
    pub hash: KexHash,
    /// Shared secret K
    pub shared_secret: &'a [u8],
    /// Exchange hash H of this exchange
    pub exchange_hash: &'a [u8],
    /// Session identifier (H of the first exchange)
    pub session_id: &'a [u8],
}

/// One direction's derivation letters: (iv, key, mac).
const CLIENT_TO_SERVER: (u8, u8, u8) = (b'A', b'C', b'E');
const SERVER_TO_CLIENT: (u8, u8, u8) = (b'B', b'D', b'F');

fn direction_keys(
    registry: &AlgorithmRegistry,
    material: &KeyMaterial<'_>,
    letters: (u8, u8, u8),
    cipher_name: &str,
    mac_name: Option<&str>,
    compression_name: &str,
    direction: CipherDirection,
) -> SkiffResult<DirectionKeys> {
    let (iv_letter, key_letter, mac_letter) = letters;
    let derive = |letter: u8, len: usize| {
        derive_key(
            material.hash,
            material.shared_secret,
            material.exchange_hash,
            material.session_id,
            letter,
            len,
        )
    };

    let cipher_factory = registry
        .cipher(cipher_name)
        .ok_or_else(|| SkiffError::Protocol(format!("Cipher {} is not registered", cipher_name)))?;
    let iv = derive(iv_letter, cipher_factory.iv_len());
    let key = derive(key_letter, cipher_factory.key_len());
    let cipher = cipher_factory.create(direction, &key, &iv)?;

    let (mac, etm) = match mac_name {
        Some(name) => {
            let mac_factory = registry
                .mac(name)
                .ok_or_else(|| SkiffError::Protocol(format!("MAC {} is not registered", name)))?;
            let mac_key = derive(mac_letter, mac_factory.key_len());
            (Some(mac_factory.create(&mac_key)?), mac_factory.is_etm())
        }
        None => (None, false),
    };

    let compression = registry.compression(compression_name).ok_or_else(|| {
        SkiffError::Protocol(format!("Compression {} is not registered", compression_name))
    })?;

    let mut keys = DirectionKeys::new(cipher, mac, etm);
    let delayed = compression.is_delayed();
    keys = match direction {
        CipherDirection::Encrypt => match compression.compressor() {
            Some(c) => keys.with_compressor(c, delayed),
            None => keys,
        },
        CipherDirection::Decrypt => match compression.decompressor() {
            Some(d) => keys.with_decompressor(d, delayed),
            None => keys,
        },
    };
    Ok(keys)
}

/// Builds both directions' keys from a finished exchange.
///
/// The client sends with the "A/C/E" secrets and receives with "B/D/F"; the
/// server the other way round.
pub fn derive_session_keys(
    registry: &AlgorithmRegistry,
    negotiated: &Negotiated,
    material: &KeyMaterial<'_>,
    is_client: bool,
) -> SkiffResult<SessionKeys> {
    let client_to_server = |direction| {
        direction_keys(
            registry,
            material,
            CLIENT_TO_SERVER,
            &negotiated.cipher_client_to_server,
            negotiated.mac_client_to_server.as_deref(),
            &negotiated.compression_client_to_server,
            direction,
        )
    };
    let server_to_client = |direction| {
        direction_keys(
            registry,
            material,
            SERVER_TO_CLIENT,
            &negotiated.cipher_server_to_client,
            negotiated.mac_server_to_client.as_deref(),
            &negotiated.compression_server_to_client,
            direction,
        )
    };

    if is_client {
        Ok(SessionKeys {
            outbound: client_to_server(CipherDirection::Encrypt)?,
            inbound: server_to_client(CipherDirection::Decrypt)?,
        })
    } else {
        Ok(SessionKeys {
            outbound: server_to_client(CipherDirection::Encrypt)?,
            inbound: client_to_server(CipherDirection::Decrypt)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::packet::{Framing, PacketDecoder, PacketEncoder, MAX_PACKET_SIZE};
    use sha2::{Digest, Sha256};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn proposal(ciphers: &[&str], macs: &[&str]) -> KexInit {
        KexInit::new(
            names(&["curve25519-sha256"]),
            names(&["ssh-ed25519"]),
            names(ciphers),
            names(macs),
            names(&["none"]),
        )
    }

    #[test]
    fn test_kexinit_from_registry() {
        let registry = AlgorithmRegistry::with_defaults();
        let kexinit = KexInit::from_registry(&registry, registry.host_key_names());
        assert_eq!(kexinit.cookie().len(), 16);
        assert_eq!(kexinit.kex_algorithms()[0], "curve25519-sha256");
        assert_eq!(kexinit.server_host_key_algorithms(), &["ssh-ed25519"]);
        assert!(!kexinit.first_kex_packet_follows());
    }

    #[test]
    fn test_kexinit_parse() {
        let original = proposal(&["aes128-ctr"], &["hmac-sha2-256"])
            .with_first_kex_packet_follows(true);
        let parsed = KexInit::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_kexinit_parse_invalid_type() {
        let mut data = vec![99];
        data.extend_from_slice(&[0u8; 20]);
        assert!(matches!(
            KexInit::from_bytes(&data),
            Err(SkiffError::Protocol(_))
        ));
    }

    #[test]
    fn test_kexinit_parse_truncated() {
        let bytes = proposal(&["aes128-ctr"], &["hmac-sha2-256"]).to_bytes();
        assert!(KexInit::from_bytes(&bytes[..bytes.len() - 2]).is_err());
        assert!(KexInit::from_bytes(&[20, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_newkeys() {
        assert_eq!(NewKeys::new().to_bytes(), vec![21]);
        assert!(NewKeys::from_bytes(&[21]).is_ok());
        assert!(NewKeys::from_bytes(&[20]).is_err());
        assert!(NewKeys::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_negotiate_algorithm_client_order_wins() {
        let client = names(&["aes256-ctr", "aes128-ctr"]);
        let server = names(&["aes128-ctr", "aes256-ctr"]);
        assert_eq!(negotiate_algorithm(&client, &server).unwrap(), "aes256-ctr");
        assert_eq!(negotiate_algorithm(&server, &client).unwrap(), "aes128-ctr");
    }

    #[test]
    fn test_negotiate_algorithm_skips_unsupported() {
        let client = names(&["x-unknown", "aes128-ctr", "aes256-ctr"]);
        let server = names(&["aes256-ctr", "aes128-ctr"]);
        assert_eq!(negotiate_algorithm(&client, &server).unwrap(), "aes128-ctr");
    }

    #[test]
    fn test_negotiate_algorithm_no_match() {
        let result = negotiate_algorithm(&names(&["aes256-ctr"]), &names(&["aes128-ctr"]));
        match result {
            Err(SkiffError::Protocol(msg)) => assert!(msg.contains("No common algorithm")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_negotiated_aead_implies_no_mac() {
        let registry = AlgorithmRegistry::with_defaults();
        let client = proposal(&["chacha20-poly1305@openssh.com"], &["hmac-sha2-256"]);
        let server = proposal(
            &["aes128-ctr", "chacha20-poly1305@openssh.com"],
            &["hmac-sha2-512"],
        );
        let negotiated = Negotiated::negotiate(&client, &server, &registry).unwrap();
        assert_eq!(
            negotiated.cipher_client_to_server,
            "chacha20-poly1305@openssh.com"
        );
        // the MAC lists share nothing, which only matters for non-AEAD ciphers
        assert_eq!(negotiated.mac_client_to_server, None);
        assert_eq!(negotiated.mac_server_to_client, None);
    }

    #[test]
    fn test_negotiated_mac_mismatch_fails_for_plain_cipher() {
        let registry = AlgorithmRegistry::with_defaults();
        let client = proposal(&["aes128-ctr"], &["hmac-sha2-256"]);
        let server = proposal(&["aes128-ctr"], &["hmac-sha2-512"]);
        assert!(Negotiated::negotiate(&client, &server, &registry).is_err());
    }

    #[test]
    fn test_guess_is_correct() {
        let a = proposal(&["aes128-ctr"], &["hmac-sha2-256"]);
        let b = proposal(&["aes256-ctr"], &["hmac-sha2-512"]);
        assert!(guess_is_correct(&a, &b));

        let c = KexInit::new(
            names(&["curve25519-sha256@libssh.org", "curve25519-sha256"]),
            names(&["ssh-ed25519"]),
            names(&["aes128-ctr"]),
            names(&["hmac-sha2-256"]),
            names(&["none"]),
        );
        assert!(!guess_is_correct(&a, &c));
    }

    #[test]
    fn test_ecdh_messages_parse() {
        let init = KexEcdhInit {
            client_public: vec![1; 32],
        };
        assert_eq!(KexEcdhInit::from_bytes(&init.to_bytes()).unwrap(), init);

        let reply = KexEcdhReply {
            host_key: vec![2; 51],
            server_public: vec![3; 32],
            signature: vec![4; 83],
        };
        assert_eq!(KexEcdhReply::from_bytes(&reply.to_bytes()).unwrap(), reply);
        assert!(KexEcdhReply::from_bytes(&init.to_bytes()).is_err());
    }

    #[test]
    fn test_derive_key_first_block() {
        let k = [0x11u8; 32];
        let h = [0x22u8; 32];
        let session_id = [0x33u8; 32];

        let key = derive_key(KexHash::Sha256, &k, &h, &session_id, b'C', 32);

        let mut hasher = Sha256::new();
        hasher.update(encode_mpint(&k));
        hasher.update(h);
        hasher.update([b'C']);
        hasher.update(session_id);
        assert_eq!(key.as_slice(), hasher.finalize().as_slice());
    }

    #[test]
    fn test_derive_key_extension_hashes_whole_key() {
        let k = [0x11u8; 32];
        let h = [0x22u8; 32];
        let session_id = [0x33u8; 32];

        let key = derive_key(KexHash::Sha256, &k, &h, &session_id, b'C', 96);
        assert_eq!(key.len(), 96);

        let k1 = &key[..32];
        let k2 = &key[32..64];
        let expected_k2 = KexHash::Sha256.digest(&[&encode_mpint(&k)[..], &h[..], k1]);
        assert_eq!(k2, expected_k2.as_slice());
        let expected_k3 = KexHash::Sha256.digest(&[&encode_mpint(&k)[..], &h[..], k1, k2]);
        assert_eq!(&key[64..], expected_k3.as_slice());
    }

    #[test]
    fn test_derive_key_letters_differ() {
        let a = derive_key(KexHash::Sha256, &[1; 32], &[2; 32], &[3; 32], b'A', 16);
        let b = derive_key(KexHash::Sha256, &[1; 32], &[2; 32], &[3; 32], b'B', 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_exchange_hash_depends_on_every_field() {
        let base = ExchangeHashInput {
            client_id: b"SSH-2.0-a",
            server_id: b"SSH-2.0-b",
            client_kexinit: &[20, 1],
            server_kexinit: &[20, 2],
            host_key: &[5; 8],
            client_public: &[6; 32],
            server_public: &[7; 32],
            shared_secret: &[8; 32],
        };
        let h = exchange_hash(KexHash::Sha256, &base);
        assert_eq!(h.len(), 32);

        let swapped = ExchangeHashInput {
            client_id: b"SSH-2.0-b",
            server_id: b"SSH-2.0-a",
            ..base
        };
        assert_ne!(h, exchange_hash(KexHash::Sha256, &swapped));
    }

    #[test]
    fn test_session_keys_interoperate() {
        let registry = AlgorithmRegistry::with_defaults();
        for (cipher, mac, framing) in [
            ("aes128-ctr", "hmac-sha2-256", Framing::Original),
            ("aes256-cbc", "hmac-sha2-512-etm@openssh.com", Framing::EncryptThenMac),
            ("aes256-gcm@openssh.com", "hmac-sha2-256", Framing::Aead),
        ] {
            let client = proposal(&[cipher], &[mac]);
            let server = proposal(&[cipher], &[mac]);
            let negotiated = Negotiated::negotiate(&client, &server, &registry).unwrap();
            let material = KeyMaterial {
                hash: KexHash::Sha256,
                shared_secret: &[9; 32],
                exchange_hash: &[10; 32],
                session_id: &[10; 32],
            };

            let client_keys = derive_session_keys(&registry, &negotiated, &material, true).unwrap();
            let server_keys =
                derive_session_keys(&registry, &negotiated, &material, false).unwrap();
            assert_eq!(client_keys.outbound.framing(), framing);

            let mut encoder = PacketEncoder::new();
            let mut decoder = PacketDecoder::new(MAX_PACKET_SIZE);
            encoder.stage(client_keys.outbound);
            decoder.stage(server_keys.inbound);
            decoder.feed(&encoder.encode(&NewKeys::new().to_bytes()).unwrap());
            assert!(decoder.next_packet().unwrap().is_some());

            decoder.feed(&encoder.encode(b"\x5ehello").unwrap());
            let packet = decoder.next_packet().unwrap().unwrap();
            assert_eq!(packet.payload, b"\x5ehello");
        }
    }
}
