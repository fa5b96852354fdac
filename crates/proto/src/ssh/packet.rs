//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac or authentication tag
//! ```
//!
//! # Framing
//!
//! The negotiated cipher/MAC pair selects one of three framings:
//!
//! - [`Framing::Original`]: the whole packet, length included, is encrypted
//!   and the MAC covers `seq || plaintext packet`. `packet_length + 4` is
//!   aligned to the block size.
//! - [`Framing::EncryptThenMac`]: the length is sent in clear, the rest is
//!   encrypted and the MAC covers `seq || length || ciphertext`. The MAC is
//!   checked before anything is decrypted. `packet_length` is aligned.
//! - [`Framing::Aead`]: the cipher authenticates the packet itself and
//!   appends a tag. `packet_length` is aligned.
//!
//! # Security
//!
//! - **Size Validation**: `packet_length + 4` must lie in `(0, max]`
//! - **Padding Validation**: at least 4 bytes, less than `packet_length`
//! - **Random Padding**: padding comes from a CSPRNG
//! - **MAC Verification**: constant-time, before the payload is used
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::packet::{PacketDecoder, PacketEncoder, MAX_PACKET_SIZE};
//!
//! let mut encoder = PacketEncoder::new();
//! let mut decoder = PacketDecoder::new(MAX_PACKET_SIZE);
//!
//! let wire = encoder.encode(b"\x02hello").unwrap();
//! decoder.feed(&wire[..3]);
//! assert!(decoder.next_packet().unwrap().is_none());
//! decoder.feed(&wire[3..]);
//! let packet = decoder.next_packet().unwrap().unwrap();
//! assert_eq!(packet.payload, b"\x02hello");
//! assert_eq!(packet.sequence, 0);
//! ```

use super::algorithm::{CipherInstance, Compressor, Decompressor, PacketMac};
use super::message::MessageType;
use bytes::BytesMut;
use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};

/// Default maximum for `packet_length + 4` (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: usize = 255;

/// Minimum alignment of every framing.
const MIN_BLOCK_SIZE: usize = 8;

/// Packet framing selected by the negotiated cipher and MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Encrypted length, MAC over plaintext (also used before the first kex)
    Original,
    /// Clear length, MAC over ciphertext
    EncryptThenMac,
    /// Authenticated encryption with a trailing tag
    Aead,
}

/// Cipher, MAC and compression state for one direction.
///
/// The initial state has none of them. New state is installed by staging it
/// on the encoder or decoder; the swap happens atomically with the NEWKEYS
/// packet of that direction.
#[derive(Default)]
pub struct DirectionKeys {
    cipher: Option<CipherInstance>,
    mac: Option<Box<dyn PacketMac>>,
    etm: bool,
    compressor: Option<Box<dyn Compressor>>,
    decompressor: Option<Box<dyn Decompressor>>,
    delayed_compression: bool,
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("framing", &self.framing())
            .field("encrypted", &self.cipher.is_some())
            .field("mac_len", &self.mac.as_ref().map(|m| m.mac_len()))
            .field(
                "compressed",
                &(self.compressor.is_some() || self.decompressor.is_some()),
            )
            .finish()
    }
}

impl DirectionKeys {
    /// Plaintext state used before the first key exchange.
    pub fn none() -> Self {
        Self::default()
    }

    /// Builds direction state from negotiated primitives.
    pub fn new(
        cipher: CipherInstance,
        mac: Option<Box<dyn PacketMac>>,
        etm: bool,
    ) -> Self {
        let etm = etm && matches!(cipher, CipherInstance::Plain(_));
        Self {
            cipher: Some(cipher),
            mac,
            etm,
            ..Self::default()
        }
    }

    /// Adds outbound compression.
    pub fn with_compressor(mut self, compressor: Box<dyn Compressor>, delayed: bool) -> Self {
        self.compressor = Some(compressor);
        self.delayed_compression = delayed;
        self
    }

    /// Adds inbound decompression.
    pub fn with_decompressor(mut self, decompressor: Box<dyn Decompressor>, delayed: bool) -> Self {
        self.decompressor = Some(decompressor);
        self.delayed_compression = delayed;
        self
    }

    /// The framing these keys produce.
    pub fn framing(&self) -> Framing {
        match (&self.cipher, self.etm) {
            (Some(CipherInstance::Aead(_)), _) => Framing::Aead,
            (Some(CipherInstance::Plain(_)), true) => Framing::EncryptThenMac,
            _ => Framing::Original,
        }
    }

    fn block_size(&self) -> usize {
        let cipher_block = match &self.cipher {
            Some(CipherInstance::Plain(c)) => c.block_size(),
            Some(CipherInstance::Aead(c)) => c.block_size(),
            None => 0,
        };
        cipher_block.max(MIN_BLOCK_SIZE)
    }

    fn trailer_len(&self) -> usize {
        match &self.cipher {
            Some(CipherInstance::Aead(c)) => c.tag_len(),
            _ => self.mac.as_ref().map_or(0, |m| m.mac_len()),
        }
    }

    fn compression_active(&self, delayed_enabled: bool) -> bool {
        !self.delayed_compression || delayed_enabled
    }
}

/// Per-direction counters since the keys in use were installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketCounters {
    /// Packets processed
    pub packets: u64,
    /// Wire bytes processed, MAC included
    pub bytes: u64,
}

/// Outbound half of the codec.
#[derive(Debug)]
pub struct PacketEncoder {
    keys: DirectionKeys,
    staged: Option<DirectionKeys>,
    sequence: u32,
    delayed_compression_enabled: bool,
    counters: PacketCounters,
}

impl Default for PacketEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketEncoder {
    /// Creates an encoder with no cipher, MAC or compression.
    pub fn new() -> Self {
        Self {
            keys: DirectionKeys::none(),
            staged: None,
            sequence: 0,
            delayed_compression_enabled: false,
            counters: PacketCounters::default(),
        }
    }

    /// Stages keys to take effect right after the next NEWKEYS is encoded.
    pub fn stage(&mut self, keys: DirectionKeys) {
        self.staged = Some(keys);
    }

    /// Returns true while keys are staged and NEWKEYS has not been sent.
    pub fn has_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Overrides the sequence number (used by tests to exercise wrap-around).
    pub fn set_sequence(&mut self, sequence: u32) {
        self.sequence = sequence;
    }

    /// Current framing.
    pub fn framing(&self) -> Framing {
        self.keys.framing()
    }

    /// Counters since the current keys were installed.
    pub fn counters(&self) -> PacketCounters {
        self.counters
    }

    /// Starts compressing if the negotiated method is delayed.
    pub fn enable_delayed_compression(&mut self) {
        self.delayed_compression_enabled = true;
    }

    /// Frames, compresses, encrypts and authenticates one payload.
    pub fn encode(&mut self, payload: &[u8]) -> SkiffResult<Vec<u8>> {
        if payload.is_empty() {
            return Err(SkiffError::Protocol("Cannot encode empty payload".to_string()));
        }
        let is_newkeys = payload[0] == MessageType::NewKeys as u8;

        let compress = self
            .keys
            .compression_active(self.delayed_compression_enabled);
        let compressed;
        let payload = match &mut self.keys.compressor {
            Some(compressor) if compress => {
                compressed = compressor.compress(payload)?;
                compressed.as_slice()
            }
            _ => payload,
        };

        let framing = self.keys.framing();
        let block_size = self.keys.block_size();
        let aad_len = if framing == Framing::Original { 0 } else { 4 };

        let unpadded = 4 + 1 + payload.len();
        let mut padding_len = block_size - ((unpadded - aad_len) % block_size);
        if padding_len < MIN_PADDING_LEN {
            padding_len += block_size;
        }
        let packet_length = 1 + payload.len() + padding_len;
        let packet_length = u32::try_from(packet_length).map_err(|_| {
            SkiffError::Protocol(format!("Payload of {} bytes is too large", payload.len()))
        })?;

        let mut buf = Vec::with_capacity(4 + packet_length as usize + self.keys.trailer_len());
        buf.extend_from_slice(&packet_length.to_be_bytes());
        buf.push(padding_len as u8);
        buf.extend_from_slice(payload);
        let start = buf.len();
        buf.resize(start + padding_len, 0);
        rand::thread_rng().fill_bytes(&mut buf[start..]);

        let sequence = self.sequence;
        match (&mut self.keys.cipher, framing) {
            (Some(CipherInstance::Aead(cipher)), _) => {
                cipher.seal(sequence, &mut buf)?;
            }
            (cipher, Framing::EncryptThenMac) => {
                if let Some(CipherInstance::Plain(cipher)) = cipher {
                    cipher.apply(&mut buf[4..])?;
                }
                if let Some(mac) = &self.keys.mac {
                    let tag = mac.compute(sequence, &buf);
                    buf.extend_from_slice(&tag);
                }
            }
            (cipher, _) => {
                let tag = self.keys.mac.as_ref().map(|mac| mac.compute(sequence, &buf));
                if let Some(CipherInstance::Plain(cipher)) = cipher {
                    cipher.apply(&mut buf)?;
                }
                if let Some(tag) = tag {
                    buf.extend_from_slice(&tag);
                }
            }
        }

        self.sequence = self.sequence.wrapping_add(1);
        self.counters.packets += 1;
        self.counters.bytes += buf.len() as u64;

        if is_newkeys {
            if let Some(keys) = self.staged.take() {
                self.keys = keys;
                self.counters = PacketCounters::default();
            }
        }

        Ok(buf)
    }
}

/// A decoded inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// Sequence number the packet was received under
    pub sequence: u32,
    /// Decompressed payload, message number first
    pub payload: Vec<u8>,
}

impl InboundPacket {
    /// The message number.
    pub fn message_type(&self) -> u8 {
        self.payload[0]
    }
}

#[derive(Debug)]
enum DecodePhase {
    /// Waiting for enough bytes to learn the packet length
    Length,
    /// Length known; waiting for the rest of the packet and its trailer
    Body {
        packet_length: usize,
        /// First cipher block already decrypted (Original framing only)
        first_block: Option<Vec<u8>>,
    },
}

/// Inbound half of the codec: a two-phase decoder that accepts bytes in
/// arbitrary fragments.
#[derive(Debug)]
pub struct PacketDecoder {
    keys: DirectionKeys,
    staged: Option<DirectionKeys>,
    sequence: u32,
    max_packet_length: usize,
    buffer: BytesMut,
    phase: DecodePhase,
    delayed_compression_enabled: bool,
    counters: PacketCounters,
}

impl PacketDecoder {
    /// Creates a decoder accepting packets up to `max_packet_length` bytes
    /// (`packet_length + 4`).
    pub fn new(max_packet_length: usize) -> Self {
        Self {
            keys: DirectionKeys::none(),
            staged: None,
            sequence: 0,
            max_packet_length,
            buffer: BytesMut::new(),
            phase: DecodePhase::Length,
            delayed_compression_enabled: false,
            counters: PacketCounters::default(),
        }
    }

    /// Stages keys to take effect right after the next NEWKEYS is decoded.
    pub fn stage(&mut self, keys: DirectionKeys) {
        self.staged = Some(keys);
    }

    /// Sequence number the next packet is expected to carry.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Overrides the sequence number (used by tests to exercise wrap-around).
    pub fn set_sequence(&mut self, sequence: u32) {
        self.sequence = sequence;
    }

    /// Current framing.
    pub fn framing(&self) -> Framing {
        self.keys.framing()
    }

    /// Counters since the current keys were installed.
    pub fn counters(&self) -> PacketCounters {
        self.counters
    }

    /// Starts decompressing if the negotiated method is delayed.
    pub fn enable_delayed_compression(&mut self) {
        self.delayed_compression_enabled = true;
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Appends received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Decodes the next complete packet, if one is buffered.
    ///
    /// Any error is fatal for the connection: the stream cannot be
    /// resynchronised after a bad length or a failed MAC.
    pub fn next_packet(&mut self) -> SkiffResult<Option<InboundPacket>> {
        if let DecodePhase::Length = self.phase {
            match self.read_length()? {
                Some(phase) => self.phase = phase,
                None => return Ok(None),
            }
        }

        let DecodePhase::Body {
            packet_length,
            first_block,
        } = &mut self.phase
        else {
            return Ok(None);
        };
        let packet_length = *packet_length;
        let trailer_len = self.keys.trailer_len();
        let total = 4 + packet_length + trailer_len;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let first_block = first_block.take();
        self.phase = DecodePhase::Length;

        let mut packet = self.buffer.split_to(total).to_vec();
        let sequence = self.sequence;
        let framing = self.keys.framing();

        match (&mut self.keys.cipher, framing) {
            (Some(CipherInstance::Aead(cipher)), _) => {
                cipher.open(sequence, &mut packet)?;
                packet.truncate(4 + packet_length);
            }
            (cipher, Framing::EncryptThenMac) => {
                let received = packet.split_off(4 + packet_length);
                if let Some(mac) = &self.keys.mac {
                    mac.verify(sequence, &packet, &received)?;
                }
                if let Some(CipherInstance::Plain(cipher)) = cipher {
                    cipher.apply(&mut packet[4..])?;
                }
            }
            (cipher, _) => {
                let received = packet.split_off(4 + packet_length);
                if let Some(CipherInstance::Plain(cipher)) = cipher {
                    let decrypted = first_block.unwrap_or_default();
                    let done = decrypted.len();
                    packet[..done].copy_from_slice(&decrypted);
                    cipher.apply(&mut packet[done..])?;
                }
                if let Some(mac) = &self.keys.mac {
                    mac.verify(sequence, &packet, &received)?;
                }
            }
        }

        let padding_len = usize::from(packet[4]);
        if padding_len < MIN_PADDING_LEN || padding_len >= packet_length {
            return Err(SkiffError::Protocol(format!(
                "Invalid padding length {} for packet length {}",
                padding_len, packet_length
            )));
        }
        let payload_len = packet_length - 1 - padding_len;
        if payload_len == 0 {
            return Err(SkiffError::Protocol("Packet has empty payload".to_string()));
        }
        let mut payload = packet[5..5 + payload_len].to_vec();

        let decompress = self
            .keys
            .compression_active(self.delayed_compression_enabled);
        if let Some(decompressor) = &mut self.keys.decompressor {
            if decompress {
                payload = decompressor.decompress(&payload)?;
                if payload.is_empty() {
                    return Err(SkiffError::Protocol(
                        "Decompressed payload is empty".to_string(),
                    ));
                }
            }
        }

        self.sequence = self.sequence.wrapping_add(1);
        self.counters.packets += 1;
        self.counters.bytes += total as u64;

        if payload[0] == MessageType::NewKeys as u8 {
            let keys = self.staged.take().ok_or_else(|| {
                SkiffError::Protocol("NEWKEYS received before key exchange completed".to_string())
            })?;
            self.keys = keys;
            self.counters = PacketCounters::default();
        }

        Ok(Some(InboundPacket { sequence, payload }))
    }

    /// Phase one: recover and validate `packet_length`.
    fn read_length(&mut self) -> SkiffResult<Option<DecodePhase>> {
        let framing = self.keys.framing();
        let block_size = self.keys.block_size();
        let sequence = self.sequence;

        let (packet_length, first_block) = match (&mut self.keys.cipher, framing) {
            (Some(CipherInstance::Plain(cipher)), Framing::Original) => {
                let first_len = cipher.block_size().max(4);
                if self.buffer.len() < first_len {
                    return Ok(None);
                }
                let mut block = self.buffer[..first_len].to_vec();
                cipher.apply(&mut block)?;
                let length = u32::from_be_bytes([block[0], block[1], block[2], block[3]]) as usize;
                (length, Some(block))
            }
            (Some(CipherInstance::Aead(cipher)), _) => {
                if self.buffer.len() < 4 {
                    return Ok(None);
                }
                let wire = [self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]];
                (u32::from_be_bytes(cipher.decrypt_length(sequence, wire)) as usize, None)
            }
            _ => {
                if self.buffer.len() < 4 {
                    return Ok(None);
                }
                let wire = [self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]];
                (u32::from_be_bytes(wire) as usize, None)
            }
        };

        if packet_length == 0 || packet_length + 4 > self.max_packet_length {
            return Err(SkiffError::Protocol(format!(
                "Invalid packet length {} (maximum {})",
                packet_length,
                self.max_packet_length.saturating_sub(4)
            )));
        }
        if packet_length < 1 + MIN_PADDING_LEN {
            return Err(SkiffError::Protocol(format!(
                "Packet length {} too small",
                packet_length
            )));
        }
        let aligned = match framing {
            Framing::Original => 4 + packet_length,
            _ => packet_length,
        };
        if aligned % block_size != 0 {
            return Err(SkiffError::Protocol(format!(
                "Packet length {} not aligned to block size {}",
                packet_length, block_size
            )));
        }
        if let Some(block) = &first_block {
            if block.len() > 4 + packet_length {
                return Err(SkiffError::Protocol(format!(
                    "Packet length {} shorter than cipher block",
                    packet_length
                )));
            }
        }

        Ok(Some(DecodePhase::Body {
            packet_length,
            first_block,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::algorithm::{CipherDirection, CipherFactory, MacFactory};
    use crate::ssh::crypto::{CipherAlgorithm, CompressionAlgorithm, MacAlgorithm};
    use crate::ssh::algorithm::CompressionFactory;

    fn keys(cipher: CipherAlgorithm, mac: Option<MacAlgorithm>, direction: CipherDirection) -> DirectionKeys {
        let instance = cipher.create(direction, &[0x5a; 64], &[0x33; 16]).unwrap();
        let mac_key = mac.map(|m| m.create(&[0x77; 64]).unwrap());
        DirectionKeys::new(instance, mac_key, mac.map_or(false, |m| m.is_etm()))
    }

    fn pair(cipher: CipherAlgorithm, mac: Option<MacAlgorithm>) -> (PacketEncoder, PacketDecoder) {
        let mut encoder = PacketEncoder::new();
        let mut decoder = PacketDecoder::new(MAX_PACKET_SIZE);
        encoder.stage(keys(cipher, mac, CipherDirection::Encrypt));
        decoder.stage(keys(cipher, mac, CipherDirection::Decrypt));

        let newkeys = encoder.encode(&[MessageType::NewKeys as u8]).unwrap();
        decoder.feed(&newkeys);
        assert_eq!(decoder.next_packet().unwrap().unwrap().payload, vec![21]);
        (encoder, decoder)
    }

    fn exchange(encoder: &mut PacketEncoder, decoder: &mut PacketDecoder, payload: &[u8]) {
        let wire = encoder.encode(payload).unwrap();
        // Deliver one byte at a time to exercise both decode phases.
        for byte in &wire[..wire.len() - 1] {
            decoder.feed(std::slice::from_ref(byte));
            assert!(decoder.next_packet().unwrap().is_none());
        }
        decoder.feed(&wire[wire.len() - 1..]);
        let packet = decoder.next_packet().unwrap().unwrap();
        assert_eq!(packet.payload, payload);
    }

    #[test]
    fn test_plaintext_alignment_and_padding() {
        let mut encoder = PacketEncoder::new();
        for len in 1..40 {
            let payload = vec![94u8; len];
            let wire = encoder.encode(&payload).unwrap();
            assert_eq!(wire.len() % 8, 0);
            let padding = usize::from(wire[4]);
            assert!(padding >= MIN_PADDING_LEN);
            assert_eq!(
                u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize,
                wire.len() - 4
            );
        }
    }

    #[test]
    fn test_original_framing_ctr_hmac() {
        let (mut enc, mut dec) = pair(CipherAlgorithm::Aes128Ctr, Some(MacAlgorithm::HmacSha256));
        assert_eq!(enc.framing(), Framing::Original);
        exchange(&mut enc, &mut dec, b"\x5eoriginal framing");
        exchange(&mut enc, &mut dec, &[94u8; 300]);
    }

    #[test]
    fn test_original_mac_covers_sequence_and_plaintext() {
        let (mut enc, _dec) = pair(CipherAlgorithm::Aes128Ctr, Some(MacAlgorithm::HmacSha256));
        let sequence = enc.sequence();
        let wire = enc.encode(b"\x5emac input").unwrap();
        let (body, tag) = wire.split_at(wire.len() - 32);

        let mut plain = body.to_vec();
        match CipherAlgorithm::Aes128Ctr
            .create(CipherDirection::Decrypt, &[0x5a; 64], &[0x33; 16])
            .unwrap()
        {
            CipherInstance::Plain(mut cipher) => cipher.apply(&mut plain).unwrap(),
            CipherInstance::Aead(_) => panic!("ctr is not an AEAD cipher"),
        }
        assert_eq!(&plain[5..15], b"\x5emac input");

        let mac = MacAlgorithm::HmacSha256.create(&[0x77; 64]).unwrap();
        assert_eq!(mac.compute(sequence, &plain), tag);
        assert_ne!(mac.compute(sequence, body), tag);
    }

    #[test]
    fn test_original_framing_cbc_hmac_sha1() {
        let (mut enc, mut dec) = pair(CipherAlgorithm::Aes256Cbc, Some(MacAlgorithm::HmacSha1));
        exchange(&mut enc, &mut dec, b"\x5ecbc keeps its chain");
        exchange(&mut enc, &mut dec, b"\x5esecond packet");
    }

    #[test]
    fn test_etm_framing() {
        let (mut enc, mut dec) =
            pair(CipherAlgorithm::Aes256Ctr, Some(MacAlgorithm::HmacSha512Etm));
        assert_eq!(enc.framing(), Framing::EncryptThenMac);
        let wire = enc.encode(b"\x5eetm").unwrap();
        let length = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        assert_eq!(length % 16, 0);
        assert_eq!(wire.len(), 4 + length + 64);
        dec.feed(&wire);
        assert_eq!(dec.next_packet().unwrap().unwrap().payload, b"\x5eetm");
        exchange(&mut enc, &mut dec, &[94u8; 1000]);
    }

    #[test]
    fn test_aead_framing() {
        for cipher in [CipherAlgorithm::ChaCha20Poly1305, CipherAlgorithm::Aes256Gcm] {
            let (mut enc, mut dec) = pair(cipher, None);
            assert_eq!(enc.framing(), Framing::Aead);
            exchange(&mut enc, &mut dec, b"\x5eaead framing");
            exchange(&mut enc, &mut dec, &[94u8; 2048]);
        }
    }

    #[test]
    fn test_aead_ignores_mac() {
        let keys = keys(
            CipherAlgorithm::Aes128Gcm,
            Some(MacAlgorithm::HmacSha256Etm),
            CipherDirection::Encrypt,
        );
        assert_eq!(keys.framing(), Framing::Aead);
    }

    #[test]
    fn test_sequence_wraps_with_mac() {
        let (mut enc, mut dec) = pair(CipherAlgorithm::Aes128Ctr, Some(MacAlgorithm::HmacSha256));
        enc.set_sequence(u32::MAX);
        dec.set_sequence(u32::MAX);
        exchange(&mut enc, &mut dec, b"\x5elast");
        assert_eq!(enc.sequence(), 0);
        assert_eq!(dec.sequence(), 0);
        exchange(&mut enc, &mut dec, b"\x5efirst again");
    }

    #[test]
    fn test_sequence_wraps_with_chacha() {
        let (mut enc, mut dec) = pair(CipherAlgorithm::ChaCha20Poly1305, None);
        enc.set_sequence(u32::MAX);
        dec.set_sequence(u32::MAX);
        exchange(&mut enc, &mut dec, b"\x5elast");
        exchange(&mut enc, &mut dec, b"\x5ewrapped");
        assert_eq!(dec.sequence(), 1);
    }

    #[test]
    fn test_tampered_mac_is_security_error() {
        let (mut enc, mut dec) = pair(CipherAlgorithm::Aes128Ctr, Some(MacAlgorithm::HmacSha256));
        let mut wire = enc.encode(b"\x5etamper").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 1;
        dec.feed(&wire);
        assert!(matches!(dec.next_packet(), Err(SkiffError::Security(_))));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut dec = PacketDecoder::new(1024);
        dec.feed(&[0, 0, 0x10, 0, 4]);
        assert!(matches!(dec.next_packet(), Err(SkiffError::Protocol(_))));
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut dec = PacketDecoder::new(MAX_PACKET_SIZE);
        dec.feed(&[0, 0, 0, 0]);
        assert!(matches!(dec.next_packet(), Err(SkiffError::Protocol(_))));
    }

    #[test]
    fn test_bad_padding_rejected() {
        let mut dec = PacketDecoder::new(MAX_PACKET_SIZE);
        // packet_length 12, padding 2
        dec.feed(&[0, 0, 0, 12, 2, 94, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(dec.next_packet(), Err(SkiffError::Protocol(_))));
    }

    #[test]
    fn test_newkeys_without_staged_keys() {
        let mut enc = PacketEncoder::new();
        let mut dec = PacketDecoder::new(MAX_PACKET_SIZE);
        dec.feed(&enc.encode(&[21]).unwrap());
        assert!(matches!(dec.next_packet(), Err(SkiffError::Protocol(_))));
    }

    #[test]
    fn test_multiple_packets_in_one_read() {
        let (mut enc, mut dec) = pair(CipherAlgorithm::Aes128Gcm, None);
        let mut wire = enc.encode(b"\x5eone").unwrap();
        wire.extend(enc.encode(b"\x5etwo").unwrap());
        dec.feed(&wire);
        assert_eq!(dec.next_packet().unwrap().unwrap().payload, b"\x5eone");
        assert_eq!(dec.next_packet().unwrap().unwrap().payload, b"\x5etwo");
        assert!(dec.next_packet().unwrap().is_none());
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn test_delayed_compression() {
        let alg = CompressionAlgorithm::ZlibOpenssh;
        let mut enc = PacketEncoder::new();
        let mut dec = PacketDecoder::new(MAX_PACKET_SIZE);
        enc.stage(
            keys(CipherAlgorithm::Aes128Ctr, Some(MacAlgorithm::HmacSha256), CipherDirection::Encrypt)
                .with_compressor(alg.compressor().unwrap(), true),
        );
        dec.stage(
            keys(CipherAlgorithm::Aes128Ctr, Some(MacAlgorithm::HmacSha256), CipherDirection::Decrypt)
                .with_decompressor(alg.decompressor().unwrap(), true),
        );
        dec.feed(&enc.encode(&[21]).unwrap());
        dec.next_packet().unwrap();

        let payload = vec![94u8; 4000];
        let before = enc.encode(&payload).unwrap();
        dec.feed(&before);
        assert_eq!(dec.next_packet().unwrap().unwrap().payload, payload);

        enc.enable_delayed_compression();
        dec.enable_delayed_compression();
        let after = enc.encode(&payload).unwrap();
        assert!(after.len() < before.len());
        dec.feed(&after);
        assert_eq!(dec.next_packet().unwrap().unwrap().payload, payload);
    }

    #[test]
    fn test_counters_reset_on_newkeys() {
        let mut enc = PacketEncoder::new();
        enc.encode(b"\x14kexinit").unwrap();
        assert_eq!(enc.counters().packets, 1);
        enc.stage(keys(CipherAlgorithm::Aes128Ctr, Some(MacAlgorithm::HmacSha256), CipherDirection::Encrypt));
        enc.encode(&[21]).unwrap();
        assert_eq!(enc.counters(), PacketCounters::default());
        assert!(!enc.has_staged());
    }
}
