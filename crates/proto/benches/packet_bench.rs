//! SSH packet layer benchmarks.
//!
//! Measures encode plus decode throughput for each framing.
//!
//! Run with: `cargo bench --bench packet_bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use skiff_proto::ssh::algorithm::{CipherDirection, CipherFactory, MacFactory};
use skiff_proto::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use skiff_proto::ssh::message::MessageType;
use skiff_proto::ssh::packet::{DirectionKeys, PacketDecoder, PacketEncoder, MAX_PACKET_SIZE};

const PAYLOAD_SIZES: [usize; 3] = [64, 1024, 32 * 1024];

fn keys(cipher: CipherAlgorithm, mac: Option<MacAlgorithm>, direction: CipherDirection) -> DirectionKeys {
    let instance = cipher
        .create(direction, &[0x5a; 64], &[0x33; 16])
        .expect("cipher keys");
    let mac_key = mac.map(|m| m.create(&[0x77; 64]).expect("mac key"));
    DirectionKeys::new(instance, mac_key, mac.map_or(false, |m| m.is_etm()))
}

/// Encoder and decoder past their NEWKEYS, sharing the same keys.
fn keyed_pair(cipher: CipherAlgorithm, mac: Option<MacAlgorithm>) -> (PacketEncoder, PacketDecoder) {
    let mut encoder = PacketEncoder::new();
    let mut decoder = PacketDecoder::new(MAX_PACKET_SIZE);
    encoder.stage(keys(cipher, mac, CipherDirection::Encrypt));
    decoder.stage(keys(cipher, mac, CipherDirection::Decrypt));

    let newkeys = encoder
        .encode(&[MessageType::NewKeys as u8])
        .expect("encode NEWKEYS");
    decoder.feed(&newkeys);
    decoder.next_packet().expect("decode NEWKEYS");
    (encoder, decoder)
}

fn bench_framing(c: &mut Criterion, name: &str, cipher: CipherAlgorithm, mac: Option<MacAlgorithm>) {
    let mut group = c.benchmark_group(name);
    for size in PAYLOAD_SIZES {
        let payload = vec![94u8; size];
        let (mut encoder, mut decoder) = keyed_pair(cipher, mac);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                let wire = encoder.encode(black_box(payload)).expect("encode");
                decoder.feed(&wire);
                black_box(decoder.next_packet().expect("decode"))
            })
        });
    }
    group.finish();
}

fn bench_chacha20_poly1305(c: &mut Criterion) {
    bench_framing(c, "aead_chacha20_poly1305", CipherAlgorithm::ChaCha20Poly1305, None);
}

fn bench_aes_gcm(c: &mut Criterion) {
    bench_framing(c, "aead_aes256_gcm", CipherAlgorithm::Aes256Gcm, None);
}

fn bench_ctr_etm(c: &mut Criterion) {
    bench_framing(
        c,
        "etm_aes128_ctr_hmac_sha256",
        CipherAlgorithm::Aes128Ctr,
        Some(MacAlgorithm::HmacSha256Etm),
    );
}

fn bench_ctr_original(c: &mut Criterion) {
    bench_framing(
        c,
        "original_aes128_ctr_hmac_sha256",
        CipherAlgorithm::Aes128Ctr,
        Some(MacAlgorithm::HmacSha256),
    );
}

criterion_group!(
    benches,
    bench_chacha20_poly1305,
    bench_aes_gcm,
    bench_ctr_etm,
    bench_ctr_original
);
criterion_main!(benches);
