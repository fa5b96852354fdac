//! Fuzz target for the SSH packet decoder and connection message parser.
//!
//! Looks for panics and unbounded allocation when decoding hostile input.
//!
//! Run with:
//! ```bash
//! cd crates/proto/fuzz
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use skiff_proto::ssh::connection::ConnectionMessage;
use skiff_proto::ssh::packet::{PacketDecoder, MAX_PACKET_SIZE};

fuzz_target!(|data: &[u8]| {
    let mut decoder = PacketDecoder::new(MAX_PACKET_SIZE);
    // Split the input to exercise partial reads.
    let split = data.len() / 2;
    decoder.feed(&data[..split]);
    let _ = decoder.next_packet();
    decoder.feed(&data[split..]);
    while let Ok(Some(packet)) = decoder.next_packet() {
        let _ = ConnectionMessage::parse(&packet.payload);
    }

    let _ = ConnectionMessage::parse(data);
});
