#![no_main]

use libfuzzer_sys::fuzz_target;
use m2m_client::core::bencode::CachingDecoder;
use m2m_client::registry;

fuzz_target!(|data: &[u8]| {
    // Packet parsing must never panic, cached or not
    let plain = registry().from_wire(data);
    let decoder = CachingDecoder::default();
    let cached = registry().from_wire_cached(data, &decoder);
    assert_eq!(plain.is_ok(), cached.is_ok());
    if let Ok(packet) = plain {
        let _ = packet.to_wire();
        let _ = format!("{packet:?}");
    }
});
