#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use m2m_client::core::codec::PacketCodec;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Feed the stream in small chunks; the framer must not panic or loop
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::new();
    for chunk in data.chunks(7) {
        buf.extend_from_slice(chunk);
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
});
