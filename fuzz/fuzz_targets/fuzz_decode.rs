#![no_main]

use libfuzzer_sys::fuzz_target;
use m2m_client::core::bencode::{decode, encode};

fuzz_target!(|data: &[u8]| {
    // Anything that decodes must re-encode to the same canonical bytes
    if let Ok(value) = decode(data) {
        if let Ok(encoded) = encode(&value) {
            let _ = decode(&encoded).map(|again| assert_eq!(again, value));
        }
    }
});
