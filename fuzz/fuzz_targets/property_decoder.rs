#![no_main]

use libfuzzer_sys::fuzz_target;
use krabtrace::decoder;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let tag = u16::from_le_bytes([data[0], data[1]]);
    let _ = decoder::decode_raw(tag, "fuzz", &data[2..]);
});
