#![no_main]

use libfuzzer_sys::fuzz_target;
use krabtrace::filter::Predicate;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Parsing never panics; a parsed predicate always prints
        if let Ok(predicate) = Predicate::from_expr(input) {
            let _ = predicate.to_string();
        }
    }
});
