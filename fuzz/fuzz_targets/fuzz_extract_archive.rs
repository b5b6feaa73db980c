#![no_main]

use libfuzzer_sys::fuzz_target;
use verifi::archive::{decode_text, extract_json_object, extract_payload};

fuzz_target!(|data: &[u8]| {
    // Archive bytes come straight off the network. Extraction must never
    // panic, and any object it returns must be a slice of the decoded text
    // that starts and ends with braces.
    let text = decode_text(data);
    if let Some(obj) = extract_json_object(&text) {
        assert!(obj.starts_with('{') && obj.ends_with('}'));
    }
    let _ = extract_payload(data);
});
