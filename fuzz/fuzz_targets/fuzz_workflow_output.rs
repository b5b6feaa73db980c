#![no_main]

use libfuzzer_sys::fuzz_target;
use verifi::workflow::parse_workflow_output;

fuzz_target!(|data: &[u8]| {
    // Workflow stdout is free-form text from an external tool. The scrape
    // fallback walks every brace, so it must stay panic-free on any input
    // and never report an empty statistics list as a result.
    let text = String::from_utf8_lossy(data);
    if let Some(stats) = parse_workflow_output(&text) {
        assert!(!stats.is_empty());
    }
});
