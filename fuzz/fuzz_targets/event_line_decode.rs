#![no_main]

use hookline_core::advice::{enforce_actionability, has_next_step_command, quick_advice};
use hookline_core::event::{decode_line, encode_line};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must decode to an event or a typed error, never panic.
    if let Ok(event) = decode_line(data) {
        let line = encode_line(&event).expect("decoded event re-encodes");
        let again = decode_line(&line).expect("encoded line decodes");
        assert_eq!(again.event_id, event.event_id);
        assert_eq!(again.ts_ms, event.ts_ms);

        // Whatever the payload, advice built from it stays actionable.
        let tool = event.tool_name.as_deref().unwrap_or("unknown");
        let item = quick_advice(tool, &event.payload);
        let enforced = enforce_actionability(&item, tool, data.first().is_some_and(|b| b & 1 == 1));
        assert!(has_next_step_command(&enforced.text));
    }
});
