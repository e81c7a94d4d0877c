#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_ai::{ChatStreamDecoder, StreamAssembler};

fuzz_target!(|data: &[u8]| {
    let mut whole_decoder = ChatStreamDecoder::new();
    let mut whole_assembler = StreamAssembler::new();
    let mut relayed = String::new();
    for frame in whole_decoder.push_chunk(data) {
        if let Some(delta) = whole_assembler.apply_frame(&frame) {
            relayed.push_str(&delta);
        }
    }
    for frame in whole_decoder.finish() {
        if let Some(delta) = whole_assembler.apply_frame(&frame) {
            relayed.push_str(&delta);
        }
    }
    let whole = whole_assembler.finish();
    assert_eq!(relayed, whole.content);

    let step = data.last().copied().map(usize::from).unwrap_or(1).max(1);
    let mut split_decoder = ChatStreamDecoder::new();
    let mut split_assembler = StreamAssembler::new();
    for chunk in data.chunks(step) {
        for frame in split_decoder.push_chunk(chunk) {
            split_assembler.apply_frame(&frame);
        }
    }
    for frame in split_decoder.finish() {
        split_assembler.apply_frame(&frame);
    }
    let split = split_assembler.finish();

    assert_eq!(whole, split);
    for call in &whole.tool_calls {
        assert!(!call.name.trim().is_empty());
    }
});
