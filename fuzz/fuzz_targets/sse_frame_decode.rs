#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_ai::SseFrameDecoder;

fuzz_target!(|data: &[u8]| {
    let mut whole = SseFrameDecoder::new();
    let mut whole_frames = whole.push_chunk(data);
    if let Some(frame) = whole.finish() {
        whole_frames.push(frame);
    }

    // Replay the same bytes with chunk boundaries derived from the input;
    // frame cuts must not depend on where the reads happened to land.
    let step = data.first().copied().map(usize::from).unwrap_or(1).max(1);
    let mut split = SseFrameDecoder::new();
    let mut split_frames = Vec::new();
    for chunk in data.chunks(step) {
        split_frames.extend(split.push_chunk(chunk));
    }
    if let Some(frame) = split.finish() {
        split_frames.push(frame);
    }

    assert_eq!(whole_frames, split_frames);
});
