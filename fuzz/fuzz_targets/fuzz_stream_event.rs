#![no_main]

use libfuzzer_sys::fuzz_target;
use waggle_gate_client::decoder;
use waggle_gate_client::sse::SseFrameDecoder;

fuzz_target!(|data: &[u8]| {
    // Raw bytes through the event-stream framer, split at an arbitrary point
    // so partial lines and partial UTF-8 sequences are exercised.
    let split = data.first().map_or(0, |b| usize::from(*b)).min(data.len());
    let (head, tail) = data.split_at(split);
    let mut framer = SseFrameDecoder::new();
    let mut frames = framer.push_bytes(head);
    frames.extend(framer.push_bytes(tail));
    frames.extend(framer.finish());

    for frame in &frames {
        let _ = decoder::decode(frame);
    }

    // Decode the input directly as one event as well.
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = decoder::decode(s);
    }
});
