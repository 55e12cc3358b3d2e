#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_gateway::core::frame;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must never panic the deframer
    let _ = frame::decode(data);

    // Anything we encode must decode back unchanged
    let encoded = frame::encode(data);
    assert_eq!(frame::decode(&encoded).ok().as_deref(), Some(data));
});
