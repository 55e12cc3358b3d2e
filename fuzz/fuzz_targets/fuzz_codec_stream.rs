#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use mesh_gateway::core::codec::HdlcCodec;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Fuzz the serial stream splitter - test for panics and unbounded buffering
    let mut codec = HdlcCodec::with_max_frame_size(256);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
    assert!(buf.len() <= 256);
    let _ = codec.decode_eof(&mut buf);
});
