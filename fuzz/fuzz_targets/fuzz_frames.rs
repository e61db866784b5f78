//! Fuzz target for the attach stream framing.
//!
//! Arbitrary bytes must decode without panicking, and every decoded frame
//! must re-encode to exactly the bytes it was read from.

#![no_main]

use agentbox::engine::frame::{encode_frame, FrameCodec};
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let mut codec = FrameCodec;
    let mut buf = BytesMut::from(data);
    let mut consumed = 0;

    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        let encoded = encode_frame(frame.stream, &frame.payload);
        assert_eq!(&data[consumed..consumed + encoded.len()], &encoded[..]);
        consumed += encoded.len();
    }
    assert!(consumed <= data.len());
});
