//! Fuzz target for detach-key parsing and matching.
//!
//! Without a detach, forwarded bytes plus whatever is flushed at the end
//! must reproduce the input exactly.

#![no_main]

use agentbox::session::detach::{DetachKeys, DetachMatcher};
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    notation: String,
    chunks: Vec<Vec<u8>>,
}

fuzz_target!(|input: Input| {
    let Some(keys) = DetachKeys::parse(&input.notation) else {
        return;
    };
    let mut matcher = DetachMatcher::new(&keys);
    let mut forwarded = Vec::new();
    let mut fed = Vec::new();

    for chunk in &input.chunks {
        let scan = matcher.feed(chunk);
        forwarded.extend_from_slice(&scan.forward);
        if scan.detach {
            return;
        }
        fed.extend_from_slice(chunk);
    }
    forwarded.extend(matcher.flush());
    assert_eq!(forwarded, fed);
});
