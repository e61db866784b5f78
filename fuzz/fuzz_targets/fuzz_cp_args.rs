//! Fuzz target for `cp` argument planning.

#![no_main]

use agentbox::copy::{plan_transfer, Transfer};
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Args {
    src: String,
    dst: String,
    agent: Option<String>,
}

fuzz_target!(|args: Args| {
    match plan_transfer(&args.src, &args.dst, args.agent.as_deref()) {
        Ok(Transfer::FromContainer { container, .. } | Transfer::ToContainer { container, .. }) => {
            assert!(!container.is_empty() || args.agent.as_deref() == Some(""));
        }
        Err(_) => {}
    }
});
