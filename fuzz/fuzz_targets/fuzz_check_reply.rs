#![no_main]

//! Arbitrary bytes as a JSON-RPC check reply must decode or fail cleanly.

use authgate::check::rpc_client::decode_reply;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = decode_reply(data, "1");
});
