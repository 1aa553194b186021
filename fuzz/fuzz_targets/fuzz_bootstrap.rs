#![no_main]

//! Bootstrap YAML parsing must never panic on malformed input.

use authgate::config::file::BootstrapFile;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(bootstrap) = BootstrapFile::from_yaml(text) {
            let _ = bootstrap.upstream.base_url();
            let _ = bootstrap.upstream.timeout();
        }
    }
});
