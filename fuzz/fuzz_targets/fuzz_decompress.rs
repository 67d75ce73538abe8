//! Fuzz target for payload decompression.
//!
//! This tests that `decompress_payload` never panics on arbitrary input,
//! including truncated gzip/zstd frames and garbage behind valid magic bytes.

#![no_main]

use changeset_sync::diff::decompress_payload;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Corrupt frames must surface as Err, never as a panic
    let _ = decompress_payload(data);
});
