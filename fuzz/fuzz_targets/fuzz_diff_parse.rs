//! Fuzz target for the changeset diff parser.
//!
//! Feeds arbitrary bytes through `ChangesetReader` and drains it to the
//! end. Malformed XML must be skipped or reported, never panic.

#![no_main]

use changeset_sync::diff::ChangesetReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut reader = ChangesetReader::new(data);
    let mut yielded = 0u64;
    loop {
        match reader.next_event() {
            Ok(Some(_)) => yielded += 1,
            Ok(None) => break,
            Err(_) => break,
        }
    }
    // The reader's own tally must agree with what it handed out
    assert_eq!(reader.yielded(), yielded);
});
