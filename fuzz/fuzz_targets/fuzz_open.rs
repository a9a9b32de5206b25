#![no_main]
use libfuzzer_sys::fuzz_target;
use slabfs::{Config, PathKind, Volume};
use std::io::Cursor;

// Arbitrary bytes must be rejected with an error, never a panic
fuzz_target!(|input: &[u8]| {
    let Ok(mut volume) = Volume::from_storage(Box::new(Cursor::new(input.to_vec())), Config::default())
    else {
        return;
    };
    if let Ok(files) = volume.list_files("/", PathKind::Absolute, true) {
        for path in files.iter().take(16) {
            let _ = volume.read_all_bytes(path);
        }
    }
    let _ = volume.stats();
});
