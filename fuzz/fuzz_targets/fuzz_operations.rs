#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use slabfs::{Config, Volume};
use std::collections::HashMap;

#[derive(Debug, Arbitrary)]
enum Op {
    Write { file: u8, data: Vec<u8> },
    Append { file: u8, data: Vec<u8> },
    Delete { file: u8 },
    Move { from: u8, to: u8 },
    Begin,
    Commit,
    Rollback,
}

// keeps 64 appends under the largest file a 512-byte volume holds
const MAX_CHUNK: usize = 2048;

fn path(index: u8) -> String {
    format!("/d{}/f{}", index % 3, index % 16)
}

// Committed content must always read back as the model says
fuzz_target!(|ops: Vec<Op>| {
    let Ok(mut volume) = Volume::in_memory(Config::with_geometry(512, 0)) else {
        return;
    };
    let mut committed: HashMap<String, Vec<u8>> = HashMap::new();
    let mut pending: Option<HashMap<String, Vec<u8>>> = None;

    for op in ops.into_iter().take(64) {
        let model = pending.as_mut().unwrap_or(&mut committed);
        match op {
            Op::Write { file, mut data } => {
                data.truncate(MAX_CHUNK);
                if volume.write_all_bytes(&path(file), &data).is_ok() {
                    model.insert(path(file), data);
                }
            }
            Op::Append { file, mut data } => {
                data.truncate(MAX_CHUNK);
                if volume.append_all_bytes(&path(file), &data).is_ok() {
                    model.entry(path(file)).or_default().extend_from_slice(&data);
                }
            }
            Op::Delete { file } => {
                if volume.delete(&path(file)).unwrap_or(false) {
                    model.remove(&path(file));
                }
            }
            Op::Move { from, to } => {
                if volume.move_entry(&path(from), &path(to), false).unwrap_or(false) {
                    if let Some(data) = model.remove(&path(from)) {
                        model.insert(path(to), data);
                    }
                }
            }
            Op::Begin => {
                if volume.begin_transaction(None).is_ok() {
                    pending = Some(committed.clone());
                }
            }
            Op::Commit => {
                if let Some(model) = pending.take() {
                    volume.end_transaction().unwrap();
                    committed = model;
                }
            }
            Op::Rollback => {
                if pending.take().is_some() {
                    volume.rollback().unwrap();
                }
            }
        }
    }

    if pending.is_some() {
        volume.rollback().unwrap();
    }
    for (path, data) in &committed {
        assert_eq!(&volume.read_all_bytes(path).unwrap(), data, "{} differs", path);
    }
});
