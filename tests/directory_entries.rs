//! Directory entry tables: slot reuse, persistence and cache trimming

use anyhow::Result;
use slabfs::core::fsman::ROOT_INODE;
use slabfs::{ChildKind, Config, FsMan, SlabError, Volume};
use std::io::Cursor;

fn reopen(fs: &mut FsMan) -> Result<FsMan> {
    let mut image = Vec::new();
    fs.backup(&mut image)?;
    Ok(FsMan::open(Box::new(Cursor::new(image)), Config::default())?)
}

#[test]
fn test_freed_slot_is_reused_for_same_bucket() -> Result<()> {
    let mut volume = Volume::in_memory(Config::with_geometry(512, 0))?;
    let fs = volume.fs_mut();
    let root = fs.root();

    fs.with_transaction(None, |fs, tx| {
        for i in 0..10 {
            fs.create_file(tx, root, &format!("file{:02}", i), 1)?;
        }
        Ok(())
    })?;
    let slots = fs.directory(root)?.slot_count();
    let table_length = fs.inode(ROOT_INODE)?.length;

    assert!(fs.with_transaction(None, |fs, tx| fs.delete_file(tx, root, "file03"))?);
    assert_eq!(fs.directory(root)?.free_slot_count(), 1);

    // six bytes, same bucket as "file03"
    fs.with_transaction(None, |fs, tx| fs.create_file(tx, root, "other6", 1))?;
    assert_eq!(fs.directory(root)?.slot_count(), slots);
    assert_eq!(fs.directory(root)?.free_slot_count(), 0);
    assert_eq!(fs.inode(ROOT_INODE)?.length, table_length);
    Ok(())
}

#[test]
fn test_longer_name_does_not_take_small_slot() -> Result<()> {
    let mut volume = Volume::in_memory(Config::with_geometry(512, 0))?;
    let fs = volume.fs_mut();
    let root = fs.root();

    fs.with_transaction(None, |fs, tx| {
        fs.create_file(tx, root, "ab", 1)?;
        fs.create_file(tx, root, "cd", 1)?;
        fs.delete_file(tx, root, "ab")
    })?;
    let slots = fs.directory(root)?.slot_count();

    let long = "n".repeat(100);
    fs.with_transaction(None, |fs, tx| fs.create_file(tx, root, &long, 1))?;
    assert_eq!(fs.directory(root)?.slot_count(), slots + 1);
    assert_eq!(fs.directory(root)?.free_slot_count(), 1);

    // a shorter name fits the freed slot
    fs.with_transaction(None, |fs, tx| fs.create_file(tx, root, "e", 1))?;
    assert_eq!(fs.directory(root)?.slot_count(), slots + 1);
    assert_eq!(fs.directory(root)?.free_slot_count(), 0);
    Ok(())
}

#[test]
fn test_free_slots_survive_reopen() -> Result<()> {
    let mut volume = Volume::in_memory(Config::with_geometry(256, 0))?;
    volume.write_all_text("/d/a", "a")?;
    volume.write_all_text("/d/b", "b")?;
    volume.create_directory("/d/sub")?;
    volume.delete("/d/a")?;

    let mut fs = reopen(volume.fs_mut())?;
    let root = fs.root();
    let d = fs.get_directory(root, "d")?;
    let directory = fs.directory(d)?;
    assert_eq!(directory.slot_count(), 3);
    assert_eq!(directory.free_slot_count(), 1);
    assert_eq!(directory.file_names(), vec!["b"]);
    assert_eq!(directory.directory_names(), vec!["sub"]);
    assert_eq!(fs.has_child(d, "sub")?, Some(ChildKind::Directory));
    Ok(())
}

#[test]
fn test_long_names_round_trip() -> Result<()> {
    let mut volume = Volume::in_memory(Config::with_geometry(128, 0))?;
    let names: Vec<String> = [1usize, 31, 64, 65, 200, 248]
        .iter()
        .map(|len| "x".repeat(*len))
        .collect();
    for name in &names {
        volume.write_all_text(&format!("/{}", name), name)?;
    }
    assert!(matches!(
        volume.write_all_text(&format!("/{}", "y".repeat(249)), "too long"),
        Err(SlabError::InvalidName(_))
    ));

    let mut fs = reopen(volume.fs_mut())?;
    let root = fs.root();
    for name in &names {
        assert!(fs.has_file(root, name)?, "lost {} byte name", name.len());
    }
    Ok(())
}

#[test]
fn test_directory_cache_is_trimmed() -> Result<()> {
    let config = Config {
        max_cached_directories: 10,
        ..Config::with_geometry(256, 0)
    };
    let mut volume = Volume::in_memory(config)?;
    for i in 0..30 {
        volume.write_all_text(&format!("/top{}/mid/leaf{}.txt", i, i), "x")?;
    }
    let stats = volume.stats()?;
    assert!(
        stats.loaded_directories <= 12,
        "{} directories still loaded",
        stats.loaded_directories
    );

    for i in 0..30 {
        assert_eq!(
            volume.read_to_string(&format!("/top{}/mid/leaf{}.txt", i, i))?,
            "x"
        );
    }
    Ok(())
}
