//! One writer, many readers, and no deleting files that are open

use anyhow::Result;
use slabfs::{Config, FileAccess, OpenMode, SlabError, Volume};
use std::io::{Read, Seek, SeekFrom, Write};

fn volume() -> Result<Volume> {
    let mut volume = Volume::in_memory(Config::with_geometry(256, 0))?;
    volume.write_all_text("/shared/file", "0123456789")?;
    Ok(volume)
}

#[test]
fn test_second_writer_rejected() -> Result<()> {
    let mut volume = volume()?;
    let writer = volume.open_handle("/shared/file", OpenMode::Open, FileAccess::ReadWrite, None)?;
    let err = volume
        .open_handle("/shared/file", OpenMode::Open, FileAccess::ReadWrite, None)
        .unwrap_err();
    assert!(matches!(err, SlabError::FileWriteAccessTaken(_)));

    let reader = volume.open_handle("/shared/file", OpenMode::Open, FileAccess::Read, None)?;
    volume.close_handle(writer)?;

    let second = volume.open_handle("/shared/file", OpenMode::Open, FileAccess::ReadWrite, None)?;
    volume.close_handle(second)?;
    volume.close_handle(reader)?;
    Ok(())
}

#[test]
fn test_readers_share_content() -> Result<()> {
    let mut volume = volume()?;
    let a = volume.open_handle("/shared/file", OpenMode::Open, FileAccess::Read, None)?;
    let b = volume.open_handle("/shared/file", OpenMode::Open, FileAccess::Read, None)?;

    let mut first = [0u8; 4];
    assert_eq!(volume.read(a, &mut first)?, 4);
    volume.seek(b, SeekFrom::End(-3))?;
    let mut second = [0u8; 8];
    assert_eq!(volume.read(b, &mut second)?, 3);
    assert_eq!(&first, b"0123");
    assert_eq!(&second[..3], b"789");

    assert!(matches!(volume.write(a, b"x"), Err(SlabError::NoWriteAccess)));
    volume.close_handle(a)?;
    volume.close_handle(b)?;
    assert!(matches!(
        volume.close_handle(b),
        Err(SlabError::InvalidHandle(_))
    ));
    Ok(())
}

#[test]
fn test_open_file_blocks_delete() -> Result<()> {
    let mut volume = volume()?;
    let reader = volume.open_handle("/shared/file", OpenMode::Open, FileAccess::Read, None)?;

    assert!(matches!(
        volume.delete("/shared/file"),
        Err(SlabError::UnableToDeleteFile(_))
    ));
    assert!(matches!(
        volume.delete("/shared"),
        Err(SlabError::UnableToDeleteFile(_))
    ));
    assert!(volume.exists("/shared/file")?);

    volume.close_handle(reader)?;
    assert!(volume.delete("/shared")?);
    assert!(!volume.exists("/shared")?);
    Ok(())
}

#[test]
fn test_pending_writes_block_readers() -> Result<()> {
    let mut volume = volume()?;
    let writer = volume.open_handle("/shared/file", OpenMode::Open, FileAccess::ReadWrite, None)?;
    volume.write(writer, b"abc")?;

    let reader = volume.open_handle("/shared/file", OpenMode::Open, FileAccess::Read, None)?;
    let mut buf = [0u8; 4];
    assert!(matches!(
        volume.read(reader, &mut buf),
        Err(SlabError::ReadWhileContentChanged(_))
    ));

    volume.close_handle(writer)?;
    assert_eq!(volume.read(reader, &mut buf)?, 4);
    assert_eq!(&buf, b"abc3");
    volume.close_handle(reader)?;
    Ok(())
}

#[test]
fn test_scoped_file_releases_on_drop() -> Result<()> {
    let mut volume = volume()?;
    {
        let mut file = volume.open_file("/shared/file", OpenMode::Append, FileAccess::ReadWrite)?;
        file.write_all(b"!")?;
        file.seek(SeekFrom::Start(0))?;
        assert_eq!(file.len()?, 11);
    }
    assert_eq!(volume.stats()?.open_handles, 0);

    let mut file = volume.open_file("/shared/file", OpenMode::Open, FileAccess::ReadWrite)?;
    file.write_all(b"?")?;
    let mut text = String::new();
    assert!(file.read_to_string(&mut text).is_err());
    file.commit()?;
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut text)?;
    assert_eq!(text, "?123456789!");
    Ok(())
}
