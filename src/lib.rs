//! # slabfs - a filesystem in a single file
//!
//! `slabfs` stores a whole directory tree inside one container: a host file,
//! or any other random-access byte store. Space is handed out in block groups
//! with bitmap allocators, files are a few extents that grow and compact
//! themselves, and every change runs under a transaction that can be rolled
//! back from before-images.
//!
//! - **Transactional** metadata and content: nothing reaches the store before commit
//! - **Self-defragmenting** files that keep to a fixed number of extents
//! - **Bounded memory**: block groups and directories are loaded on demand
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use slabfs::{Config, Result, Volume};
//!
//! # fn main() -> Result<()> {
//! let mut volume = Volume::open_or_create("data.slab", Config::default())?;
//!
//! // Parent directories are created as needed
//! volume.write_all_bytes("/documents/report.txt", b"Hello, World!")?;
//! let content = volume.read_all_bytes("/documents/report.txt")?;
//!
//! let files = volume.list_files("/documents", slabfs::PathKind::Relative, false)?;
//! volume.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Transactions
//!
//! ```rust,no_run
//! use slabfs::{Config, Result, Volume};
//!
//! # fn main() -> Result<()> {
//! let mut volume = Volume::in_memory(Config::with_geometry(512, 0))?;
//! volume.begin_transaction(Some("import"))?;
//! volume.create_directory("/incoming")?;
//! volume.write_all_text("/incoming/a.txt", "first")?;
//! volume.rollback()?;
//! assert!(!volume.exists("/incoming")?);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod path;

pub use crate::core::{
    config::Config,
    directory::{ChildKind, DirId, FileInfo},
    error::{Result, SlabError},
    fsman::{FsMan, VolumeStats},
    header::Header,
    io::Storage,
    stream::{FileAccess, HandleId, OpenMode},
    transaction::{TransactionId, TransactionMode},
};

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// How listed paths are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Relative to the listed directory, e.g. `notes/a.txt`
    Relative,
    /// From the volume root, e.g. `/docs/notes/a.txt`
    Absolute,
}

/// Summary of one directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryInfo {
    /// Absolute path, `/` for the root
    pub path: String,
    /// Last path segment, empty for the root
    pub name: String,
    pub file_count: usize,
    pub directory_count: usize,
}

/// A mounted volume addressed by paths
///
/// Mutations run under the transaction started with
/// [`Volume::begin_transaction`] when there is one, otherwise each call
/// commits on its own.
///
/// # Examples
///
/// ```rust,no_run
/// use slabfs::{Config, Volume};
///
/// # fn main() -> slabfs::Result<()> {
/// let mut volume = Volume::in_memory(Config::default())?;
/// volume.write_all_bytes("/a/b/file.bin", &[1, 2, 3])?;
/// assert!(volume.exists("/a/b")?);
/// volume.delete("/a/b")?;
/// # Ok(())
/// # }
/// ```
pub struct Volume {
    inner: FsMan,
    current: Option<TransactionId>,
}

impl Volume {
    /// Create a volume in a new host file; fails if the file exists
    pub fn create<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        info!("Creating volume at {:?}", path.as_ref());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        Ok(Self::wrap(FsMan::create(Box::new(file), config)?))
    }

    /// Open an existing volume file. Geometry comes from its header.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        info!("Opening volume at {:?}", path.as_ref());
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        Ok(Self::wrap(FsMan::open(Box::new(file), config)?))
    }

    /// Open the volume file, creating it and its host directories if missing
    pub fn open_or_create<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::open(path, config);
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::create(path, config)
    }

    /// A fresh volume held in memory
    pub fn in_memory(config: Config) -> Result<Self> {
        Ok(Self::wrap(FsMan::create(
            Box::new(Cursor::new(Vec::new())),
            config,
        )?))
    }

    /// Mount a volume on any storage: empty storage is formatted, anything
    /// else is opened
    pub fn from_storage(mut storage: Box<dyn Storage>, config: Config) -> Result<Self> {
        let fs = if storage.byte_len()? == 0 {
            FsMan::create(storage, config)?
        } else {
            FsMan::open(storage, config)?
        };
        Ok(Self::wrap(fs))
    }

    fn wrap(inner: FsMan) -> Self {
        Volume {
            inner,
            current: None,
        }
    }

    /// The engine underneath, for directory-handle level access
    pub fn fs(&self) -> &FsMan {
        &self.inner
    }

    pub fn fs_mut(&mut self) -> &mut FsMan {
        &mut self.inner
    }

    pub fn header(&self) -> &Header {
        self.inner.header()
    }

    pub fn stats(&mut self) -> Result<VolumeStats> {
        self.inner.stats()
    }

    /// Push staged writes to the backing store
    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    /// Copy the committed container into `writer`
    pub fn backup<W: Write>(&mut self, writer: &mut W) -> Result<u64> {
        self.inner.backup(writer)
    }

    /// Flush and release the volume. An open transaction is rolled back and
    /// reported as [`SlabError::UnsavedChanges`].
    pub fn close(self) -> Result<()> {
        self.inner.close()
    }

    // Transactions

    /// Start the volume-wide transaction used by every following call
    pub fn begin_transaction(&mut self, name: Option<&str>) -> Result<TransactionId> {
        if let Some(id) = self.current {
            return Err(SlabError::InvalidArgument(format!(
                "transaction {} is still open",
                id
            )));
        }
        let id = self.inner.begin_transaction(TransactionMode::Manual, name);
        self.current = Some(id);
        Ok(id)
    }

    pub fn transaction(&self) -> Option<TransactionId> {
        self.current
    }

    /// Commit and keep the transaction open for more work
    pub fn commit(&mut self) -> Result<()> {
        let id = self.current.ok_or(SlabError::MissingTransaction)?;
        self.inner.commit(id)
    }

    /// Commit and finish the transaction
    pub fn end_transaction(&mut self) -> Result<()> {
        let id = self.current.ok_or(SlabError::MissingTransaction)?;
        self.inner.end_transaction(id)?;
        self.current = None;
        Ok(())
    }

    /// Undo everything since the last commit and finish the transaction
    pub fn rollback(&mut self) -> Result<()> {
        let id = self.current.take().ok_or(SlabError::MissingTransaction)?;
        let outcome = self.inner.rollback(id);
        self.inner.trim_directories();
        outcome
    }

    /// Run `work` against the engine, then trim the directory cache
    fn run<T, F>(&mut self, work: F) -> Result<T>
    where
        F: FnOnce(&mut FsMan, Option<TransactionId>) -> Result<T>,
    {
        let outcome = work(&mut self.inner, self.current);
        self.inner.trim_directories();
        outcome
    }

    // Namespace

    /// True when `path` names a file or a directory
    pub fn exists(&mut self, path: &str) -> Result<bool> {
        Ok(self.exists_as(path)?.is_some())
    }

    /// Kind of whatever `path` names
    pub fn exists_as(&mut self, path: &str) -> Result<Option<ChildKind>> {
        let parts = path::segments(path)?;
        self.run(|fs, _| {
            let Some((name, parent)) = parts.split_last() else {
                return Ok(Some(ChildKind::Directory));
            };
            match try_resolve(fs, parent)? {
                Some(dir) => fs.has_child(dir, name),
                None => Ok(None),
            }
        })
    }

    /// Create a directory and any missing parents
    pub fn create_directory(&mut self, path: &str) -> Result<DirectoryInfo> {
        let parts = path::segments(path)?;
        self.run(|fs, tx| {
            let dir = fs.with_transaction(tx, |fs, tx| resolve_or_create(fs, tx, &parts))?;
            directory_info(fs, dir)
        })
    }

    /// Delete a file or a whole directory tree; `false` if nothing was there
    pub fn delete(&mut self, path: &str) -> Result<bool> {
        let (parent, name) = path::split_parent(path)?;
        self.run(|fs, tx| {
            let Some(dir) = try_resolve(fs, &parent)? else {
                return Ok(false);
            };
            fs.with_transaction(tx, |fs, tx| fs.delete_child(tx, dir, &name))
        })
    }

    /// Move or rename a file or directory. The target's parent must exist.
    /// Returns `false` when the source is missing, or the target exists and
    /// `overwrite` is off.
    pub fn move_entry(&mut self, from: &str, to: &str, overwrite: bool) -> Result<bool> {
        let (from_parent, from_name) = path::split_parent(from)?;
        let (to_parent, to_name) = path::split_parent(to)?;
        self.run(|fs, tx| {
            let Some(source) = try_resolve(fs, &from_parent)? else {
                return Ok(false);
            };
            let target = resolve(fs, &to_parent)?;
            fs.with_transaction(tx, |fs, tx| {
                fs.move_child(tx, source, &from_name, target, &to_name, overwrite)
            })
        })
    }

    /// Copy a file, or a directory with everything below it. Missing target
    /// parents are created.
    pub fn copy(&mut self, from: &str, to: &str, overwrite: bool) -> Result<()> {
        let from_parts = path::segments(from)?;
        let (to_parent, to_name) = path::split_parent(to)?;
        let to_parts = path::segments(to)?;
        self.run(|fs, tx| {
            let (source_name, source_parent) = from_parts
                .split_last()
                .ok_or_else(|| SlabError::InvalidArgument("cannot copy the root".into()))?;
            let source_dir = resolve(fs, source_parent)?;
            let kind = fs
                .has_child(source_dir, source_name)?
                .ok_or_else(|| SlabError::NotFound(path::from_segments(&from_parts)))?;
            let into_source = kind == ChildKind::Directory && path::is_within(&to_parts, &from_parts);
            // overwriting an ancestor of the source would delete it first
            if into_source || path::is_within(&from_parts, &to_parts) {
                return Err(SlabError::MoveIntoSubtree(path::from_segments(&to_parts)));
            }

            fs.with_transaction(tx, |fs, tx| {
                let target_dir = resolve_or_create(fs, tx, &to_parent)?;
                if fs.has_child(target_dir, &to_name)?.is_some() {
                    if !overwrite {
                        return Err(SlabError::AlreadyExists(path::from_segments(&to_parts)));
                    }
                    fs.delete_child(tx, target_dir, &to_name)?;
                }

                match kind {
                    ChildKind::File => {
                        copy_file(fs, tx, source_dir, source_name, target_dir, &to_name)
                    }
                    ChildKind::Directory => {
                        let source = fs.get_directory(source_dir, source_name)?;
                        let copied = fs.list_children(source, None, true)?;
                        let root = fs.create_directory(tx, target_dir, &to_name)?;
                        for (relative, child) in copied {
                            let mut parts = path::segments(&relative)?;
                            let Some(name) = parts.pop() else { continue };
                            let from_dir = resolve_from(fs, source, &parts)?;
                            let to_dir = resolve_from(fs, root, &parts)?;
                            match child {
                                ChildKind::Directory => {
                                    fs.create_directory(tx, to_dir, &name)?;
                                }
                                ChildKind::File => {
                                    copy_file(fs, tx, from_dir, &name, to_dir, &name)?;
                                }
                            }
                        }
                        Ok(())
                    }
                }
            })?;
            debug!(
                "Copied {} to {}",
                path::from_segments(&from_parts),
                path::from_segments(&to_parts)
            );
            Ok(())
        })
    }

    /// Remove everything inside a directory
    pub fn clear_directory(&mut self, path: &str) -> Result<()> {
        let parts = path::segments(path)?;
        self.run(|fs, tx| {
            let dir = resolve(fs, &parts)?;
            fs.with_transaction(tx, |fs, tx| fs.clear_directory(tx, dir))
        })
    }

    // Files

    /// Open a file as a scoped [`File`] that closes when dropped
    pub fn open_file(
        &mut self,
        path: &str,
        mode: OpenMode,
        access: FileAccess,
    ) -> Result<File<'_>> {
        let handle = self.open_handle(path, mode, access, None)?;
        Ok(File {
            volume: self,
            handle: Some(handle),
        })
    }

    /// Open a raw handle; pair with [`Volume::close_handle`]
    pub fn open_handle(
        &mut self,
        path: &str,
        mode: OpenMode,
        access: FileAccess,
        size_hint: Option<u64>,
    ) -> Result<HandleId> {
        let (parent, name) = path::split_parent(path)?;
        self.run(|fs, tx| {
            let dir = resolve(fs, &parent)?;
            fs.open_file(tx, dir, &name, mode, access, size_hint)
        })
    }

    pub fn read(&mut self, handle: HandleId, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(handle, buf)
    }

    pub fn write(&mut self, handle: HandleId, data: &[u8]) -> Result<usize> {
        self.inner.write(handle, data)
    }

    pub fn seek(&mut self, handle: HandleId, target: SeekFrom) -> Result<u64> {
        self.inner.seek(handle, target)
    }

    pub fn close_handle(&mut self, handle: HandleId) -> Result<()> {
        self.run(|fs, _| fs.close_handle(handle))
    }

    pub fn read_all_bytes(&mut self, path: &str) -> Result<Vec<u8>> {
        let (parent, name) = path::split_parent(path)?;
        self.run(|fs, _| {
            let dir = resolve(fs, &parent)?;
            read_file(fs, dir, &name)
        })
    }

    pub fn read_to_string(&mut self, path: &str) -> Result<String> {
        let bytes = self.read_all_bytes(path)?;
        String::from_utf8(bytes)
            .map_err(|_| SlabError::InvalidArgument(format!("{} is not valid UTF-8", path)))
    }

    /// Replace the content of a file, creating it and its parents if needed
    pub fn write_all_bytes(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.put(path, data, OpenMode::Create)
    }

    pub fn write_all_text(&mut self, path: &str, text: &str) -> Result<()> {
        self.put(path, text.as_bytes(), OpenMode::Create)
    }

    /// Append to a file, creating it and its parents if needed
    pub fn append_all_bytes(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.put(path, data, OpenMode::Append)
    }

    fn put(&mut self, path: &str, data: &[u8], mode: OpenMode) -> Result<()> {
        let (parent, name) = path::split_parent(path)?;
        self.run(|fs, tx| {
            fs.with_transaction(tx, |fs, tx| {
                let dir = resolve_or_create(fs, tx, &parent)?;
                let mode = match mode {
                    OpenMode::Append if !fs.has_file(dir, &name)? => OpenMode::CreateNew,
                    mode => mode,
                };
                let hint = Some(data.len() as u64);
                let handle = fs.open_file(Some(tx), dir, &name, mode, FileAccess::ReadWrite, hint)?;
                let written = fs.write(handle, data);
                let closed = fs.close_handle(handle);
                written?;
                closed
            })
        })
    }

    pub fn file_info(&mut self, path: &str) -> Result<FileInfo> {
        let (parent, name) = path::split_parent(path)?;
        self.run(|fs, _| {
            let dir = resolve(fs, &parent)?;
            fs.file_info(dir, &name)
        })
    }

    pub fn directory_info(&mut self, path: &str) -> Result<DirectoryInfo> {
        let parts = path::segments(path)?;
        self.run(|fs, _| {
            let dir = resolve(fs, &parts)?;
            directory_info(fs, dir)
        })
    }

    pub fn read_attributes(&mut self, path: &str) -> Result<Vec<u8>> {
        Ok(self.file_info(path)?.attributes)
    }

    pub fn write_attributes(&mut self, path: &str, attributes: &[u8]) -> Result<()> {
        let (parent, name) = path::split_parent(path)?;
        self.run(|fs, tx| {
            let dir = resolve(fs, &parent)?;
            fs.with_transaction(tx, |fs, tx| {
                let handle =
                    fs.open_file(Some(tx), dir, &name, OpenMode::Open, FileAccess::ReadWrite, None)?;
                let written = fs.write_attributes(handle, attributes);
                let closed = fs.close_handle(handle);
                written?;
                closed
            })
        })
    }

    // Listing

    pub fn list_files(&mut self, path: &str, kind: PathKind, recursive: bool) -> Result<Vec<String>> {
        self.list(path, ChildKind::File, kind, recursive)
    }

    pub fn list_directories(
        &mut self,
        path: &str,
        kind: PathKind,
        recursive: bool,
    ) -> Result<Vec<String>> {
        self.list(path, ChildKind::Directory, kind, recursive)
    }

    fn list(
        &mut self,
        path: &str,
        child: ChildKind,
        kind: PathKind,
        recursive: bool,
    ) -> Result<Vec<String>> {
        let parts = path::segments(path)?;
        let base = path::from_segments(&parts);
        self.run(|fs, _| {
            let dir = resolve(fs, &parts)?;
            let listed = fs.list_children(dir, Some(child), recursive)?;
            Ok(listed
                .into_iter()
                .map(|(relative, _)| match kind {
                    PathKind::Relative => relative,
                    PathKind::Absolute => path::join(&base, &relative),
                })
                .collect())
        })
    }
}

/// Walk `parts` down from the root, loading directories on the way
fn resolve(fs: &mut FsMan, parts: &[String]) -> Result<DirId> {
    let root = fs.root();
    resolve_from(fs, root, parts)
}

fn resolve_from(fs: &mut FsMan, start: DirId, parts: &[String]) -> Result<DirId> {
    let mut dir = start;
    for part in parts {
        dir = fs.get_directory(dir, part)?;
    }
    fs.set_active_directory(dir);
    Ok(dir)
}

fn try_resolve(fs: &mut FsMan, parts: &[String]) -> Result<Option<DirId>> {
    let mut dir = fs.root();
    for part in parts {
        match fs.try_get_directory(dir, part)? {
            Some(next) => dir = next,
            None => return Ok(None),
        }
    }
    fs.set_active_directory(dir);
    Ok(Some(dir))
}

fn resolve_or_create(fs: &mut FsMan, tx: TransactionId, parts: &[String]) -> Result<DirId> {
    let mut dir = fs.root();
    for part in parts {
        dir = fs.get_or_create_directory(tx, dir, part)?;
    }
    fs.set_active_directory(dir);
    Ok(dir)
}

fn directory_info(fs: &FsMan, dir: DirId) -> Result<DirectoryInfo> {
    let directory = fs.directory(dir)?;
    Ok(DirectoryInfo {
        path: fs.directory_path(dir)?,
        name: directory.name().to_string(),
        file_count: directory.file_count(),
        directory_count: directory.directory_count(),
    })
}

fn read_file(fs: &mut FsMan, dir: DirId, name: &str) -> Result<Vec<u8>> {
    let handle = fs.open_file(None, dir, name, OpenMode::Open, FileAccess::Read, None)?;
    let content = fs.length(handle).and_then(|length| {
        let mut content = vec![0u8; length as usize];
        let mut filled = 0;
        while filled < content.len() {
            match fs.read(handle, &mut content[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        content.truncate(filled);
        Ok(content)
    });
    let closed = fs.close_handle(handle);
    let content = content?;
    closed?;
    Ok(content)
}

fn copy_file(
    fs: &mut FsMan,
    tx: TransactionId,
    from: DirId,
    name: &str,
    to: DirId,
    to_name: &str,
) -> Result<()> {
    let content = read_file(fs, from, name)?;
    let attributes = fs.file_info(from, name)?.attributes;
    let hint = Some(content.len() as u64);
    let handle = fs.open_file(Some(tx), to, to_name, OpenMode::CreateNew, FileAccess::ReadWrite, hint)?;
    let written = fs
        .write(handle, &content)
        .and_then(|_| fs.write_attributes(handle, &attributes));
    let closed = fs.close_handle(handle);
    written?;
    closed
}

/// An open file borrowed from its [`Volume`]
///
/// Implements [`Read`], [`Write`] and [`Seek`]. Writes are buffered in the
/// volume's transaction, or in a private one that commits when the file is
/// closed or dropped.
pub struct File<'a> {
    volume: &'a mut Volume,
    handle: Option<HandleId>,
}

impl File<'_> {
    fn handle(&self) -> Result<HandleId> {
        self.handle.ok_or(SlabError::InvalidHandle(0))
    }

    pub fn id(&self) -> Option<HandleId> {
        self.handle
    }

    pub fn len(&mut self) -> Result<u64> {
        let handle = self.handle()?;
        self.volume.inner.length(handle)
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn position(&self) -> Result<u64> {
        self.volume.inner.position(self.handle()?)
    }

    pub fn set_len(&mut self, length: u64) -> Result<()> {
        let handle = self.handle()?;
        self.volume.inner.set_length(handle, length)
    }

    pub fn read_attributes(&mut self) -> Result<Vec<u8>> {
        let handle = self.handle()?;
        self.volume.inner.read_attributes(handle)
    }

    pub fn write_attributes(&mut self, attributes: &[u8]) -> Result<()> {
        let handle = self.handle()?;
        self.volume.inner.write_attributes(handle, attributes)
    }

    /// Commit buffered writes unless the volume transaction owns them
    pub fn commit(&mut self) -> Result<()> {
        let handle = self.handle()?;
        self.volume.inner.flush_handle(handle)
    }

    /// Close, reporting a failed commit
    pub fn close(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.volume.close_handle(handle),
            None => Ok(()),
        }
    }
}

impl Read for File<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let handle = self.handle()?;
        Ok(self.volume.inner.read(handle, buf)?)
    }
}

impl Write for File<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let handle = self.handle()?;
        Ok(self.volume.inner.write(handle, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.commit()?)
    }
}

impl Seek for File<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let handle = self.handle()?;
        Ok(self.volume.inner.seek(handle, pos)?)
    }
}

impl Drop for File<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.volume.close_handle(handle) {
                warn!("Closing file handle {} failed: {}", handle.get(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume() -> Volume {
        Volume::in_memory(Config::with_geometry(512, 4)).unwrap()
    }

    #[test]
    fn test_write_and_read_back() {
        let mut volume = volume();
        volume.write_all_text("/docs/readme.txt", "hello").unwrap();
        assert_eq!(volume.read_to_string("/docs/readme.txt").unwrap(), "hello");
        assert_eq!(
            volume.exists_as("/docs").unwrap(),
            Some(ChildKind::Directory)
        );
        assert_eq!(volume.exists_as("/").unwrap(), Some(ChildKind::Directory));
        assert!(!volume.exists("/nope/deeper").unwrap());
    }

    #[test]
    fn test_append() {
        let mut volume = volume();
        volume.append_all_bytes("/log", b"a").unwrap();
        volume.append_all_bytes("/log", b"bc").unwrap();
        assert_eq!(volume.read_all_bytes("/log").unwrap(), b"abc");
        volume.write_all_bytes("/log", b"z").unwrap();
        assert_eq!(volume.read_all_bytes("/log").unwrap(), b"z");
    }

    #[test]
    fn test_scoped_file_io() {
        let mut volume = volume();
        {
            let mut file = volume
                .open_file("/f.bin", OpenMode::Create, FileAccess::ReadWrite)
                .unwrap();
            file.write_all(&[5u8; 2000]).unwrap();
            file.seek(SeekFrom::Start(10)).unwrap();
            file.write_all(b"xyz").unwrap();
            file.write_attributes(&[1, 2]).unwrap();
        }
        let mut file = volume
            .open_file("/f.bin", OpenMode::Open, FileAccess::Read)
            .unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content.len(), 2000);
        assert_eq!(&content[9..14], &[5, b'x', b'y', b'z', 5]);
        assert_eq!(file.read_attributes().unwrap(), vec![1, 2, 0, 0]);
        file.close().unwrap();
        assert_eq!(volume.stats().unwrap().open_handles, 0);
    }

    #[test]
    fn test_volume_transaction_rollback() {
        let mut volume = volume();
        volume.write_all_text("/keep.txt", "kept").unwrap();
        volume.begin_transaction(Some("scratch")).unwrap();
        assert!(volume.begin_transaction(None).is_err());
        volume.create_directory("/tmp/deep").unwrap();
        volume.write_all_text("/tmp/deep/x", "gone").unwrap();
        volume.delete("/keep.txt").unwrap();
        volume.rollback().unwrap();

        assert!(!volume.exists("/tmp").unwrap());
        assert_eq!(volume.read_to_string("/keep.txt").unwrap(), "kept");
        assert!(matches!(volume.commit(), Err(SlabError::MissingTransaction)));
    }

    #[test]
    fn test_copy_tree() {
        let mut volume = volume();
        volume.write_all_text("/src/a.txt", "A").unwrap();
        volume.write_all_text("/src/sub/b.txt", "B").unwrap();
        volume.write_attributes("/src/a.txt", &[7]).unwrap();

        volume.copy("/src", "/dst/copy", false).unwrap();
        assert_eq!(volume.read_to_string("/dst/copy/sub/b.txt").unwrap(), "B");
        assert_eq!(volume.read_attributes("/dst/copy/a.txt").unwrap(), vec![7, 0, 0, 0]);
        assert!(matches!(
            volume.copy("/src", "/dst/copy", false),
            Err(SlabError::AlreadyExists(_))
        ));
        assert!(matches!(
            volume.copy("/src", "/src/inner", false),
            Err(SlabError::MoveIntoSubtree(_))
        ));
        volume.copy("/src/a.txt", "/dst/copy", true).unwrap();
        assert_eq!(volume.read_to_string("/dst/copy").unwrap(), "A");
    }

    #[test]
    fn test_move_and_listing() {
        let mut volume = volume();
        volume.write_all_text("/a/one", "1").unwrap();
        volume.write_all_text("/a/b/two", "2").unwrap();
        assert!(volume.move_entry("/a/b", "/b", false).unwrap());
        assert!(!volume.move_entry("/missing", "/x", false).unwrap());

        assert_eq!(
            volume.list_files("/", PathKind::Absolute, true).unwrap(),
            vec!["/a/one", "/b/two"]
        );
        assert_eq!(
            volume.list_directories("/", PathKind::Relative, false).unwrap(),
            vec!["a", "b"]
        );
        let info = volume.directory_info("/b").unwrap();
        assert_eq!(info.path, "/b");
        assert_eq!(info.file_count, 1);

        volume.clear_directory("/a").unwrap();
        assert!(volume.list_files("/a", PathKind::Relative, true).unwrap().is_empty());
    }

    #[test]
    fn test_close_reports_open_transaction() {
        let mut volume = volume();
        volume.begin_transaction(None).unwrap();
        volume.write_all_text("/x", "x").unwrap();
        assert!(matches!(volume.close(), Err(SlabError::UnsavedChanges(1))));
    }
}
