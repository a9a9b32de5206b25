//! Backing store access
//!
//! A volume lives in anything implementing [`Storage`]: a host file or an
//! in-memory buffer. [`Store`] sits in front of it and stages writes in an
//! offset-ordered buffer so metadata updates that land close together reach
//! the host in one sorted pass.

use crate::core::error::Result;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

/// Random-access byte storage a volume can live in
pub trait Storage: Read + Write + Seek {
    /// Current physical length in bytes
    fn byte_len(&mut self) -> Result<u64>;

    /// Grow or shrink the physical length
    fn set_byte_len(&mut self, len: u64) -> Result<()>;

    /// Push written bytes to durable media
    fn sync(&mut self) -> Result<()> {
        self.flush()?;
        Ok(())
    }
}

impl Storage for File {
    fn byte_len(&mut self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_byte_len(&mut self, len: u64) -> Result<()> {
        self.set_len(len)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.sync_data()?;
        Ok(())
    }
}

impl Storage for Cursor<Vec<u8>> {
    fn byte_len(&mut self) -> Result<u64> {
        Ok(self.get_ref().len() as u64)
    }

    fn set_byte_len(&mut self, len: u64) -> Result<()> {
        self.get_mut().resize(len as usize, 0);
        Ok(())
    }
}

/// Write-staging front for a [`Storage`]
pub struct Store {
    inner: Box<dyn Storage>,
    staged: BTreeMap<u64, Vec<u8>>,
    staged_bytes: usize,
    capacity: usize,
    /// Logical length: physical length plus anything staged past it
    len: u64,
}

impl Store {
    pub fn new(mut inner: Box<dyn Storage>, capacity: usize) -> Result<Self> {
        let len = inner.byte_len()?;
        Ok(Store {
            inner,
            staged: BTreeMap::new(),
            staged_bytes: 0,
            capacity,
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Change the staging budget; flushes if already over it
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        self.capacity = capacity;
        self.flush_if_full()
    }

    /// Bytes waiting to be written
    pub fn staged_bytes(&self) -> usize {
        self.staged_bytes
    }

    /// Read `buf.len()` bytes at `offset`.
    ///
    /// Staged writes are flushed first. Bytes past the physical end read as
    /// zero.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.flush()?;
        self.inner.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf[filled..].fill(0);
        Ok(())
    }

    /// Stage a write. Overlapping an already staged range forces a flush so
    /// the later bytes always win.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len() as u64;

        if let Some(existing) = self.staged.get(&offset) {
            let covers_next = self.staged.range(offset + 1..end).next().is_some();
            if existing.len() <= data.len() && !covers_next {
                self.staged_bytes -= existing.len();
                self.staged_bytes += data.len();
                self.staged.insert(offset, data.to_vec());
                self.len = self.len.max(end);
                return self.flush_if_full();
            }
        }

        // Staged ranges are disjoint, so only the closest one starting
        // before `end` can overlap.
        let overlaps = self
            .staged
            .range(..end)
            .next_back()
            .map(|(&start, bytes)| start + bytes.len() as u64 > offset)
            .unwrap_or(false);
        if overlaps {
            self.flush()?;
        }

        self.staged.insert(offset, data.to_vec());
        self.staged_bytes += data.len();
        self.len = self.len.max(end);
        self.flush_if_full()
    }

    /// Extend the store with zeros up to `len`
    pub fn ensure_len(&mut self, len: u64) -> Result<()> {
        if len <= self.len {
            return Ok(());
        }
        self.flush()?;
        self.inner.set_byte_len(len)?;
        self.len = len;
        Ok(())
    }

    /// Write all staged ranges in offset order
    pub fn flush(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let staged = std::mem::take(&mut self.staged);
        self.staged_bytes = 0;
        for (offset, bytes) in staged {
            self.inner.seek(SeekFrom::Start(offset))?;
            self.inner.write_all(&bytes)?;
        }
        self.inner.flush()?;
        Ok(())
    }

    /// Flush and push to durable media
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.inner.sync()
    }

    /// Copy the full store into `writer`
    pub fn copy_to(&mut self, writer: &mut dyn Write) -> Result<u64> {
        self.flush()?;
        self.inner.seek(SeekFrom::Start(0))?;
        let copied = std::io::copy(&mut (&mut self.inner).take(self.len), writer)?;
        Ok(copied)
    }

    fn flush_if_full(&mut self) -> Result<()> {
        if self.staged_bytes >= self.capacity {
            self.flush()?;
        }
        Ok(())
    }
}
