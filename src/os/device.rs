//! Block-addressable storage devices
//!
//! A [`Device`] presents a flat byte space to the pager. Two variants exist:
//! a file-backed device with optional memory mapping on the read path, and an
//! in-memory arena for environments that never persist.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;
use memmap2::Mmap;

use crate::error::{Error, ErrorKind, Result};
use crate::types::Fadvise;

/// Uniform backing store interface.
pub trait Device: Send {
    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset`, extending the store if needed.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Truncate or extend the store to `len` bytes.
    fn truncate(&mut self, len: u64) -> Result<()>;

    /// Push buffered writes to the OS; `fsync` forces them to stable storage.
    fn flush(&mut self, fsync: bool) -> Result<()>;

    /// Current length in bytes.
    fn len(&mut self) -> Result<u64>;

    /// True when reads may be served from a memory mapping.
    fn is_mapped(&self) -> bool {
        false
    }
}

// ============================================================================
// File device
// ============================================================================

/// File-backed device holding an exclusive lock for the lifetime of the
/// environment.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    map: Option<Mmap>,
    use_mmap: bool,
    read_only: bool,
}

impl FileDevice {
    pub fn create(path: &Path, use_mmap: bool, fadvise: Fadvise) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::from_file(file, use_mmap, false, fadvise)
    }

    pub fn open(path: &Path, use_mmap: bool, read_only: bool, fadvise: Fadvise) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(!read_only).open(path)?;
        Self::from_file(file, use_mmap, read_only, fadvise)
    }

    fn from_file(file: File, use_mmap: bool, read_only: bool, fadvise: Fadvise) -> Result<Self> {
        file.try_lock_exclusive().map_err(|_| {
            Error::with_detail(ErrorKind::WouldBlock, "backing file is locked by another process")
        })?;
        apply_fadvise(&file, fadvise);
        let mut device = FileDevice { file, map: None, use_mmap, read_only };
        device.remap()?;
        Ok(device)
    }

    /// Refresh the read mapping to cover the current file length.
    fn remap(&mut self) -> Result<()> {
        self.map = None;
        if !self.use_mmap {
            return Ok(());
        }
        let len = self.file.metadata()?.len();
        if len == 0 {
            return Ok(());
        }
        // Safety: the file is exclusively locked by this process; writes go
        // through the same descriptor and the map is refreshed after growth.
        self.map = Some(unsafe { Mmap::map(&self.file)? });
        Ok(())
    }
}

impl Device for FileDevice {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.use_mmap {
            let covered = self
                .map
                .as_ref()
                .map(|m| offset as usize + buf.len() <= m.len())
                .unwrap_or(false);
            if !covered && self.file.metadata()?.len() >= offset + buf.len() as u64 {
                self.remap()?;
            }
            if let Some(map) = &self.map {
                let start = offset as usize;
                if start + buf.len() <= map.len() {
                    buf.copy_from_slice(&map[start..start + buf.len()]);
                    return Ok(());
                }
            }
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::new(ErrorKind::WriteProtected));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        if self.read_only {
            return Err(Error::new(ErrorKind::WriteProtected));
        }
        self.file.set_len(len)?;
        self.remap()
    }

    fn flush(&mut self, fsync: bool) -> Result<()> {
        self.file.flush()?;
        if fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn is_mapped(&self) -> bool {
        self.map.is_some()
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(unix)]
fn apply_fadvise(file: &File, fadvise: Fadvise) {
    use std::os::unix::io::AsRawFd;
    let advice = match fadvise {
        Fadvise::Normal => libc::POSIX_FADV_NORMAL,
        Fadvise::Random => libc::POSIX_FADV_RANDOM,
    };
    // Purely a hint; failure is irrelevant.
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, advice);
    }
}

#[cfg(not(unix))]
fn apply_fadvise(_file: &File, _fadvise: Fadvise) {}

// ============================================================================
// In-memory device
// ============================================================================

/// Growable arena for `in-memory` environments.
#[derive(Default)]
pub struct MemDevice {
    buf: Vec<u8>,
}

impl MemDevice {
    pub fn new() -> Self {
        MemDevice { buf: Vec::new() }
    }
}

impl Device for MemDevice {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.buf.len() {
            return Err(Error::with_detail(ErrorKind::IoError, "read past end of arena"));
        }
        buf.copy_from_slice(&self.buf[start..end]);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + data.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.buf.resize(len as usize, 0);
        Ok(())
    }

    fn flush(&mut self, _fsync: bool) -> Result<()> {
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.buf.len() as u64)
    }
}
