//! Open file handles

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::TimestampResolution;
use crate::entry::EntryRef;
use crate::error::{FsError, FsResult};
use crate::inode::Inode;
use crate::lock::FileLock;
use crate::path::FsPath;
use crate::types::{Attributes, OpenOptions};
use crate::vfs::FsShared;

/// An open file.
///
/// Keeps the file's contents reachable even after its name is gone. Dropping
/// the handle closes it.
pub struct FileHandle {
    fs: Weak<FsShared>,
    entry: EntryRef,
    inode: Arc<Inode>,
    path: FsPath,
    options: OpenOptions,
    resolution: TimestampResolution,
    position: u64,
    locks: Vec<FileLock>,
    closed: bool,
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("inode", &self.inode.id())
            .field("position", &self.position)
            .field("closed", &self.closed)
            .finish()
    }
}

impl FileHandle {
    pub(crate) fn new(
        fs: Weak<FsShared>,
        entry: EntryRef,
        inode: Arc<Inode>,
        path: FsPath,
        options: OpenOptions,
        resolution: TimestampResolution,
    ) -> Self {
        Self {
            fs,
            entry,
            inode,
            path,
            options,
            resolution,
            position: 0,
            locks: Vec::new(),
            closed: false,
        }
    }

    /// Path the handle was opened through, with links resolved
    pub fn path(&self) -> &FsPath {
        &self.path
    }

    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    fn check_open(&self) -> FsResult<()> {
        if self.closed {
            return Err(FsError::Closed);
        }
        Ok(())
    }

    fn check_readable(&self) -> FsResult<()> {
        self.check_open()?;
        if !self.options.read {
            return Err(FsError::AccessDenied);
        }
        Ok(())
    }

    fn check_writable(&self) -> FsResult<()> {
        self.check_open()?;
        if !self.options.write {
            return Err(FsError::AccessDenied);
        }
        Ok(())
    }

    // Cursor I/O

    /// Read at the cursor and advance it. Returns 0 at end of data.
    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let n = self.read_at(buf, self.position)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Write at the cursor, or at the end in append mode, and advance it.
    pub fn write(&mut self, buf: &[u8]) -> FsResult<usize> {
        self.check_writable()?;
        let written = if self.options.append {
            let (offset, n) = self.inode.write_at_end(buf)?;
            self.position = offset + n as u64;
            n
        } else {
            let n = self.inode.write(buf, self.position)?;
            self.position += n as u64;
            n
        };
        self.touch(true);
        Ok(written)
    }

    // Positional I/O

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        self.check_readable()?;
        let n = self.inode.read(buf, offset).unwrap_or(0);
        self.touch(false);
        Ok(n)
    }

    /// Write at `offset` without moving the cursor.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> FsResult<usize> {
        self.check_writable()?;
        let n = self.inode.write(buf, offset)?;
        self.touch(true);
        Ok(n)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn set_position(&mut self, position: u64) -> FsResult<()> {
        self.check_open()?;
        self.position = position;
        Ok(())
    }

    pub fn size(&self) -> FsResult<u64> {
        self.check_open()?;
        Ok(self.inode.size())
    }

    /// Shrink the file to `size`. The cursor is pulled back if it lay past the new end.
    pub fn truncate(&mut self, size: u64) -> FsResult<()> {
        self.check_writable()?;
        self.inode.truncate(size);
        self.position = self.position.min(size);
        self.touch(true);
        Ok(())
    }

    /// Copy up to `count` bytes from `offset` into `writer`.
    pub fn transfer_to<W: Write + ?Sized>(
        &self,
        offset: u64,
        count: u64,
        writer: &mut W,
    ) -> FsResult<u64> {
        self.check_readable()?;
        let n = self.inode.transfer_to(writer, offset, count)?;
        self.touch(false);
        Ok(n)
    }

    /// Fill up to `count` bytes at `offset` from `reader`.
    pub fn transfer_from<R: Read + ?Sized>(
        &self,
        reader: &mut R,
        offset: u64,
        count: u64,
    ) -> FsResult<u64> {
        self.check_writable()?;
        let n = self.inode.transfer_from(reader, offset, count)?;
        if n > 0 {
            self.touch(true);
        }
        Ok(n)
    }

    // Byte-range locks

    pub fn try_lock(&mut self, offset: u64, len: u64) -> FsResult<FileLock> {
        self.check_open()?;
        let lock = self.inode.try_lock(offset, len)?;
        self.remember(&lock);
        Ok(lock)
    }

    pub fn lock(&mut self, offset: u64, len: u64, cancel: &CancellationToken) -> FsResult<FileLock> {
        self.check_open()?;
        let lock = self.inode.lock(offset, len, cancel)?;
        self.remember(&lock);
        Ok(lock)
    }

    fn remember(&mut self, lock: &FileLock) {
        self.locks.retain(FileLock::is_valid);
        self.locks.push(lock.clone());
    }

    pub fn sync(&self) -> FsResult<()> {
        self.check_open()
    }

    pub fn metadata(&self) -> FsResult<Attributes> {
        self.check_open()?;
        Ok(self.entry.read().attributes())
    }

    /// Release this handle's locks and drop the file's open count. If the file
    /// was opened with delete-on-close and this was its last handle, its name
    /// is removed; failing to do so is logged and otherwise ignored.
    pub fn close(&mut self) -> FsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for lock in self.locks.drain(..) {
            lock.release();
        }

        let delete = {
            let mut entry = self.entry.write();
            match entry.as_file_mut() {
                Ok(file) => file.close() == 0 && file.delete_on_close,
                Err(_) => false,
            }
        };
        trace!(path = %self.path, "closed");

        let Some(fs) = self.fs.upgrade() else {
            return Ok(());
        };
        fs.release_handle();
        if delete {
            if let Err(e) = fs.delete_entry(&self.path, Some(&self.entry)) {
                debug!(path = %self.path, error = %e, "delete on close skipped");
            }
        }
        Ok(())
    }

    fn touch(&self, modified: bool) {
        let now = self.resolution.now();
        let mut entry = self.entry.write();
        if modified {
            entry.touch_modified(now);
        } else {
            entry.touch_accessed(now);
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl Read for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        FileHandle::read(self, buf).map_err(io::Error::from)
    }
}

impl Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FileHandle::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync().map_err(io::Error::from)
    }
}

impl Seek for FileHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, delta) = match pos {
            SeekFrom::Start(n) => (0, n as i128),
            SeekFrom::End(d) => (self.size()?, d as i128),
            SeekFrom::Current(d) => (self.position, d as i128),
        };
        let target = base as i128 + delta;
        if target < 0 || target > u64::MAX as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.set_position(target as u64)?;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FsConfig, MemoryFileSystem};

    fn fs() -> MemoryFileSystem {
        MemoryFileSystem::new(FsConfig::default()).unwrap()
    }

    #[test]
    fn test_cursor_and_positional_io() {
        let fs = fs();
        let mut h = fs.open("/f", &OpenOptions::create()).unwrap();
        assert_eq!(h.write(b"hello world").unwrap(), 11);
        assert_eq!(h.position(), 11);
        h.write_at(b"W", 6).unwrap();
        assert_eq!(h.position(), 11);
        h.close().unwrap();

        let mut h = fs.open("/f", &OpenOptions::read()).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(h.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        let mut tail = [0u8; 16];
        let n = h.read_at(&mut tail, 6).unwrap();
        assert_eq!(&tail[..n], b"World");
        assert_eq!(h.read_at(&mut tail, 11).unwrap(), 0);
    }

    #[test]
    fn test_append_mode_writes_at_end() {
        let fs = fs();
        fs.write_all("/log", b"one").unwrap();
        let mut h = fs.open("/log", &OpenOptions::append()).unwrap();
        h.set_position(0).unwrap();
        h.write(b"two").unwrap();
        assert_eq!(h.position(), 6);
        drop(h);
        assert_eq!(fs.read_all("/log").unwrap(), b"onetwo");
    }

    #[test]
    fn test_access_mode_is_enforced() {
        let fs = fs();
        fs.create_file("/f").unwrap();
        let mut h = fs.open("/f", &OpenOptions::read()).unwrap();
        assert!(matches!(h.write(b"x"), Err(FsError::AccessDenied)));
        assert!(matches!(h.truncate(0), Err(FsError::AccessDenied)));

        let mut w = fs
            .open("/f", &OpenOptions { read: false, ..OpenOptions::write() })
            .unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(w.read(&mut buf), Err(FsError::AccessDenied)));
    }

    #[test]
    fn test_closed_handle_rejects_io() {
        let fs = fs();
        let mut h = fs.open("/f", &OpenOptions::create()).unwrap();
        h.close().unwrap();
        h.close().unwrap();
        assert!(!h.is_open());
        assert!(matches!(h.write(b"x"), Err(FsError::Closed)));
        assert!(matches!(h.size(), Err(FsError::Closed)));
        assert_eq!(fs.open_handle_count(), 0);
    }

    #[test]
    fn test_truncate_pulls_cursor_back() {
        let fs = fs();
        let mut h = fs.open("/f", &OpenOptions::create()).unwrap();
        h.write(b"0123456789").unwrap();
        h.truncate(4).unwrap();
        assert_eq!(h.position(), 4);
        assert_eq!(h.size().unwrap(), 4);
        h.truncate(100).unwrap();
        assert_eq!(h.size().unwrap(), 4);
    }

    #[test]
    fn test_seek() {
        let fs = fs();
        let mut h = fs.open("/f", &OpenOptions::create()).unwrap();
        h.write(b"abcdef").unwrap();
        assert_eq!(h.seek(SeekFrom::End(-2)).unwrap(), 4);
        assert_eq!(h.seek(SeekFrom::Current(-3)).unwrap(), 1);
        assert!(h.seek(SeekFrom::Current(-5)).is_err());
        assert_eq!(h.position(), 1);
    }

    #[test]
    fn test_close_releases_own_locks() {
        let fs = fs();
        let mut a = fs.open("/f", &OpenOptions::create()).unwrap();
        let mut b = fs.open("/f", &OpenOptions::write()).unwrap();
        let lock = a.try_lock(0, 10).unwrap();
        assert!(matches!(b.try_lock(5, 1), Err(FsError::LockConflict)));
        a.close().unwrap();
        assert!(!lock.is_valid());
        b.try_lock(5, 1).unwrap();
    }

    #[test]
    fn test_transfer_between_handles() {
        let fs = fs();
        fs.write_all("/src", b"payload").unwrap();
        let src = fs.open("/src", &OpenOptions::read()).unwrap();
        let mut out = Vec::new();
        assert_eq!(src.transfer_to(3, 100, &mut out).unwrap(), 4);
        assert_eq!(out, b"load");

        let dst = fs.open("/dst", &OpenOptions::create()).unwrap();
        let mut reader: &[u8] = b"xyz";
        assert_eq!(dst.transfer_from(&mut reader, 0, 10).unwrap(), 3);
        assert_eq!(dst.size().unwrap(), 3);
    }
}
