//! Block-addressed byte storage backing file contents
//!
//! An [`Inode`] is shared by every File entry that is a hard link to it. It
//! knows nothing about paths. Storage is one eagerly allocated direct block
//! plus an indirect block table that grows on demand up to a fixed ceiling.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{FsError, FsResult};
use crate::lock::{FileLock, LockSet};

/// Bytes per block. Slightly under a page so a block plus allocator
/// bookkeeping fits one page.
pub const BLOCK_SIZE: usize = 4096 - 32;

/// Default ceiling on blocks per inode (direct block included), about 1 GiB.
pub const MAX_BLOCKS: u32 = 1 << 18;

const INITIAL_INDIRECT_CAPACITY: usize = 8;

static NEXT_INODE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque inode identifier, unique within the process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeId(u64);

impl InodeId {
    fn next() -> Self {
        Self(NEXT_INODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

struct Blocks {
    direct: Box<[u8]>,
    indirect: Vec<Box<[u8]>>,
    size: u64,
    max_blocks: u32,
}

fn new_block() -> Box<[u8]> {
    vec![0u8; BLOCK_SIZE].into_boxed_slice()
}

fn split(offset: u64) -> (usize, usize) {
    (
        (offset / BLOCK_SIZE as u64) as usize,
        (offset % BLOCK_SIZE as u64) as usize,
    )
}

impl Blocks {
    fn new(max_blocks: u32) -> Self {
        Self {
            direct: new_block(),
            indirect: Vec::new(),
            size: 0,
            max_blocks: max_blocks.clamp(1, MAX_BLOCKS),
        }
    }

    fn block_count(&self) -> usize {
        1 + self.indirect.len()
    }

    fn block(&self, index: usize) -> &[u8] {
        if index == 0 {
            &self.direct
        } else {
            &self.indirect[index - 1]
        }
    }

    fn block_mut(&mut self, index: usize) -> &mut [u8] {
        if index == 0 {
            &mut self.direct
        } else {
            &mut self.indirect[index - 1]
        }
    }

    /// Fail unless `required` bytes fit under the block ceiling.
    fn check_capacity(&self, required: u64) -> FsResult<u64> {
        let needed = required.div_ceil(BLOCK_SIZE as u64).max(1);
        if needed > self.max_blocks as u64 {
            return Err(FsError::CapacityExceeded);
        }
        Ok(needed)
    }

    /// Allocate exactly the blocks needed to hold `required` bytes.
    fn ensure_capacity(&mut self, required: u64) -> FsResult<()> {
        let needed = self.check_capacity(required)? as usize;
        if needed <= self.block_count() {
            return Ok(());
        }

        let needed_indirect = needed - 1;
        if needed_indirect > self.indirect.capacity() {
            let ceiling = self.max_blocks as usize - 1;
            let target = (self.indirect.capacity() * 2)
                .max(INITIAL_INDIRECT_CAPACITY)
                .max(needed_indirect)
                .min(ceiling);
            self.indirect.reserve_exact(target - self.indirect.len());
        }
        while self.indirect.len() < needed_indirect {
            self.indirect.push(new_block());
        }
        Ok(())
    }

    fn read(&self, dst: &mut [u8], offset: u64) -> Option<usize> {
        if offset >= self.size {
            return None;
        }
        let available = (self.size - offset).min(dst.len() as u64) as usize;
        let mut done = 0;
        while done < available {
            let (index, within) = split(offset + done as u64);
            let n = (BLOCK_SIZE - within).min(available - done);
            dst[done..done + n].copy_from_slice(&self.block(index)[within..within + n]);
            done += n;
        }
        Some(done)
    }

    fn write(&mut self, src: &[u8], offset: u64) -> FsResult<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(src.len() as u64)
            .ok_or(FsError::CapacityExceeded)?;
        self.ensure_capacity(end)?;
        let mut done = 0;
        while done < src.len() {
            let (index, within) = split(offset + done as u64);
            let n = (BLOCK_SIZE - within).min(src.len() - done);
            self.block_mut(index)[within..within + n].copy_from_slice(&src[done..done + n]);
            done += n;
        }
        self.size = self.size.max(end);
        Ok(done)
    }

    fn truncate(&mut self, new_size: u64) {
        if new_size >= self.size {
            return;
        }
        self.size = new_size;
        // bytes past the end must read back as zeros if the file grows again
        let (index, within) = split(new_size);
        if index < self.block_count() {
            self.block_mut(index)[within..].fill(0);
        }
        let keep = new_size.div_ceil(BLOCK_SIZE as u64).max(1) as usize;
        self.indirect.truncate(keep - 1);
    }
}

/// Shared, growable byte container
pub struct Inode {
    id: InodeId,
    data: RwLock<Blocks>,
    locks: Mutex<Option<LockSet>>,
    links: AtomicU32,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("id", &self.id)
            .field("size", &self.size())
            .field("links", &self.link_count())
            .finish()
    }
}

impl Inode {
    pub fn new(max_blocks: u32) -> Self {
        Self {
            id: InodeId::next(),
            data: RwLock::new(Blocks::new(max_blocks)),
            locks: Mutex::new(None),
            links: AtomicU32::new(1),
        }
    }

    pub fn id(&self) -> InodeId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.data.read().size
    }

    /// Number of storage blocks currently allocated.
    pub fn block_count(&self) -> usize {
        self.data.read().block_count()
    }

    /// Copy bytes at `offset` into `dst`. `None` means `offset` is at or past the end.
    pub fn read(&self, dst: &mut [u8], offset: u64) -> Option<usize> {
        self.data.read().read(dst, offset)
    }

    /// Write `src` at `offset`, growing storage as needed. Any gap between the
    /// old size and `offset` reads back as zeros.
    pub fn write(&self, src: &[u8], offset: u64) -> FsResult<usize> {
        self.data.write().write(src, offset)
    }

    /// Append `src`, returning the offset it landed at and the bytes written.
    pub fn write_at_end(&self, src: &[u8]) -> FsResult<(u64, usize)> {
        let mut data = self.data.write();
        let offset = data.size;
        let written = data.write(src, offset)?;
        Ok((offset, written))
    }

    /// Fill up to `count` bytes at `offset` from `reader`, one block at a time.
    /// Nothing is transferred when `offset` lies beyond the current size, and
    /// nothing at all when `offset + count` would not fit.
    pub fn transfer_from<R: Read + ?Sized>(
        &self,
        reader: &mut R,
        offset: u64,
        count: u64,
    ) -> FsResult<u64> {
        let mut data = self.data.write();
        if offset > data.size {
            return Ok(0);
        }
        let end = offset
            .checked_add(count)
            .ok_or(FsError::CapacityExceeded)?;
        data.check_capacity(end)?;
        let mut transferred = 0u64;
        while transferred < count {
            let position = offset + transferred;
            let (index, within) = split(position);
            let n = ((BLOCK_SIZE - within) as u64).min(count - transferred) as usize;
            data.ensure_capacity(position + n as u64)?;
            let got = loop {
                match reader.read(&mut data.block_mut(index)[within..within + n]) {
                    Ok(got) => break got,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            };
            if got == 0 {
                break;
            }
            transferred += got as u64;
            data.size = data.size.max(offset + transferred);
        }
        trace!(inode = self.id.0, offset, transferred, "transfer_from");
        Ok(transferred)
    }

    /// Copy up to `count` bytes starting at `offset` into `writer`, one block at a time.
    pub fn transfer_to<W: Write + ?Sized>(
        &self,
        writer: &mut W,
        offset: u64,
        count: u64,
    ) -> FsResult<u64> {
        let data = self.data.read();
        if offset >= data.size {
            return Ok(0);
        }
        let end = offset.saturating_add(count).min(data.size);
        let mut position = offset;
        while position < end {
            let (index, within) = split(position);
            let n = ((BLOCK_SIZE - within) as u64).min(end - position) as usize;
            writer.write_all(&data.block(index)[within..within + n])?;
            position += n as u64;
        }
        Ok(position - offset)
    }

    /// Shrink to `new_size`. Never grows.
    pub fn truncate(&self, new_size: u64) {
        self.data.write().truncate(new_size);
    }

    /// Deep copy of the contents into a brand-new inode.
    pub fn duplicate(&self) -> Inode {
        let data = self.data.read();
        let copy = Blocks {
            direct: data.direct.clone(),
            indirect: data.indirect.clone(),
            size: data.size,
            max_blocks: data.max_blocks,
        };
        Inode {
            id: InodeId::next(),
            data: RwLock::new(copy),
            locks: Mutex::new(None),
            links: AtomicU32::new(1),
        }
    }

    /// Number of File entries referring to this inode.
    pub fn link_count(&self) -> u32 {
        self.links.load(Ordering::Acquire)
    }

    pub(crate) fn add_link(&self) {
        self.links.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_link(&self) {
        let _ = self
            .links
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Grant an advisory lock over `[offset, offset + len)` or fail with
    /// [`FsError::LockConflict`] without waiting.
    pub fn try_lock(self: &Arc<Self>, offset: u64, len: u64) -> FsResult<FileLock> {
        if len == 0 {
            return Err(FsError::InvalidArgument);
        }
        let mut locks = self.locks.lock();
        let set = locks.get_or_insert_with(LockSet::new);
        let id = set.insert(offset, len).inspect_err(|_| {
            trace!(inode = self.id.0, offset, len, "byte-range lock conflict");
        })?;
        trace!(inode = self.id.0, offset, len, "byte-range lock granted");
        Ok(FileLock::new(Arc::downgrade(self), id, offset, len))
    }

    /// Same as [`Inode::try_lock`], but refuses with [`FsError::Interrupted`]
    /// when `cancel` has already fired.
    pub fn lock(
        self: &Arc<Self>,
        offset: u64,
        len: u64,
        cancel: &CancellationToken,
    ) -> FsResult<FileLock> {
        if cancel.is_cancelled() {
            return Err(FsError::Interrupted);
        }
        self.try_lock(offset, len)
    }

    pub(crate) fn release_lock(&self, lock: &FileLock) {
        let mut locks = self.locks.lock();
        if lock.invalidate() {
            if let Some(set) = locks.as_mut() {
                set.remove(lock.offset(), lock.id());
            }
        }
    }

    /// Number of byte-range locks currently held.
    pub fn lock_count(&self) -> usize {
        self.locks.lock().as_ref().map_or(0, LockSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_write_then_read() {
        let inode = Inode::new(MAX_BLOCKS);
        assert_eq!(inode.write(b"hello world", 0).unwrap(), 11);
        assert_eq!(inode.size(), 11);

        let mut buf = [0u8; 5];
        assert_eq!(inode.read(&mut buf, 6), Some(5));
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn test_read_at_end_is_none() {
        let inode = Inode::new(MAX_BLOCKS);
        inode.write(b"abc", 0).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(inode.read(&mut buf, 3), None);
        assert_eq!(inode.read(&mut buf, 100), None);
        assert_eq!(inode.read(&mut buf, 1), Some(2));
    }

    #[test]
    fn test_block_boundaries() {
        for k in 1..=4usize {
            for len in [k * BLOCK_SIZE - 1, k * BLOCK_SIZE, k * BLOCK_SIZE + 1] {
                let inode = Inode::new(MAX_BLOCKS);
                let data = pattern(len);
                assert_eq!(inode.write(&data, 0).unwrap(), len);
                assert_eq!(inode.size(), len as u64);
                assert_eq!(inode.block_count(), len.div_ceil(BLOCK_SIZE));

                let mut back = vec![0u8; len];
                assert_eq!(inode.read(&mut back, 0), Some(len));
                assert_eq!(back, data);

                for tail in 1..=3usize {
                    let mut end = vec![0u8; tail];
                    let offset = (len - tail) as u64;
                    assert_eq!(inode.read(&mut end, offset), Some(tail));
                    assert_eq!(end, &data[len - tail..]);
                }
            }
        }
    }

    #[test]
    fn test_write_spanning_blocks_at_offset() {
        let inode = Inode::new(MAX_BLOCKS);
        inode.write(&pattern(BLOCK_SIZE * 2), 0).unwrap();
        inode.write(b"XYZ", BLOCK_SIZE as u64 - 1).unwrap();
        let mut buf = [0u8; 3];
        inode.read(&mut buf, BLOCK_SIZE as u64 - 1);
        assert_eq!(&buf, b"XYZ");
        assert_eq!(inode.size(), (BLOCK_SIZE * 2) as u64);
    }

    #[test]
    fn test_write_at_end() {
        let inode = Inode::new(MAX_BLOCKS);
        inode.write(b"hello", 0).unwrap();
        assert_eq!(inode.write_at_end(b"!").unwrap(), (5, 1));
        let mut buf = [0u8; 6];
        inode.read(&mut buf, 0);
        assert_eq!(&buf, b"hello!");
    }

    #[test]
    fn test_truncate_only_shrinks() {
        let inode = Inode::new(MAX_BLOCKS);
        inode.write(&pattern(BLOCK_SIZE * 3), 0).unwrap();
        inode.truncate(BLOCK_SIZE as u64 * 5);
        assert_eq!(inode.size(), (BLOCK_SIZE * 3) as u64);

        inode.truncate(10);
        assert_eq!(inode.size(), 10);
        assert_eq!(inode.block_count(), 1);

        inode.truncate(0);
        assert_eq!(inode.size(), 0);
    }

    #[test]
    fn test_gap_after_truncate_reads_zero() {
        let inode = Inode::new(MAX_BLOCKS);
        inode.write(&[7u8; 100], 0).unwrap();
        inode.truncate(10);
        inode.write(b"z", 50).unwrap();

        let mut buf = [0xffu8; 51];
        assert_eq!(inode.read(&mut buf, 0), Some(51));
        assert!(buf[..10].iter().all(|&b| b == 7));
        assert!(buf[10..50].iter().all(|&b| b == 0));
        assert_eq!(buf[50], b'z');
    }

    #[test]
    fn test_capacity_ceiling() {
        let inode = Inode::new(2);
        inode.write(&pattern(BLOCK_SIZE * 2), 0).unwrap();
        let err = inode.write(b"x", (BLOCK_SIZE * 2) as u64).unwrap_err();
        assert!(matches!(err, FsError::CapacityExceeded));
        assert_eq!(inode.size(), (BLOCK_SIZE * 2) as u64);
    }

    #[test]
    fn test_transfer_from_past_ceiling_changes_nothing() {
        let inode = Inode::new(2);
        let source = vec![7u8; BLOCK_SIZE * 3];
        let err = inode
            .transfer_from(&mut source.as_slice(), 0, source.len() as u64)
            .unwrap_err();
        assert!(matches!(err, FsError::CapacityExceeded));
        assert_eq!(inode.size(), 0);
        assert_eq!(inode.block_count(), 1);

        let n = inode
            .transfer_from(&mut source.as_slice(), 0, (BLOCK_SIZE * 2) as u64)
            .unwrap();
        assert_eq!(n, (BLOCK_SIZE * 2) as u64);
        assert_eq!(inode.size(), (BLOCK_SIZE * 2) as u64);
    }

    #[test]
    fn test_block_ceiling_is_clamped() {
        let inode = Inode::new(u32::MAX);
        let err = inode
            .write(b"x", BLOCK_SIZE as u64 * MAX_BLOCKS as u64)
            .unwrap_err();
        assert!(matches!(err, FsError::CapacityExceeded));

        let inode = Inode::new(0);
        inode.write(&[1u8; BLOCK_SIZE], 0).unwrap();
        assert!(inode.write(b"x", BLOCK_SIZE as u64).is_err());
    }

    #[test]
    fn test_duplicate_is_independent() {
        let inode = Inode::new(MAX_BLOCKS);
        inode.write(b"original", 0).unwrap();
        let copy = inode.duplicate();
        assert_ne!(copy.id(), inode.id());

        copy.write(b"modified", 0).unwrap();
        let mut buf = [0u8; 8];
        inode.read(&mut buf, 0);
        assert_eq!(&buf, b"original");
        copy.read(&mut buf, 0);
        assert_eq!(&buf, b"modified");
    }

    #[test]
    fn test_transfer_round_trip() {
        let inode = Inode::new(MAX_BLOCKS);
        let data = pattern(BLOCK_SIZE * 2 + 17);
        let mut reader = io::Cursor::new(data.clone());
        let n = inode
            .transfer_from(&mut reader, 0, data.len() as u64 + 100)
            .unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(inode.size(), data.len() as u64);

        let mut out = Vec::new();
        let n = inode.transfer_to(&mut out, 5, u64::MAX).unwrap();
        assert_eq!(n, data.len() as u64 - 5);
        assert_eq!(out, &data[5..]);
    }

    #[test]
    fn test_transfer_from_past_end_is_noop() {
        let inode = Inode::new(MAX_BLOCKS);
        inode.write(b"abc", 0).unwrap();
        let mut reader = io::Cursor::new(b"zzz".to_vec());
        assert_eq!(inode.transfer_from(&mut reader, 10, 3).unwrap(), 0);
        assert_eq!(inode.size(), 3);
    }

    #[test]
    fn test_link_count() {
        let inode = Inode::new(MAX_BLOCKS);
        assert_eq!(inode.link_count(), 1);
        inode.add_link();
        assert_eq!(inode.link_count(), 2);
        inode.remove_link();
        inode.remove_link();
        inode.remove_link();
        assert_eq!(inode.link_count(), 0);
    }
}
