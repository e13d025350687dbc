//! Advisory byte-range locks

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{FsError, FsResult};
use crate::inode::Inode;

#[derive(Debug)]
struct LockRecord {
    end: u64,
    id: u64,
}

/// Granted locks of one inode, keyed by start offset. Ranges never overlap.
#[derive(Debug, Default)]
pub(crate) struct LockSet {
    by_start: BTreeMap<u64, LockRecord>,
    next_id: u64,
}

impl LockSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_start.len()
    }

    /// Record `[offset, offset + len)` unless it overlaps a neighbour.
    pub(crate) fn insert(&mut self, offset: u64, len: u64) -> FsResult<u64> {
        let end = offset.saturating_add(len);

        let floor = self.by_start.range(..=offset).next_back();
        if let Some((_, below)) = floor {
            if below.end > offset {
                return Err(FsError::LockConflict);
            }
        }
        let ceiling = self
            .by_start
            .range((Bound::Excluded(offset), Bound::Unbounded))
            .next();
        if let Some((&start, _)) = ceiling {
            if start < end {
                return Err(FsError::LockConflict);
            }
        }

        self.next_id += 1;
        let id = self.next_id;
        self.by_start.insert(offset, LockRecord { end, id });
        Ok(id)
    }

    pub(crate) fn remove(&mut self, offset: u64, id: u64) {
        if self.by_start.get(&offset).is_some_and(|r| r.id == id) {
            self.by_start.remove(&offset);
        }
    }
}

#[derive(Debug)]
struct LockState {
    inode: Weak<Inode>,
    id: u64,
    offset: u64,
    len: u64,
    valid: AtomicBool,
}

/// Handle to a granted byte-range lock.
///
/// Clones share state, so any clone may release it. Releasing twice is a no-op.
#[derive(Clone, Debug)]
pub struct FileLock {
    state: Arc<LockState>,
}

impl FileLock {
    pub(crate) fn new(inode: Weak<Inode>, id: u64, offset: u64, len: u64) -> Self {
        Self {
            state: Arc::new(LockState {
                inode,
                id,
                offset,
                len,
                valid: AtomicBool::new(true),
            }),
        }
    }

    pub fn offset(&self) -> u64 {
        self.state.offset
    }

    pub fn len(&self) -> u64 {
        self.state.len
    }

    pub fn is_empty(&self) -> bool {
        self.state.len == 0
    }

    pub fn is_valid(&self) -> bool {
        self.state.valid.load(Ordering::Acquire)
    }

    /// Whether this lock's range intersects `[offset, offset + len)`.
    pub fn overlaps(&self, offset: u64, len: u64) -> bool {
        let end = self.state.offset.saturating_add(self.state.len);
        offset < end && self.state.offset < offset.saturating_add(len)
    }

    pub fn release(&self) {
        match self.state.inode.upgrade() {
            Some(inode) => inode.release_lock(self),
            None => {
                self.invalidate();
            }
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.state.id
    }

    /// Flip to invalid. Returns `true` only for the caller that did the flip.
    pub(crate) fn invalidate(&self) -> bool {
        self.state.valid.swap(false, Ordering::AcqRel)
    }
}
