//! Path traversal over the entry tree
//!
//! A walk starts at a root directory and takes one lock per element, top
//! down, keeping every lock until the whole operation is done. Locks live on
//! a [`LockStack`] and are dropped newest first. Two-path operations put both
//! walks on the same stack, in the order given by [`Endpoint::order`].

use std::cmp::Ordering;
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;

use lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;
use tracing::trace;

use crate::config::CaseSensitivity;
use crate::entry::{Entry, EntryKind, EntryRef};
use crate::error::{FsError, FsResult};
use crate::vfs::FsShared;
use crate::path::{push_element, FsPath};
use crate::types::FsId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LockMode {
    Read,
    Write,
}

enum Guard {
    Read(ArcRwLockReadGuard<RawRwLock, Entry>),
    Write(ArcRwLockWriteGuard<RawRwLock, Entry>),
}

impl Guard {
    fn lock(&self) -> &EntryRef {
        match self {
            Guard::Read(g) => ArcRwLockReadGuard::rwlock(g),
            Guard::Write(g) => ArcRwLockWriteGuard::rwlock(g),
        }
    }

    fn mode(&self) -> LockMode {
        match self {
            Guard::Read(_) => LockMode::Read,
            Guard::Write(_) => LockMode::Write,
        }
    }
}

impl Deref for Guard {
    type Target = Entry;

    fn deref(&self) -> &Entry {
        match self {
            Guard::Read(g) => g,
            Guard::Write(g) => g,
        }
    }
}

/// Entry locks held by one operation, released in reverse acquisition order.
///
/// An entry is locked at most once per stack: asking again for an entry that
/// is already held returns the existing slot, so a second walk can pass
/// through directories the first walk locked.
#[derive(Default)]
pub(crate) struct LockStack {
    held: Vec<Guard>,
}

impl LockStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.held.len()
    }

    fn find(&self, entry: &EntryRef) -> Option<usize> {
        self.held.iter().position(|g| Arc::ptr_eq(g.lock(), entry))
    }

    pub fn holds(&self, entry: &EntryRef) -> bool {
        self.find(entry).is_some()
    }

    pub fn acquire(&mut self, entry: &EntryRef, mode: LockMode) -> FsResult<usize> {
        if let Some(slot) = self.find(entry) {
            // an upgrade would wait on our own read lock
            if mode == LockMode::Write && self.held[slot].mode() == LockMode::Read {
                return Err(FsError::InvalidArgument);
            }
            return Ok(slot);
        }
        let guard = match mode {
            LockMode::Read => Guard::Read(entry.read_arc()),
            LockMode::Write => Guard::Write(entry.write_arc()),
        };
        self.held.push(guard);
        Ok(self.held.len() - 1)
    }

    pub fn get(&self, slot: usize) -> &Entry {
        &self.held[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> FsResult<&mut Entry> {
        match &mut self.held[slot] {
            Guard::Write(g) => Ok(&mut **g),
            Guard::Read(_) => Err(FsError::InvalidArgument),
        }
    }

    pub fn entry(&self, slot: usize) -> EntryRef {
        Arc::clone(self.held[slot].lock())
    }

    pub fn release_to(&mut self, depth: usize) {
        while self.held.len() > depth {
            self.held.pop();
        }
    }
}

impl Drop for LockStack {
    fn drop(&mut self) {
        self.release_to(0);
    }
}

/// What a walk leaves locked at its end
#[derive(Clone, Copy, Debug)]
pub(crate) enum Target {
    /// The entry the path names, in `mode`. `follow` decides whether a final
    /// symbolic link is resolved or locked itself.
    Entry { mode: LockMode, follow: bool },
    /// The directory containing the last element, write-locked. The last
    /// element itself is not looked up.
    Parent,
}

/// Outcome of a walk
#[derive(Debug)]
pub(crate) struct Resolved {
    /// Stack slot of the locked entry, or of the parent for [`Target::Parent`]
    pub slot: usize,
    /// The path actually walked, free of symbolic links up to the target and
    /// spelled the way the names are stored. For [`Target::Parent`] the last
    /// element is the caller's.
    pub path: FsPath,
}

impl Resolved {
    /// Last element of the walked path. Always present for [`Target::Parent`].
    pub fn name(&self) -> FsResult<&str> {
        self.path.file_name().ok_or(FsError::InvalidArgument)
    }
}

impl FsShared {
    /// Walk `path`, leaving the locks `target` asks for on `stack`.
    ///
    /// Intermediate symbolic links are followed when `follow_links` is set;
    /// otherwise meeting one fails with [`FsError::NotADirectory`]. Locks taken
    /// by this call are released before it returns an error.
    pub(crate) fn walk(
        &self,
        stack: &mut LockStack,
        path: &FsPath,
        target: Target,
        follow_links: bool,
    ) -> FsResult<Resolved> {
        let base = stack.depth();
        let result = self.walk_inner(stack, path, target, follow_links);
        if result.is_err() {
            stack.release_to(base);
        }
        result
    }

    fn walk_inner(
        &self,
        stack: &mut LockStack,
        path: &FsPath,
        target: Target,
        follow_links: bool,
    ) -> FsResult<Resolved> {
        let collation = self.collation();
        let base = stack.depth();
        let mut root = path.root();
        let mut elements = path.elements().to_vec();
        let mut seen: HashSet<*const _> = HashSet::new();

        'restart: loop {
            stack.release_to(base);
            let count = elements.len();
            let (stop, final_mode) = match target {
                Target::Entry { mode, .. } => (count, mode),
                Target::Parent if count == 0 => return Err(FsError::InvalidArgument),
                Target::Parent => (count - 1, LockMode::Write),
            };
            let mode_at = |depth: usize| {
                if depth == stop {
                    final_mode
                } else {
                    LockMode::Read
                }
            };

            let root_dir = self.root_dir(root)?;
            let mut slot = stack.acquire(&root_dir, mode_at(0))?;
            // names as stored, which may differ in case from the ones asked for
            let mut walked = Vec::with_capacity(count);

            for depth in 1..=stop {
                let name = &elements[depth - 1];
                let (child, stored) = stack
                    .get(slot)
                    .as_dir()?
                    .get(name, collation)
                    .map(|c| (Arc::clone(&c.entry), c.name.clone()))
                    .ok_or(FsError::NotFound)?;
                let child_slot = stack.acquire(&child, mode_at(depth))?;

                if let EntryKind::Symlink { target: link } = stack.get(child_slot).kind() {
                    let is_final = matches!(target, Target::Entry { .. }) && depth == count;
                    let follow = match target {
                        Target::Entry { follow, .. } if is_final => follow,
                        _ => follow_links,
                    };
                    if follow {
                        if !seen.insert(Arc::as_ptr(&child)) {
                            return Err(FsError::LinkLoop);
                        }
                        let link = link.clone();
                        trace!(link = %link, "following symbolic link");
                        let (next_root, next) =
                            self.splice_link(&link, root, &walked, &elements[depth..])?;
                        root = next_root;
                        elements = next;
                        continue 'restart;
                    }
                    if !is_final {
                        return Err(FsError::NotADirectory);
                    }
                }
                walked.push(stored);
                slot = child_slot;
            }

            if matches!(target, Target::Parent) {
                stack.get(slot).as_dir()?;
                walked.push(elements[count - 1].clone());
            }
            let path = FsPath::from_parts(root, &self.config.roots[root], walked);
            return Ok(Resolved { slot, path });
        }
    }

    /// Elements to walk after meeting a link: its target, resolved against the
    /// link's directory when relative, followed by what was left of the path.
    fn splice_link(
        &self,
        link: &str,
        root: usize,
        dir: &[String],
        rest: &[String],
    ) -> FsResult<(usize, Vec<String>)> {
        let parsed = FsPath::parse(link, &self.config.roots, self.collation())?;
        let (root, mut elements) = if parsed.is_absolute() {
            (parsed.root(), parsed.elements().to_vec())
        } else {
            let mut elements = dir.to_vec();
            for part in link.split(['/', '\\']) {
                push_element(&mut elements, part)?;
            }
            (root, elements)
        };
        elements.extend(rest.iter().cloned());
        Ok((root, elements))
    }

    /// Where a link at `link_path` with target `target` points, without
    /// looking at the tree.
    pub(crate) fn link_destination(&self, link_path: &FsPath, target: &str) -> FsResult<FsPath> {
        let elements = link_path.elements();
        let dir = &elements[..elements.len().saturating_sub(1)];
        let (root, elements) = self.splice_link(target, link_path.root(), dir, &[])?;
        Ok(FsPath::from_parts(root, &self.config.roots[root], elements))
    }

    /// Resolve the directory that holds `path`'s last element, following links,
    /// and describe it as an endpoint of a two-path operation.
    pub(crate) fn endpoint(&self, path: &FsPath) -> FsResult<Endpoint> {
        let name = path.file_name().ok_or(FsError::InvalidArgument)?.to_string();
        let parent = path.parent().ok_or(FsError::InvalidArgument)?;
        let mut stack = LockStack::new();
        let resolved = self.walk(
            &mut stack,
            &parent,
            Target::Entry {
                mode: LockMode::Read,
                follow: true,
            },
            true,
        )?;
        stack.get(resolved.slot).as_dir()?;
        Ok(Endpoint {
            fs: self.id,
            parent: resolved.path,
            name,
        })
    }

    /// Write-lock an endpoint's parent. The parent path is already canonical,
    /// so no links are followed on the way.
    pub(crate) fn lock_endpoint(&self, stack: &mut LockStack, endpoint: &Endpoint) -> FsResult<usize> {
        let resolved = self.walk(
            stack,
            &endpoint.parent,
            Target::Entry {
                mode: LockMode::Write,
                follow: false,
            },
            false,
        )?;
        stack.get(resolved.slot).as_dir()?;
        Ok(resolved.slot)
    }
}

/// One side of a two-path operation: a canonical parent directory and a name in it
#[derive(Clone, Debug)]
pub(crate) struct Endpoint {
    pub fs: FsId,
    pub parent: FsPath,
    pub name: String,
}

impl Endpoint {
    /// Total order used to pick which parent to lock first: instance identity,
    /// then root, then parent elements (an ancestor before its descendants),
    /// then the name.
    pub fn order(&self, other: &Endpoint, collation: CaseSensitivity) -> Ordering {
        self.fs
            .cmp(&other.fs)
            .then_with(|| self.parent.root().cmp(&other.parent.root()))
            .then_with(|| compare_elements(self.parent.elements(), other.parent.elements(), collation))
            .then_with(|| collation.compare(&self.name, &other.name))
    }

    pub fn path(&self) -> FsPath {
        let mut elements = self.parent.elements().to_vec();
        elements.push(self.name.clone());
        self.parent.with_elements(elements)
    }
}

fn compare_elements(a: &[String], b: &[String], collation: CaseSensitivity) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        match collation.compare(x, y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}
