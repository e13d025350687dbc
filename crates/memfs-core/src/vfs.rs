//! In-memory file system instance

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::config::{CaseSensitivity, FsConfig};
use crate::entry::{Child, Entry, EntryKind, EntryRef, Ownership};
use crate::error::{FsError, FsResult};
use crate::handle::FileHandle;
use crate::inode::{Inode, InodeId};
use crate::path::FsPath;
use crate::tree::{Endpoint, LockMode, LockStack, Target};
use crate::types::{
    Attributes, CopyOptions, CreateContext, DirEntry, FileType, FsId, OpenOptions, SetTimes,
};

static NEXT_FS_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by a file system and every handle opened on it
pub(crate) struct FsShared {
    pub(crate) id: FsId,
    pub(crate) config: FsConfig,
    roots: Vec<EntryRef>,
    /// Held for writing for the whole of every two-path operation
    ordering: RwLock<()>,
    open_handles: AtomicU32,
}

impl FsShared {
    pub(crate) fn collation(&self) -> CaseSensitivity {
        self.config.case_sensitivity
    }

    pub(crate) fn now(&self) -> SystemTime {
        self.config.timestamp_resolution.now()
    }

    pub(crate) fn root_dir(&self, root: usize) -> FsResult<EntryRef> {
        self.roots.get(root).cloned().ok_or(FsError::NotFound)
    }

    pub(crate) fn parse(&self, path: &str) -> FsResult<FsPath> {
        FsPath::parse(path, &self.config.roots, self.collation())
    }

    fn ownership(&self, ctx: &CreateContext, file_type: FileType) -> Ownership {
        let defaults = &self.config.defaults;
        let mode = match file_type {
            FileType::Directory => defaults.dir_mode,
            FileType::File => defaults.file_mode,
            FileType::Symlink => 0o777,
        };
        Ownership {
            mode: ctx.mode.unwrap_or(mode),
            uid: ctx.uid.unwrap_or(defaults.uid),
            gid: ctx.gid.unwrap_or(defaults.gid),
        }
    }

    fn reserve_handle(&self) -> FsResult<HandleSlot<'_>> {
        let max = self.config.limits.max_open_handles;
        self.open_handles
            .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|_| FsError::TooManyOpenFiles)?;
        Ok(HandleSlot {
            fs: self,
            committed: false,
        })
    }

    pub(crate) fn release_handle(&self) {
        let _ = self
            .open_handles
            .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |n| {
                n.checked_sub(1)
            });
    }

    /// Unlink the entry at `path`. With `expected`, only that exact entry is
    /// removed; anything else found at the path is left alone.
    pub(crate) fn delete_entry(&self, path: &FsPath, expected: Option<&EntryRef>) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::InvalidArgument);
        }
        let collation = self.collation();
        let mut stack = LockStack::new();
        let parent = self.walk(&mut stack, path, Target::Parent, true)?;
        let name = parent.name()?;
        let child = stack
            .get(parent.slot)
            .as_dir()?
            .get(name, collation)
            .map(|c| Arc::clone(&c.entry))
            .ok_or(FsError::NotFound)?;
        if expected.is_some_and(|e| !Arc::ptr_eq(e, &child)) {
            return Err(FsError::NotFound);
        }

        let slot = stack.acquire(&child, LockMode::Write)?;
        check_removable(stack.get(slot))?;
        if let Ok(file) = stack.get_mut(slot)?.as_file_mut() {
            file.mark_deleted()?;
        }

        let now = self.now();
        let dir = stack.get_mut(parent.slot)?;
        dir.as_dir_mut()?.remove(name, collation);
        dir.touch_modified(now);
        debug!(fs = self.id.0, path = %parent.path, "deleted");
        Ok(())
    }
}

/// An open-handle reservation, returned to the pool unless committed
struct HandleSlot<'a> {
    fs: &'a FsShared,
    committed: bool,
}

impl HandleSlot<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for HandleSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.fs.release_handle();
        }
    }
}

/// A directory must be empty and a file closed before it leaves its parent.
fn check_removable(entry: &Entry) -> FsResult<()> {
    match entry.kind() {
        EntryKind::Directory(dir) if !dir.is_empty() => Err(FsError::DirectoryNotEmpty),
        EntryKind::File(file) if file.open_count() > 0 => Err(FsError::StillOpen),
        _ => Ok(()),
    }
}

#[derive(Clone, Copy, Debug)]
enum TwoPath {
    Copy(CopyOptions),
    Move(CopyOptions),
    Link,
}

impl TwoPath {
    fn replace_existing(&self) -> bool {
        match self {
            TwoPath::Copy(o) | TwoPath::Move(o) => o.replace_existing,
            TwoPath::Link => false,
        }
    }
}

/// A concurrent in-memory file system.
///
/// Cloning is cheap and yields another handle to the same tree.
#[derive(Clone)]
pub struct MemoryFileSystem {
    shared: Arc<FsShared>,
}

impl fmt::Debug for MemoryFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryFileSystem")
            .field("id", &self.shared.id)
            .field("roots", &self.shared.config.roots)
            .finish()
    }
}

impl MemoryFileSystem {
    pub fn new(config: FsConfig) -> FsResult<Self> {
        if config.roots.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        let collation = config.case_sensitivity;
        let mut names = HashSet::new();
        for root in &config.roots {
            if root.is_empty() || !names.insert(collation.key(root).into_owned()) {
                return Err(FsError::InvalidName);
            }
        }

        let id = FsId(NEXT_FS_ID.fetch_add(1, AtomicOrdering::Relaxed));
        let now = config.timestamp_resolution.now();
        let owner = Ownership {
            mode: config.defaults.dir_mode,
            uid: config.defaults.uid,
            gid: config.defaults.gid,
        };
        let roots = config
            .roots
            .iter()
            .map(|_| Entry::directory(now, owner))
            .collect();
        debug!(fs = id.0, roots = ?config.roots, "created memory file system");

        Ok(Self {
            shared: Arc::new(FsShared {
                id,
                config,
                roots,
                ordering: RwLock::new(()),
                open_handles: AtomicU32::new(0),
            }),
        })
    }

    pub fn id(&self) -> FsId {
        self.shared.id
    }

    pub fn config(&self) -> &FsConfig {
        &self.shared.config
    }

    pub fn roots(&self) -> Vec<FsPath> {
        self.shared
            .config
            .roots
            .iter()
            .enumerate()
            .map(|(ordinal, name)| FsPath::from_parts(ordinal, name, Vec::new()))
            .collect()
    }

    /// Parse `path` with this file system's roots and collation.
    pub fn path(&self, path: &str) -> FsResult<FsPath> {
        self.shared.parse(path)
    }

    /// Handles currently open across the whole file system.
    pub fn open_handle_count(&self) -> u32 {
        self.shared.open_handles.load(AtomicOrdering::Acquire)
    }

    // Creation

    pub fn create_directory(&self, path: &str) -> FsResult<()> {
        self.create_directory_with(path, &CreateContext::default())
    }

    pub fn create_directory_with(&self, path: &str, ctx: &CreateContext) -> FsResult<()> {
        let shared = &self.shared;
        let owner = shared.ownership(ctx, FileType::Directory);
        let created = self.create_entry(path, |name, now| Child {
            name: name.to_string(),
            file_type: FileType::Directory,
            entry: Entry::directory(now, owner),
        })?;
        debug!(fs = shared.id.0, path = %created, "created directory");
        Ok(())
    }

    /// Create an empty file. Fails if anything already exists at `path`.
    pub fn create_file(&self, path: &str) -> FsResult<()> {
        self.create_file_with(path, &CreateContext::default())
    }

    pub fn create_file_with(&self, path: &str, ctx: &CreateContext) -> FsResult<()> {
        let shared = &self.shared;
        let owner = shared.ownership(ctx, FileType::File);
        let created = self.create_entry(path, |name, now| {
            let inode = Arc::new(Inode::new(shared.config.limits.max_file_blocks));
            Child {
                name: name.to_string(),
                file_type: FileType::File,
                entry: Entry::file(now, owner, inode),
            }
        })?;
        debug!(fs = shared.id.0, path = %created, "created file");
        Ok(())
    }

    /// Create a symbolic link at `link` pointing at `target`. The target is
    /// stored as given and resolved on every traversal.
    pub fn create_symlink(&self, link: &str, target: &str) -> FsResult<()> {
        self.shared.parse(target)?;
        let shared = &self.shared;
        let owner = shared.ownership(&CreateContext::default(), FileType::Symlink);
        let created = self.create_entry(link, |name, now| Child {
            name: name.to_string(),
            file_type: FileType::Symlink,
            entry: Entry::symlink(now, owner, target),
        })?;
        debug!(fs = shared.id.0, path = %created, target, "created symbolic link");
        Ok(())
    }

    /// Add `link` as a second name for the file at `existing`. Both names
    /// share contents; metadata stays per name.
    pub fn create_hard_link(&self, link: &str, existing: &str) -> FsResult<()> {
        let source = self.path(existing)?;
        let target = self.path(link)?;
        two_path(&self.shared, &source, &self.shared, &target, TwoPath::Link)
    }

    fn create_entry<F>(&self, path: &str, build: F) -> FsResult<FsPath>
    where
        F: FnOnce(&str, SystemTime) -> Child,
    {
        let path = self.path(path)?;
        if path.is_root() {
            return Err(FsError::AlreadyExists);
        }
        let mut stack = LockStack::new();
        let parent = self.shared.walk(&mut stack, &path, Target::Parent, true)?;
        let name = parent.name()?;
        let now = self.shared.now();
        let child = build(name, now);

        let dir = stack.get_mut(parent.slot)?;
        dir.as_dir_mut()?.insert(child, self.shared.collation())?;
        dir.touch_modified(now);
        Ok(parent.path)
    }

    // Deletion

    /// Remove the entry at `path`. A final symbolic link is removed itself,
    /// not its target.
    pub fn delete(&self, path: &str) -> FsResult<()> {
        let path = self.path(path)?;
        self.shared.delete_entry(&path, None)
    }

    // Copy and move

    /// Copy the entry at `source` to `target`. Directories are copied without
    /// their contents.
    pub fn copy(&self, source: &str, target: &str, options: CopyOptions) -> FsResult<()> {
        let source = self.path(source)?;
        let target = self.path(target)?;
        two_path(&self.shared, &source, &self.shared, &target, TwoPath::Copy(options))
    }

    pub fn move_entry(&self, source: &str, target: &str, options: CopyOptions) -> FsResult<()> {
        let source = self.path(source)?;
        let target = self.path(target)?;
        two_path(&self.shared, &source, &self.shared, &target, TwoPath::Move(options))
    }

    /// Copy `source` in this file system to `target` in `other`.
    pub fn copy_to(
        &self,
        source: &str,
        other: &MemoryFileSystem,
        target: &str,
        options: CopyOptions,
    ) -> FsResult<()> {
        let source = self.path(source)?;
        let target = other.path(target)?;
        two_path(&self.shared, &source, &other.shared, &target, TwoPath::Copy(options))
    }

    /// Move `source` in this file system to `target` in `other`. Between two
    /// instances the contents are copied and the source is then unlinked, so
    /// an open file or a non-empty directory cannot be moved.
    pub fn move_to(
        &self,
        source: &str,
        other: &MemoryFileSystem,
        target: &str,
        options: CopyOptions,
    ) -> FsResult<()> {
        let source = self.path(source)?;
        let target = other.path(target)?;
        two_path(&self.shared, &source, &other.shared, &target, TwoPath::Move(options))
    }

    // Queries

    pub fn metadata(&self, path: &str) -> FsResult<Attributes> {
        self.inspect(path, true, |entry| Ok(entry.attributes()))
    }

    /// Like [`metadata`](Self::metadata), without following a final link.
    pub fn symlink_metadata(&self, path: &str) -> FsResult<Attributes> {
        self.inspect(path, false, |entry| Ok(entry.attributes()))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.metadata(path).is_ok()
    }

    /// List a directory, sorted by name.
    pub fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let collation = self.shared.collation();
        self.inspect(path, true, |entry| {
            let mut entries: Vec<DirEntry> = entry
                .as_dir()?
                .children()
                .map(|c| DirEntry {
                    name: c.name.clone(),
                    file_type: c.file_type,
                })
                .collect();
            entries.sort_by(|a, b| {
                collation
                    .compare(&a.name, &b.name)
                    .then_with(|| a.name.cmp(&b.name))
            });
            Ok(entries)
        })
    }

    pub fn read_link(&self, path: &str) -> FsResult<String> {
        self.inspect(path, false, |entry| {
            entry
                .symlink_target()
                .map(str::to_string)
                .ok_or(FsError::NotASymlink)
        })
    }

    /// The absolute path of the entry `path` names, with every link resolved.
    pub fn canonicalize(&self, path: &str) -> FsResult<FsPath> {
        let path = self.path(path)?;
        let mut stack = LockStack::new();
        let resolved = self.shared.walk(
            &mut stack,
            &path,
            Target::Entry {
                mode: LockMode::Read,
                follow: true,
            },
            true,
        )?;
        Ok(resolved.path)
    }

    /// Whether both paths reach the same entry or share file contents.
    pub fn is_same_file(&self, a: &str, b: &str) -> FsResult<bool> {
        let (first, first_inode) = self.identity(a)?;
        let (second, second_inode) = self.identity(b)?;
        Ok(Arc::ptr_eq(&first, &second) || (first_inode.is_some() && first_inode == second_inode))
    }

    fn identity(&self, path: &str) -> FsResult<(EntryRef, Option<InodeId>)> {
        let path = self.path(path)?;
        let mut stack = LockStack::new();
        let resolved = self.shared.walk(
            &mut stack,
            &path,
            Target::Entry {
                mode: LockMode::Read,
                follow: true,
            },
            true,
        )?;
        let inode = stack
            .get(resolved.slot)
            .as_file()
            .ok()
            .map(|f| f.inode.id());
        Ok((stack.entry(resolved.slot), inode))
    }

    fn inspect<T, F>(&self, path: &str, follow: bool, f: F) -> FsResult<T>
    where
        F: FnOnce(&Entry) -> FsResult<T>,
    {
        let path = self.path(path)?;
        let mut stack = LockStack::new();
        let resolved = self.shared.walk(
            &mut stack,
            &path,
            Target::Entry {
                mode: LockMode::Read,
                follow,
            },
            true,
        )?;
        f(stack.get(resolved.slot))
    }

    // Attribute changes

    pub fn set_times(&self, path: &str, times: SetTimes) -> FsResult<()> {
        let resolution = self.shared.config.timestamp_resolution;
        let times = SetTimes {
            created: times.created.map(|t| resolution.truncate(t)),
            modified: times.modified.map(|t| resolution.truncate(t)),
            accessed: times.accessed.map(|t| resolution.truncate(t)),
        };
        self.modify(path, true, |entry, _| {
            entry.set_times(times);
            Ok(())
        })
    }

    pub fn set_permissions(&self, path: &str, mode: u32) -> FsResult<()> {
        self.modify(path, true, |entry, _| {
            entry.set_mode(mode);
            Ok(())
        })
    }

    pub fn set_owner(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        self.modify(path, true, |entry, _| {
            entry.set_owner(uid, gid);
            Ok(())
        })
    }

    /// Shrink the file at `path` to `size` bytes. Never grows it.
    pub fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        self.modify(path, true, |entry, now| {
            entry.as_file()?.inode.truncate(size);
            entry.touch_modified(now);
            Ok(())
        })
    }

    fn modify<T, F>(&self, path: &str, follow: bool, f: F) -> FsResult<T>
    where
        F: FnOnce(&mut Entry, SystemTime) -> FsResult<T>,
    {
        let path = self.path(path)?;
        let mut stack = LockStack::new();
        let resolved = self.shared.walk(
            &mut stack,
            &path,
            Target::Entry {
                mode: LockMode::Write,
                follow,
            },
            true,
        )?;
        let now = self.shared.now();
        f(stack.get_mut(resolved.slot)?, now)
    }

    // Contents

    pub fn read_all(&self, path: &str) -> FsResult<Vec<u8>> {
        let mut handle = self.open(path, &OpenOptions::read())?;
        let mut contents = Vec::new();
        handle.read_to_end(&mut contents)?;
        handle.close()?;
        Ok(contents)
    }

    /// Replace the contents of the file at `path`, creating it if needed.
    pub fn write_all(&self, path: &str, contents: &[u8]) -> FsResult<()> {
        let mut handle = self.open(path, &OpenOptions::create().truncate(true))?;
        Write::write_all(&mut handle, contents)?;
        handle.close()
    }

    pub fn open(&self, path: &str, options: &OpenOptions) -> FsResult<FileHandle> {
        if options.creates() && !options.write {
            return Err(FsError::InvalidArgument);
        }
        if options.append && options.truncate {
            return Err(FsError::InvalidArgument);
        }
        let path = self.path(path)?;
        let mut seen = HashSet::new();
        self.open_path(&path, options, &mut seen)
    }

    fn open_path(
        &self,
        path: &FsPath,
        options: &OpenOptions,
        seen: &mut HashSet<*const RwLock<Entry>>,
    ) -> FsResult<FileHandle> {
        let shared = &self.shared;
        let collation = shared.collation();
        let reservation = shared.reserve_handle()?;
        let mut stack = LockStack::new();

        let (slot, resolved_path) = if options.creates() {
            let parent = shared.walk(&mut stack, path, Target::Parent, true)?;
            let name = parent.name()?;
            let existing = stack
                .get(parent.slot)
                .as_dir()?
                .get(name, collation)
                .map(|c| Arc::clone(&c.entry));
            match existing {
                Some(_) if options.create_new => return Err(FsError::AlreadyExists),
                Some(entry) => {
                    let slot = stack.acquire(&entry, LockMode::Write)?;
                    if let Some(link) = stack.get(slot).symlink_target() {
                        // create through the link: open whatever it points at
                        if !seen.insert(Arc::as_ptr(&entry)) {
                            return Err(FsError::LinkLoop);
                        }
                        let destination = shared.link_destination(&parent.path, link)?;
                        drop(stack);
                        drop(reservation);
                        trace!(link = %parent.path, to = %destination, "opening through link");
                        return self.open_path(&destination, options, seen);
                    }
                    (slot, parent.path)
                }
                None => {
                    let now = shared.now();
                    let owner = shared.ownership(&CreateContext::default(), FileType::File);
                    let inode = Arc::new(Inode::new(shared.config.limits.max_file_blocks));
                    let entry = Entry::file(now, owner, inode);
                    let child = Child {
                        name: name.to_string(),
                        file_type: FileType::File,
                        entry: Arc::clone(&entry),
                    };
                    let dir = stack.get_mut(parent.slot)?;
                    dir.as_dir_mut()?.insert(child, collation)?;
                    dir.touch_modified(now);
                    debug!(fs = shared.id.0, path = %parent.path, "created file");
                    (stack.acquire(&entry, LockMode::Write)?, parent.path)
                }
            }
        } else {
            let resolved = shared.walk(
                &mut stack,
                path,
                Target::Entry {
                    mode: LockMode::Write,
                    follow: true,
                },
                true,
            )?;
            (resolved.slot, resolved.path)
        };

        let now = shared.now();
        let entry = stack.get_mut(slot)?;
        let file = entry.as_file_mut()?;
        file.open()?;
        if options.delete_on_close {
            file.delete_on_close = true;
        }
        let inode = Arc::clone(&file.inode);
        if options.truncate && options.write {
            inode.truncate(0);
            entry.touch_modified(now);
        }
        let entry = stack.entry(slot);
        drop(stack);

        reservation.commit();
        trace!(fs = shared.id.0, path = %resolved_path, "opened");
        Ok(FileHandle::new(
            Arc::downgrade(shared),
            entry,
            inode,
            resolved_path,
            *options,
            shared.config.timestamp_resolution,
        ))
    }
}

/// Copy, move or link between two endpoints, possibly on two instances.
///
/// Both ordering guards are taken first (lower instance id first), then both
/// parents are write-locked in endpoint order on one lock stack. Every
/// precondition is checked before the first directory is changed.
fn two_path(
    source_fs: &FsShared,
    source: &FsPath,
    target_fs: &FsShared,
    target: &FsPath,
    op: TwoPath,
) -> FsResult<()> {
    let same_fs = source_fs.id == target_fs.id;
    if !same_fs && matches!(op, TwoPath::Link) {
        return Err(FsError::CrossDevice);
    }

    let _guards = if same_fs {
        (source_fs.ordering.write(), None)
    } else if source_fs.id < target_fs.id {
        (source_fs.ordering.write(), Some(target_fs.ordering.write()))
    } else {
        (target_fs.ordering.write(), Some(source_fs.ordering.write()))
    };

    let src = source_fs.endpoint(source)?;
    let dst = target_fs.endpoint(target)?;
    let collation = source_fs.collation();
    if same_fs
        && matches!(op, TwoPath::Move(_))
        && dst.parent.starts_with(&src.path(), collation)
    {
        return Err(FsError::InvalidArgument);
    }

    let mut stack = LockStack::new();
    let (src_slot, dst_slot) = if src.order(&dst, collation) != Ordering::Greater {
        let s = source_fs.lock_endpoint(&mut stack, &src)?;
        let d = target_fs.lock_endpoint(&mut stack, &dst)?;
        (s, d)
    } else {
        let d = target_fs.lock_endpoint(&mut stack, &dst)?;
        let s = source_fs.lock_endpoint(&mut stack, &src)?;
        (s, d)
    };

    apply_two_path(
        source_fs, target_fs, &mut stack, (src_slot, &src), (dst_slot, &dst), op,
    )?;
    debug!(
        source = %src.path(),
        target = %dst.path(),
        op = ?op,
        "two-path operation done"
    );
    Ok(())
}

fn apply_two_path(
    source_fs: &FsShared,
    target_fs: &FsShared,
    stack: &mut LockStack,
    (src_slot, src): (usize, &Endpoint),
    (dst_slot, dst): (usize, &Endpoint),
    op: TwoPath,
) -> FsResult<()> {
    let src_collation = source_fs.collation();
    let dst_collation = target_fs.collation();
    let same_fs = source_fs.id == target_fs.id;

    let source = stack
        .get(src_slot)
        .as_dir()?
        .get(&src.name, src_collation)
        .cloned()
        .ok_or(FsError::NotFound)?;
    let existing = stack
        .get(dst_slot)
        .as_dir()?
        .get(&dst.name, dst_collation)
        .cloned();

    if let Some(existing) = &existing {
        if Arc::ptr_eq(&existing.entry, &source.entry) {
            if matches!(op, TwoPath::Move(_)) && existing.name != dst.name {
                // same entry under another spelling: only the stored name changes
                let dir = stack.get_mut(dst_slot)?.as_dir_mut()?;
                if let Some(mut child) = dir.remove(&src.name, src_collation) {
                    child.name = dst.name.clone();
                    dir.insert(child, dst_collation)?;
                }
            }
            return Ok(());
        }
    }

    if let TwoPath::Link = op {
        match source.file_type {
            FileType::File => {}
            FileType::Directory => return Err(FsError::IsADirectory),
            FileType::Symlink => return Err(FsError::InvalidArgument),
        }
    }

    let replaced = match &existing {
        None => None,
        Some(_) if !op.replace_existing() => return Err(FsError::AlreadyExists),
        // held as an ancestor of one of the parents, so it has children
        Some(e) if stack.holds(&e.entry) => return Err(FsError::DirectoryNotEmpty),
        Some(e) => {
            let slot = stack.acquire(&e.entry, LockMode::Write)?;
            check_removable(stack.get(slot))?;
            Some(slot)
        }
    };

    let now = target_fs.now();
    let (child, source_slot) = match op {
        TwoPath::Copy(options) => {
            let slot = stack.acquire(&source.entry, LockMode::Read)?;
            let entry = duplicate(target_fs, stack.get(slot), now, options.copy_attributes);
            (child_of(&dst.name, source.file_type, entry), None)
        }
        TwoPath::Link => {
            let slot = stack.acquire(&source.entry, LockMode::Read)?;
            let original = stack.get(slot);
            let inode = Arc::clone(&original.as_file()?.inode);
            let entry = Entry::file(now, original.owner(), inode);
            (child_of(&dst.name, FileType::File, entry), Some(slot))
        }
        TwoPath::Move(_) if same_fs => {
            let slot = stack.acquire(&source.entry, LockMode::Write)?;
            let child = Child {
                name: dst.name.clone(),
                ..source.clone()
            };
            (child, Some(slot))
        }
        TwoPath::Move(_) => {
            let slot = stack.acquire(&source.entry, LockMode::Write)?;
            check_removable(stack.get(slot))?;
            let entry = duplicate(target_fs, stack.get(slot), now, true);
            (child_of(&dst.name, source.file_type, entry), Some(slot))
        }
    };

    // nothing below can fail on a precondition
    if let Some(slot) = replaced {
        if let Ok(file) = stack.get_mut(slot)?.as_file_mut() {
            file.mark_deleted()?;
        }
        stack
            .get_mut(dst_slot)?
            .as_dir_mut()?
            .remove(&dst.name, dst_collation);
    }

    match (op, source_slot) {
        (TwoPath::Move(_), Some(slot)) => {
            let dir = stack.get_mut(src_slot)?;
            dir.as_dir_mut()?.remove(&src.name, src_collation);
            dir.touch_modified(source_fs.now());
            if !same_fs {
                if let Ok(file) = stack.get_mut(slot)?.as_file_mut() {
                    file.mark_deleted()?;
                }
            }
        }
        (TwoPath::Link, Some(slot)) => stack.get(slot).as_file()?.inode.add_link(),
        _ => {}
    }

    let dir = stack.get_mut(dst_slot)?;
    dir.as_dir_mut()?.insert(child, dst_collation)?;
    dir.touch_modified(now);
    Ok(())
}

fn child_of(name: &str, file_type: FileType, entry: EntryRef) -> Child {
    Child {
        name: name.to_string(),
        file_type,
        entry,
    }
}

/// Fresh entry on `fs` with `source`'s kind. Files get their own copy of the
/// contents; directories come out empty.
fn duplicate(
    fs: &FsShared,
    source: &Entry,
    now: SystemTime,
    keep_attributes: bool,
) -> EntryRef {
    let owner = if keep_attributes {
        source.owner()
    } else {
        fs.ownership(&CreateContext::default(), source.file_type())
    };
    let entry = match source.kind() {
        EntryKind::Directory(_) => Entry::directory(now, owner),
        EntryKind::File(file) => Entry::file(now, owner, Arc::new(file.inode.duplicate())),
        EntryKind::Symlink { target } => Entry::symlink(now, owner, target),
    };
    if keep_attributes {
        entry.write().copy_metadata_from(source.times(), owner);
    }
    entry
}
