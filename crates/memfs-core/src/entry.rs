//! Tree nodes: directories, files and symbolic links
//!
//! Every node sits behind its own reader/writer lock. A node's state is only
//! ever read or changed through that node's guard; no node looks inside
//! another node to answer a question about itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::config::CaseSensitivity;
use crate::error::{FsError, FsResult};
use crate::inode::Inode;
use crate::types::{Attributes, FileTimes, FileType, SetTimes};

pub(crate) type EntryRef = Arc<RwLock<Entry>>;

/// Lifecycle of a File entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpenState {
    /// Reachable, with this many open handles
    Live(u32),
    /// Unlinked from its directory; no new opens
    PendingDeletion,
}

pub(crate) struct FileNode {
    pub inode: Arc<Inode>,
    pub state: OpenState,
    /// Set by a handle opened with delete-on-close; acted on at the last close
    pub delete_on_close: bool,
}

impl FileNode {
    pub fn open(&mut self) -> FsResult<u32> {
        match self.state {
            OpenState::Live(n) => {
                self.state = OpenState::Live(n + 1);
                Ok(n + 1)
            }
            OpenState::PendingDeletion => Err(FsError::NotFound),
        }
    }

    /// Returns the handles still open afterwards.
    pub fn close(&mut self) -> u32 {
        match self.state {
            OpenState::Live(n) => {
                let left = n.saturating_sub(1);
                self.state = OpenState::Live(left);
                left
            }
            OpenState::PendingDeletion => 0,
        }
    }

    pub fn open_count(&self) -> u32 {
        match self.state {
            OpenState::Live(n) => n,
            OpenState::PendingDeletion => 0,
        }
    }

    /// Refuse while handles are open, otherwise mark the file unlinked.
    pub fn mark_deleted(&mut self) -> FsResult<()> {
        match self.state {
            OpenState::Live(0) => {
                self.state = OpenState::PendingDeletion;
                self.inode.remove_link();
                Ok(())
            }
            OpenState::Live(_) => Err(FsError::StillOpen),
            OpenState::PendingDeletion => Err(FsError::NotFound),
        }
    }
}

/// One name in a directory. The kind is fixed for an entry's lifetime, so it
/// is cached here to list a directory without locking its children.
#[derive(Clone)]
pub(crate) struct Child {
    pub name: String,
    pub file_type: FileType,
    pub entry: EntryRef,
}

#[derive(Default)]
pub(crate) struct DirectoryNode {
    children: HashMap<String, Child>,
}

impl DirectoryNode {
    pub fn get(&self, name: &str, collation: CaseSensitivity) -> Option<&Child> {
        self.children.get(collation.key(name).as_ref())
    }

    /// Add `child` under its own name. Fails without touching the map if the
    /// name is taken.
    pub fn insert(&mut self, child: Child, collation: CaseSensitivity) -> FsResult<()> {
        let key = collation.key(&child.name).into_owned();
        if self.children.contains_key(&key) {
            return Err(FsError::AlreadyExists);
        }
        self.children.insert(key, child);
        Ok(())
    }

    pub fn remove(&mut self, name: &str, collation: CaseSensitivity) -> Option<Child> {
        self.children.remove(collation.key(name).as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn children(&self) -> impl Iterator<Item = &Child> {
        self.children.values()
    }
}

pub(crate) enum EntryKind {
    Directory(DirectoryNode),
    File(FileNode),
    Symlink { target: String },
}

/// Ownership metadata captured at creation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Ownership {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

pub(crate) struct Entry {
    times: FileTimes,
    owner: Ownership,
    kind: EntryKind,
}

impl Entry {
    fn new(now: SystemTime, owner: Ownership, kind: EntryKind) -> EntryRef {
        Arc::new(RwLock::new(Entry {
            times: FileTimes::at(now),
            owner,
            kind,
        }))
    }

    pub fn directory(now: SystemTime, owner: Ownership) -> EntryRef {
        Self::new(now, owner, EntryKind::Directory(DirectoryNode::default()))
    }

    pub fn file(now: SystemTime, owner: Ownership, inode: Arc<Inode>) -> EntryRef {
        let node = FileNode {
            inode,
            state: OpenState::Live(0),
            delete_on_close: false,
        };
        Self::new(now, owner, EntryKind::File(node))
    }

    pub fn symlink(now: SystemTime, owner: Ownership, target: &str) -> EntryRef {
        let kind = EntryKind::Symlink {
            target: target.to_string(),
        };
        Self::new(now, owner, kind)
    }

    pub fn times(&self) -> FileTimes {
        self.times
    }

    pub fn owner(&self) -> Ownership {
        self.owner
    }

    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    pub fn file_type(&self) -> FileType {
        match self.kind {
            EntryKind::Directory(_) => FileType::Directory,
            EntryKind::File(_) => FileType::File,
            EntryKind::Symlink { .. } => FileType::Symlink,
        }
    }

    pub fn as_dir(&self) -> FsResult<&DirectoryNode> {
        match &self.kind {
            EntryKind::Directory(dir) => Ok(dir),
            _ => Err(FsError::NotADirectory),
        }
    }

    pub fn as_dir_mut(&mut self) -> FsResult<&mut DirectoryNode> {
        match &mut self.kind {
            EntryKind::Directory(dir) => Ok(dir),
            _ => Err(FsError::NotADirectory),
        }
    }

    pub fn as_file(&self) -> FsResult<&FileNode> {
        match &self.kind {
            EntryKind::File(file) => Ok(file),
            EntryKind::Directory(_) => Err(FsError::IsADirectory),
            EntryKind::Symlink { .. } => Err(FsError::InvalidArgument),
        }
    }

    pub fn as_file_mut(&mut self) -> FsResult<&mut FileNode> {
        match &mut self.kind {
            EntryKind::File(file) => Ok(file),
            EntryKind::Directory(_) => Err(FsError::IsADirectory),
            EntryKind::Symlink { .. } => Err(FsError::InvalidArgument),
        }
    }

    pub fn symlink_target(&self) -> Option<&str> {
        match &self.kind {
            EntryKind::Symlink { target } => Some(target),
            _ => None,
        }
    }

    pub fn touch_modified(&mut self, now: SystemTime) {
        self.times.modified = now;
        self.times.accessed = now;
    }

    pub fn touch_accessed(&mut self, now: SystemTime) {
        self.times.accessed = now;
    }

    pub fn set_times(&mut self, times: SetTimes) {
        if let Some(created) = times.created {
            self.times.created = created;
        }
        if let Some(modified) = times.modified {
            self.times.modified = modified;
        }
        if let Some(accessed) = times.accessed {
            self.times.accessed = accessed;
        }
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.owner.mode = mode;
    }

    pub fn set_owner(&mut self, uid: u32, gid: u32) {
        self.owner.uid = uid;
        self.owner.gid = gid;
    }

    /// Overwrite stored times and ownership with another entry's.
    pub fn copy_metadata_from(&mut self, times: FileTimes, owner: Ownership) {
        self.times = times;
        self.owner = owner;
    }

    pub fn attributes(&self) -> Attributes {
        let (size, nlink, inode) = match &self.kind {
            EntryKind::File(file) => (
                file.inode.size(),
                file.inode.link_count(),
                Some(file.inode.id()),
            ),
            EntryKind::Directory(dir) => (dir.len() as u64, 1, None),
            EntryKind::Symlink { target } => (target.len() as u64, 1, None),
        };
        Attributes {
            file_type: self.file_type(),
            size,
            times: self.times,
            mode: self.owner.mode,
            uid: self.owner.uid,
            gid: self.owner.gid,
            nlink,
            inode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::MAX_BLOCKS;

    const OWNER: Ownership = Ownership {
        mode: 0o644,
        uid: 1,
        gid: 2,
    };

    fn child(name: &str) -> Child {
        Child {
            name: name.to_string(),
            file_type: FileType::Directory,
            entry: Entry::directory(SystemTime::now(), OWNER),
        }
    }

    #[test]
    fn test_directory_rejects_duplicate_names() {
        let mut dir = DirectoryNode::default();
        dir.insert(child("a"), CaseSensitivity::Sensitive).unwrap();
        let err = dir.insert(child("a"), CaseSensitivity::Sensitive).unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists));
        assert_eq!(dir.len(), 1);

        dir.insert(child("A"), CaseSensitivity::Sensitive).unwrap();
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn test_directory_case_insensitive_lookup() {
        let c = CaseSensitivity::InsensitivePreserving;
        let mut dir = DirectoryNode::default();
        dir.insert(child("ReadMe"), c).unwrap();
        assert!(dir.insert(child("README"), c).is_err());
        assert_eq!(dir.get("readme", c).unwrap().name, "ReadMe");
        assert!(dir.remove("README", c).is_some());
        assert!(dir.is_empty());
    }

    #[test]
    fn test_open_state_transitions() {
        let mut file = FileNode {
            inode: Arc::new(Inode::new(MAX_BLOCKS)),
            state: OpenState::Live(0),
            delete_on_close: false,
        };
        assert_eq!(file.open().unwrap(), 1);
        assert_eq!(file.open().unwrap(), 2);
        assert!(matches!(file.mark_deleted(), Err(FsError::StillOpen)));
        assert_eq!(file.close(), 1);
        assert_eq!(file.close(), 0);

        file.mark_deleted().unwrap();
        assert_eq!(file.state, OpenState::PendingDeletion);
        assert!(matches!(file.open(), Err(FsError::NotFound)));
        assert_eq!(file.inode.link_count(), 0);
    }

    #[test]
    fn test_attributes_follow_kind() {
        let now = SystemTime::now();
        let inode = Arc::new(Inode::new(MAX_BLOCKS));
        inode.write(b"12345", 0).unwrap();
        let file = Entry::file(now, OWNER, inode);
        let attrs = file.read().attributes();
        assert!(attrs.is_file());
        assert_eq!(attrs.size, 5);
        assert_eq!(attrs.uid, 1);
        assert_eq!(attrs.times.created, now);

        let link = Entry::symlink(now, OWNER, "/target");
        let attrs = link.read().attributes();
        assert!(attrs.is_symlink());
        assert_eq!(attrs.size, 7);
        assert!(attrs.inode.is_none());
    }
}
