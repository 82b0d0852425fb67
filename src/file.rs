//! File-object table.
//!
//! Open-style operations register a file object here and hand its id back to
//! the host framework; the id is what later operations use to reach the
//! daemon-side file handle.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::fsext::AccessMask;

/// A file the daemon has opened on the host's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileObject {
    /// Inode the file refers to.
    pub ino: u64,
    /// Daemon-side file handle from the open response.
    pub fh: u64,
    /// Whether the daemon opened it as a directory.
    pub is_dir: bool,
    /// Rights granted by the host framework.
    pub granted_access: AccessMask,
}

/// Monotonic id allocator plus the live file-object map.
pub struct FileTable {
    next_id: AtomicU64,
    map: scc::HashMap<u64, FileObject>,
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        FileTable {
            next_id: AtomicU64::new(1),
            map: scc::HashMap::new(),
        }
    }

    /// Register a file object, returning its id.
    pub fn open(&self, file: FileObject) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.map.insert_sync(id, file);
        id
    }

    /// Look up a registered file object.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<FileObject> {
        self.map.read_sync(&id, |_, file| *file)
    }

    /// Remove a file object, returning it if it was registered.
    pub fn close(&self, id: u64) -> Option<FileObject> {
        self.map.remove_sync(&id).map(|(_, file)| file)
    }

    /// Number of live file objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the table holds no file objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(ino: u64) -> FileObject {
        FileObject {
            ino,
            fh: ino * 10,
            is_dir: false,
            granted_access: AccessMask::READ_DATA,
        }
    }

    #[test]
    fn open_returns_monotonic_ids() {
        let table = FileTable::new();
        assert_eq!(table.open(file(1)), 1);
        assert_eq!(table.open(file(2)), 2);
        assert_eq!(table.open(file(3)), 3);
    }

    #[test]
    fn close_returns_the_registered_object() {
        let table = FileTable::new();
        let id = table.open(file(7));
        assert_eq!(table.get(id).map(|f| f.ino), Some(7));
        assert_eq!(table.close(id).map(|f| f.fh), Some(70));
        assert!(table.get(id).is_none());
    }
}
