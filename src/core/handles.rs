//! Copy-on-write resource handles shared between traced threads.
//!
//! A [`FileSet`] or [`WorkingDir`] handle points at a reference-counted
//! backing store. Threads created with CLONE_FILES / CLONE_FS hold handles to
//! the same store and observe each other's changes, as the kernel does.
//! [`FileSet::own`] / [`WorkingDir::own`] is the only copy point: it detaches a
//! handle onto a private clone when the store has other holders.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// One tracked descriptor
#[derive(Clone, Debug, PartialEq)]
pub struct FileRecord {
    pub fd: i32,
    pub path: String,
    pub flags: i64,
    /// Cumulative bytes read through this descriptor
    pub read: u64,
    /// Cumulative bytes written through this descriptor
    pub written: u64,
    /// Present before the tracee started (stdio); not part of opened/held
    pub inherited: bool,
}

#[derive(Clone, Debug, Default)]
struct FileTable {
    files: BTreeMap<i32, FileRecord>,
    opened: u64,
    held: u64,
    total_read: u64,
    total_written: u64,
}

impl FileTable {
    fn insert(&mut self, record: FileRecord) {
        let counted = !record.inherited;
        if let Some(previous) = self.files.insert(record.fd, record) {
            if !previous.inherited {
                self.held = self.held.saturating_sub(1);
            }
        }
        if counted {
            self.held += 1;
        }
    }
}

/// Handle to a shared descriptor table
#[derive(Debug)]
pub struct FileSet {
    store: Rc<RefCell<FileTable>>,
}

impl FileSet {
    pub fn new() -> Self {
        Self {
            store: Rc::new(RefCell::new(FileTable::default())),
        }
    }

    /// Table pre-populated with the tracee's stdio triple.
    pub fn with_stdio() -> Self {
        let set = Self::new();
        for (fd, path, flags) in [
            (0, "<stdin>", libc::O_RDONLY),
            (1, "<stdout>", libc::O_WRONLY),
            (2, "<stderr>", libc::O_WRONLY),
        ] {
            set.store.borrow_mut().insert(FileRecord {
                fd,
                path: path.to_string(),
                flags: flags as i64,
                read: 0,
                written: 0,
                inherited: true,
            });
        }
        set
    }

    /// New handle on the same backing store.
    pub fn share(&self) -> FileSet {
        FileSet {
            store: Rc::clone(&self.store),
        }
    }

    /// Detach onto a private copy if anyone else holds the store.
    pub fn own(&mut self) {
        if Rc::strong_count(&self.store) > 1 {
            let copy = self.store.borrow().clone();
            self.store = Rc::new(RefCell::new(copy));
        }
    }

    /// Number of live handles on this store.
    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.store)
    }

    pub fn shares_with(&self, other: &FileSet) -> bool {
        Rc::ptr_eq(&self.store, &other.store)
    }

    /// Record a descriptor opened by the tracee.
    pub fn open(&self, fd: i32, path: impl Into<String>, flags: i64) {
        let mut table = self.store.borrow_mut();
        table.opened += 1;
        table.insert(FileRecord {
            fd,
            path: path.into(),
            flags,
            read: 0,
            written: 0,
            inherited: false,
        });
    }

    pub fn close(&self, fd: i32) -> Option<FileRecord> {
        let mut table = self.store.borrow_mut();
        let record = table.files.remove(&fd)?;
        if !record.inherited {
            table.held = table.held.saturating_sub(1);
        }
        Some(record)
    }

    /// Drop a record for an open that never completed.
    pub fn discard(&self, fd: i32) -> Option<FileRecord> {
        let record = self.close(fd)?;
        if !record.inherited {
            let mut table = self.store.borrow_mut();
            table.opened = table.opened.saturating_sub(1);
        }
        Some(record)
    }

    pub fn select(&self, fd: i32) -> Option<FileRecord> {
        self.store.borrow().files.get(&fd).cloned()
    }

    pub fn path_of(&self, fd: i32) -> Option<String> {
        self.store.borrow().files.get(&fd).map(|r| r.path.clone())
    }

    /// Copy `old`'s path and flags to `new`. Returns false if `old` is unknown.
    pub fn dup(&self, old: i32, new: i32) -> bool {
        let mut table = self.store.borrow_mut();
        let Some(source) = table.files.get(&old) else {
            return false;
        };
        let record = FileRecord {
            fd: new,
            path: source.path.clone(),
            flags: source.flags,
            read: 0,
            written: 0,
            inherited: false,
        };
        table.insert(record);
        true
    }

    /// Move the record at `from` to `to`, keeping its counters.
    pub fn renumber(&self, from: i32, to: i32) -> bool {
        let mut table = self.store.borrow_mut();
        let Some(mut record) = table.files.remove(&from) else {
            return false;
        };
        record.fd = to;
        if let Some(previous) = table.files.insert(to, record) {
            if !previous.inherited {
                table.held = table.held.saturating_sub(1);
            }
        }
        true
    }

    /// Add `bytes` read through `fd`; returns the table's new read total.
    pub fn add_read(&self, fd: i32, bytes: u64) -> u64 {
        let mut table = self.store.borrow_mut();
        if let Some(record) = table.files.get_mut(&fd) {
            record.read = record.read.saturating_add(bytes);
        }
        table.total_read = table.total_read.saturating_add(bytes);
        table.total_read
    }

    /// Add `bytes` written through `fd`; returns the table's new write total.
    pub fn add_written(&self, fd: i32, bytes: u64) -> u64 {
        let mut table = self.store.borrow_mut();
        if let Some(record) = table.files.get_mut(&fd) {
            record.written = record.written.saturating_add(bytes);
        }
        table.total_written = table.total_written.saturating_add(bytes);
        table.total_written
    }

    pub fn opened(&self) -> u64 {
        self.store.borrow().opened
    }

    pub fn held(&self) -> u64 {
        self.store.borrow().held
    }

    pub fn total_read(&self) -> u64 {
        self.store.borrow().total_read
    }

    pub fn total_written(&self) -> u64 {
        self.store.borrow().total_written
    }

    pub fn fds(&self) -> Vec<i32> {
        self.store.borrow().files.keys().copied().collect()
    }
}

impl Default for FileSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a shared current working directory
#[derive(Debug)]
pub struct WorkingDir {
    store: Rc<RefCell<String>>,
}

impl WorkingDir {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            store: Rc::new(RefCell::new(path.into())),
        }
    }

    pub fn share(&self) -> WorkingDir {
        WorkingDir {
            store: Rc::clone(&self.store),
        }
    }

    pub fn own(&mut self) {
        if Rc::strong_count(&self.store) > 1 {
            let copy = self.store.borrow().clone();
            self.store = Rc::new(RefCell::new(copy));
        }
    }

    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.store)
    }

    pub fn get(&self) -> String {
        self.store.borrow().clone()
    }

    pub fn set(&self, path: impl Into<String>) {
        *self.store.borrow_mut() = path.into();
    }
}
