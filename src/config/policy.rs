/// Policy and spawn descriptor types consumed by a trace session
use crate::config::types::{Result, TraceError};
use crate::kernel::abi::sysno;
use crate::utils::path;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Duration;

/// Resource ceilings, applied per process or across the whole tree
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Limit {
    /// Live threads
    pub threads: u64,
    /// Resident memory in bytes
    pub memory: u64,
    /// Kernel-mode CPU time
    pub sys_time: Duration,
    /// User-mode CPU time
    pub user_time: Duration,
    /// Descriptors held at once
    pub open_files: u64,
    /// Cumulative bytes read
    pub io_read: u64,
    /// Cumulative bytes written
    pub io_write: u64,
}

impl Limit {
    pub fn unlimited() -> Self {
        Self {
            threads: u64::MAX,
            memory: u64::MAX,
            sys_time: Duration::MAX,
            user_time: Duration::MAX,
            open_files: u64::MAX,
            io_read: u64::MAX,
            io_write: u64::MAX,
        }
    }
}

impl Default for Limit {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// How an access entry compares open flags
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Observed flags must equal the entry's flags
    #[default]
    Match,
    /// Observed flags must be a subset of the entry's flags
    Contains,
}

/// One permitted path with its open-flag rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AccessEntry {
    pub path: String,
    #[serde(deserialize_with = "deserialize_flags")]
    pub flags: i64,
    #[serde(default)]
    pub mode: AccessMode,
}

impl AccessEntry {
    pub fn new(path: impl Into<String>, flags: i64, mode: AccessMode) -> Self {
        Self {
            path: path.into(),
            flags,
            mode,
        }
    }

    pub fn permits_flags(&self, observed: i64) -> bool {
        match self.mode {
            AccessMode::Match => self.flags == observed,
            AccessMode::Contains => self.flags == (observed | self.flags),
        }
    }
}

/// Ordered set of access rules
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct AccessList {
    entries: Vec<AccessEntry>,
}

impl AccessList {
    pub fn new(entries: Vec<AccessEntry>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, entry: AccessEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[AccessEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact path match, used for the file list.
    pub fn permits_file(&self, file: &str, flags: i64) -> bool {
        self.entries
            .iter()
            .any(|e| e.path == file && e.permits_flags(flags))
    }

    /// Containment match, used for the directory list.
    pub fn permits_under(&self, file: &str, flags: i64) -> bool {
        self.entries
            .iter()
            .any(|e| path::contains(&e.path, file) && e.permits_flags(flags))
    }
}

/// Allow-set over the canonical syscall-number space
#[derive(Clone, PartialEq, Eq)]
pub struct SyscallSet {
    words: [u64; sysno::CANONICAL_MAX / 64],
}

impl SyscallSet {
    pub fn empty() -> Self {
        Self {
            words: [0; sysno::CANONICAL_MAX / 64],
        }
    }

    pub fn all() -> Self {
        Self {
            words: [u64::MAX; sysno::CANONICAL_MAX / 64],
        }
    }

    pub fn allow(&mut self, number: usize) -> &mut Self {
        if number < sysno::CANONICAL_MAX {
            self.words[number / 64] |= 1 << (number % 64);
        }
        self
    }

    pub fn deny(&mut self, number: usize) -> &mut Self {
        if number < sysno::CANONICAL_MAX {
            self.words[number / 64] &= !(1 << (number % 64));
        }
        self
    }

    pub fn allow_name(&mut self, name: &str) -> Result<&mut Self> {
        let number = sysno::number_of(name)
            .ok_or_else(|| TraceError::Config(format!("unknown syscall name: {}", name)))?;
        Ok(self.allow(number))
    }

    /// Numbers outside `[0, CANONICAL_MAX)` are never contained.
    pub fn contains(&self, number: i64) -> bool {
        if number < 0 || number >= sysno::CANONICAL_MAX as i64 {
            return false;
        }
        let n = number as usize;
        self.words[n / 64] & (1 << (n % 64)) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..sysno::CANONICAL_MAX).filter(move |&n| self.contains(n as i64))
    }
}

impl Default for SyscallSet {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for SyscallSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum SyscallRef {
    Number(usize),
    Name(String),
}

impl Serialize for SyscallSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let refs: Vec<SyscallRef> = self
            .iter()
            .map(|n| match sysno::name_of(n) {
                Some(name) => SyscallRef::Name(name.to_string()),
                None => SyscallRef::Number(n),
            })
            .collect();
        refs.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SyscallSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let refs = Vec::<SyscallRef>::deserialize(deserializer)?;
        let mut set = SyscallSet::empty();
        for r in refs {
            match r {
                SyscallRef::Number(n) if n < sysno::CANONICAL_MAX => {
                    set.allow(n);
                }
                SyscallRef::Number(n) => {
                    return Err(serde::de::Error::custom(format!(
                        "syscall number {} outside canonical range",
                        n
                    )))
                }
                SyscallRef::Name(name) => {
                    set.allow_name(&name).map_err(serde::de::Error::custom)?;
                }
            }
        }
        Ok(set)
    }
}

/// When open-family calls are validated
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TriggerMode {
    /// Before the kernel runs the call; new descriptors use a placeholder until return
    OnEntry,
    /// After the call returned successfully
    #[default]
    OnExit,
}

/// Checker variants, in the order a policy registers them
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CheckerKind {
    Syscall,
    File,
    Fork,
    Io,
    Resource,
}

impl CheckerKind {
    pub fn standard_order() -> Vec<CheckerKind> {
        vec![
            CheckerKind::Syscall,
            CheckerKind::File,
            CheckerKind::Fork,
            CheckerKind::Io,
            CheckerKind::Resource,
        ]
    }
}

/// Immutable policy for one trace session
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Policy {
    /// Ceilings summed across the whole process tree
    pub limit: Limit,
    /// Ceilings for any single process
    pub per_process: Limit,
    /// Live processes, root included
    pub nprocess: u64,
    /// Exactly matched file paths
    pub files: AccessList,
    /// Directory prefixes
    pub directories: AccessList,
    pub calls: SyscallSet,
    pub trigger: TriggerMode,
    pub checkers: Vec<CheckerKind>,
}

impl Default for Policy {
    /// Permissive profile: every ceiling unlimited, every path and syscall allowed
    fn default() -> Self {
        Self {
            limit: Limit::unlimited(),
            per_process: Limit::unlimited(),
            nprocess: u64::MAX,
            files: AccessList::default(),
            directories: AccessList::new(vec![AccessEntry::new("/", -1, AccessMode::Contains)]),
            calls: SyscallSet::all(),
            trigger: TriggerMode::OnExit,
            checkers: CheckerKind::standard_order(),
        }
    }
}

/// Spawn descriptor for the root tracee
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    /// Executable, searched in PATH when it has no slash
    pub path: PathBuf,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Working directory, absolute, as seen after `root` is applied
    pub cwd: PathBuf,
    /// chroot target
    pub root: Option<PathBuf>,
    /// Descriptors installed as the tracee's stdin, stdout and stderr
    pub stdio: [RawFd; 3],
    /// Identity to switch to before exec
    pub uid: Option<u32>,
}

impl Entry {
    pub fn new(path: impl Into<PathBuf>, argv: Vec<String>) -> Self {
        Self {
            path: path.into(),
            argv,
            env: Vec::new(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            root: None,
            stdio: [0, 1, 2],
            uid: None,
        }
    }
}

const OPEN_FLAG_NAMES: &[(&str, libc::c_int)] = &[
    ("O_RDONLY", libc::O_RDONLY),
    ("O_WRONLY", libc::O_WRONLY),
    ("O_RDWR", libc::O_RDWR),
    ("O_CREAT", libc::O_CREAT),
    ("O_EXCL", libc::O_EXCL),
    ("O_NOCTTY", libc::O_NOCTTY),
    ("O_TRUNC", libc::O_TRUNC),
    ("O_APPEND", libc::O_APPEND),
    ("O_NONBLOCK", libc::O_NONBLOCK),
    ("O_NDELAY", libc::O_NDELAY),
    ("O_DSYNC", libc::O_DSYNC),
    ("O_SYNC", libc::O_SYNC),
    ("O_RSYNC", libc::O_RSYNC),
    ("O_ASYNC", libc::O_ASYNC),
    ("O_DIRECT", libc::O_DIRECT),
    ("O_LARGEFILE", libc::O_LARGEFILE),
    ("O_DIRECTORY", libc::O_DIRECTORY),
    ("O_NOFOLLOW", libc::O_NOFOLLOW),
    ("O_NOATIME", libc::O_NOATIME),
    ("O_CLOEXEC", libc::O_CLOEXEC),
    ("O_PATH", libc::O_PATH),
    ("O_TMPFILE", libc::O_TMPFILE),
];

/// Parse `"O_RDONLY+O_CLOEXEC"`-style flag expressions. Numeric terms
/// (decimal or `0x` hex) are accepted alongside names.
pub fn parse_open_flags(expr: &str) -> Result<i64> {
    let mut flags: i64 = 0;
    for term in expr.split('+').map(str::trim) {
        if term.is_empty() {
            return Err(TraceError::Config(format!("empty term in flags '{}'", expr)));
        }
        if let Some(&(_, bits)) = OPEN_FLAG_NAMES.iter().find(|(name, _)| *name == term) {
            flags |= bits as i64;
            continue;
        }
        let parsed = match term.strip_prefix("0x") {
            Some(hex) => i64::from_str_radix(hex, 16),
            None => term.parse::<i64>(),
        };
        flags |= parsed
            .map_err(|_| TraceError::Config(format!("unknown open flag '{}'", term)))?;
    }
    Ok(flags)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlagsRepr {
    Bits(i64),
    Names(String),
}

fn deserialize_flags<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    match FlagsRepr::deserialize(deserializer)? {
        FlagsRepr::Bits(bits) => Ok(bits),
        FlagsRepr::Names(expr) => parse_open_flags(&expr).map_err(serde::de::Error::custom),
    }
}
