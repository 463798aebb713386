//! Filesystem access policy and descriptor bookkeeping.
//!
//! Opens are validated against the file list (exact path) and the directory
//! list (containment) at the configured trigger point. Under `OnEntry` the new
//! descriptor is unknown, so the record is filed under a per-thread
//! placeholder and renumbered (or dropped) when the call returns.

use super::{at_trigger, thread_of, thread_of_mut, undecided, CheckContext};
use crate::config::policy::{AccessList, Policy, TriggerMode};
use crate::config::types::{Result, TraceStatus, Verdict, Violation};
use crate::core::process::ThreadNode;
use crate::core::trap::{CallState, Trap};
use crate::kernel::abi::{sysno, SyscallInfo};
use crate::kernel::ptrace::memory::{TraceeMemory, PATH_MAX};
use crate::utils::path;
use nix::unistd::Pid;

/// Descriptor an entry-checked open is filed under until it returns.
/// Negative so it never collides with a real descriptor.
pub fn placeholder_fd(tid: Pid) -> i32 {
    -tid.as_raw()
}

struct OpenRequest {
    dirfd: i32,
    path_addr: u64,
    flags: i64,
}

fn open_request(memory: &dyn TraceeMemory, tid: Pid, call: &SyscallInfo) -> Result<OpenRequest> {
    Ok(match call.number {
        sysno::OPEN => OpenRequest {
            dirfd: libc::AT_FDCWD,
            path_addr: call.arg(0),
            flags: call.arg_int(1) as i64,
        },
        sysno::CREAT => OpenRequest {
            dirfd: libc::AT_FDCWD,
            path_addr: call.arg(0),
            flags: (libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC) as i64,
        },
        // struct open_how { u64 flags; u64 mode; u64 resolve; }
        sysno::OPENAT2 => OpenRequest {
            dirfd: call.arg_int(0),
            path_addr: call.arg(1),
            flags: memory.read_u64(tid, call.arg(2))? as i64,
        },
        _ => OpenRequest {
            dirfd: call.arg_int(0),
            path_addr: call.arg(1),
            flags: call.arg_int(2) as i64,
        },
    })
}

/// Absolute form of `raw` as `thread` sees it, or None when it is relative to
/// a descriptor we never saw opened.
fn resolve(thread: &ThreadNode, dirfd: i32, raw: &str) -> Option<String> {
    if raw.starts_with('/') {
        return Some(path::abs(raw));
    }
    let base = if dirfd == libc::AT_FDCWD {
        thread.cwd.get()
    } else {
        thread.files.path_of(dirfd)?
    };
    Some(path::resolve(&base, raw))
}

#[derive(Debug)]
pub struct FileChecker {
    files: AccessList,
    directories: AccessList,
    trigger: TriggerMode,
    open_files: u64,
    verdict: Option<Verdict>,
}

impl Default for FileChecker {
    fn default() -> Self {
        Self {
            files: AccessList::default(),
            directories: AccessList::default(),
            trigger: TriggerMode::default(),
            open_files: u64::MAX,
            verdict: None,
        }
    }
}

impl FileChecker {
    pub fn setup(&mut self, policy: &Policy) {
        self.files = policy.files.clone();
        self.directories = policy.directories.clone();
        self.trigger = policy.trigger;
        self.open_files = policy.per_process.open_files;
        self.verdict = None;
    }

    pub fn check(&mut self, ctx: &mut CheckContext<'_>, trap: &Trap) -> Result<bool> {
        let Some((call, state)) = trap.syscall() else {
            return Ok(true);
        };
        match call.number {
            sysno::OPEN | sysno::OPENAT | sysno::CREAT | sysno::OPENAT2 => {
                self.check_open(ctx, trap.tid, call, state)
            }
            sysno::CHDIR => self.check_chdir(ctx, trap.tid, call, state),
            _ if state == CallState::CallOut && call.retval >= 0 => {
                track(ctx, trap.tid, call)?;
                Ok(true)
            }
            _ => Ok(true),
        }
    }

    pub fn result(&self, _trap: &Trap) -> Verdict {
        self.verdict.clone().unwrap_or_else(undecided)
    }

    pub fn teardown(&mut self) {
        self.verdict = None;
    }

    fn permits(&self, path: &str, flags: i64) -> bool {
        self.files.permits_file(path, flags) || self.directories.permits_under(path, flags)
    }

    fn deny(&mut self, status: TraceStatus, violation: Violation) -> bool {
        log::warn!("File access denied: {:?}", violation);
        self.verdict = Some(Verdict::new(status, violation));
        false
    }

    fn check_open(
        &mut self,
        ctx: &mut CheckContext<'_>,
        tid: Pid,
        call: &SyscallInfo,
        state: CallState,
    ) -> Result<bool> {
        if !at_trigger(self.trigger, state) {
            if state == CallState::CallOut {
                settle_placeholder(ctx, tid, call.retval)?;
            }
            return Ok(true);
        }
        // A failed open left nothing behind to account for.
        if state == CallState::CallOut && call.retval < 0 {
            return Ok(true);
        }

        let request = open_request(ctx.memory, tid, call)?;
        let raw = ctx.memory.read_cstring(tid, request.path_addr, PATH_MAX)?;
        let thread = thread_of(ctx.table, tid)?;

        let Some(resolved) = resolve(thread, request.dirfd, &raw) else {
            let path = path::join(&format!("<fd {}>", request.dirfd), &raw);
            return Ok(self.deny(
                TraceStatus::PathDeny,
                Violation::Path {
                    path,
                    flags: request.flags,
                },
            ));
        };
        if !self.permits(&resolved, request.flags) {
            return Ok(self.deny(
                TraceStatus::PathDeny,
                Violation::Path {
                    path: resolved,
                    flags: request.flags,
                },
            ));
        }

        let fd = match state {
            CallState::CallOut => call.retval as i32,
            CallState::CallIn => placeholder_fd(tid),
        };
        log::debug!("tid {} opened {} as fd {}", tid, resolved, fd);
        thread.files.open(fd, resolved, request.flags);

        let held = thread.files.held();
        if held > self.open_files {
            return Ok(self.deny(TraceStatus::FdOut, Violation::Files { held }));
        }
        Ok(true)
    }

    /// chdir is checked like a read-only open of the target directory.
    fn check_chdir(
        &mut self,
        ctx: &mut CheckContext<'_>,
        tid: Pid,
        call: &SyscallInfo,
        state: CallState,
    ) -> Result<bool> {
        let fired = at_trigger(self.trigger, state);
        let completed = state == CallState::CallOut && call.retval == 0;
        if !fired && !completed {
            return Ok(true);
        }
        if state == CallState::CallOut && call.retval != 0 {
            return Ok(true);
        }

        let raw = ctx.memory.read_cstring(tid, call.arg(0), PATH_MAX)?;
        let thread = thread_of(ctx.table, tid)?;
        let resolved = path::resolve(&thread.cwd.get(), &raw);

        let flags = libc::O_RDONLY as i64;
        if fired && !self.permits(&resolved, flags) {
            return Ok(self.deny(
                TraceStatus::PathDeny,
                Violation::Path {
                    path: resolved,
                    flags,
                },
            ));
        }
        if completed {
            thread.cwd.set(resolved);
        }
        Ok(true)
    }
}

/// Move an entry-checked open's record to the descriptor it got, or drop it.
fn settle_placeholder(ctx: &mut CheckContext<'_>, tid: Pid, retval: i64) -> Result<()> {
    let files = &thread_of(ctx.table, tid)?.files;
    let placeholder = placeholder_fd(tid);
    if retval >= 0 {
        files.renumber(placeholder, retval as i32);
    } else {
        files.discard(placeholder);
    }
    Ok(())
}

/// Descriptor-table and cwd side effects of calls that returned successfully.
fn track(ctx: &mut CheckContext<'_>, tid: Pid, call: &SyscallInfo) -> Result<()> {
    let fcntl_dup = call.number == sysno::FCNTL
        && matches!(call.arg_int(1), libc::F_DUPFD | libc::F_DUPFD_CLOEXEC);

    match call.number {
        sysno::CLOSE => {
            thread_of(ctx.table, tid)?.files.close(call.arg_int(0));
        }
        sysno::DUP | sysno::DUP2 | sysno::DUP3 | sysno::FCNTL => {
            let (old, new) = (call.arg_int(0), call.retval as i32);
            if (call.number != sysno::FCNTL || fcntl_dup) && old != new {
                thread_of(ctx.table, tid)?.files.dup(old, new);
            }
        }
        sysno::FCHDIR => {
            let thread = thread_of(ctx.table, tid)?;
            match thread.files.path_of(call.arg_int(0)) {
                Some(dir) => thread.cwd.set(dir),
                None => log::debug!("tid {} fchdir to untracked fd {}", tid, call.arg_int(0)),
            }
        }
        sysno::UNSHARE => {
            let flags = call.arg(0);
            let thread = thread_of_mut(ctx.table, tid)?;
            if flags & libc::CLONE_FILES as u64 != 0 {
                thread.files.own();
            }
            if flags & libc::CLONE_FS as u64 != 0 {
                thread.cwd.own();
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::testing::*;
    use crate::config::policy::{AccessEntry, AccessMode};
    use crate::core::process::ProcessTable;
    use crate::kernel::ptrace::memory::testing::FakeMemory;

    const PATH_ADDR: u64 = 0x10_0000;

    fn policy(dirs: &[&str], trigger: TriggerMode) -> Policy {
        let mut policy = Policy::default();
        policy.directories = AccessList::new(
            dirs.iter()
                .map(|d| AccessEntry::new(*d, -1, AccessMode::Contains))
                .collect(),
        );
        policy.trigger = trigger;
        policy
    }

    fn checker(policy: &Policy) -> FileChecker {
        let mut c = FileChecker::default();
        c.setup(policy);
        c
    }

    fn run(
        c: &mut FileChecker,
        table: &mut ProcessTable,
        memory: &FakeMemory,
        call: SyscallInfo,
        state: CallState,
    ) -> bool {
        let mut ctx = CheckContext { table, memory };
        c.check(&mut ctx, &syscall_trap(ROOT, call, state)).unwrap()
    }

    fn openat(dirfd: i32, flags: i32, retval: i64) -> SyscallInfo {
        call(
            sysno::OPENAT,
            [dirfd as i64 as u64, PATH_ADDR, flags as u64, 0, 0, 0],
            retval,
        )
    }

    fn root_files(table: &ProcessTable) -> &crate::core::handles::FileSet {
        &table.thread(pid(ROOT)).unwrap().files
    }

    #[test]
    fn denied_path_is_reported_normalized() {
        let mut c = checker(&policy(&["/usr", "/lib"], TriggerMode::OnEntry));
        let mut table = table();
        let memory = FakeMemory::new().with_cstring(PATH_ADDR, "/tmp/../tmp/./secret");

        let open = openat(libc::AT_FDCWD, libc::O_RDONLY, 0);
        assert!(!run(&mut c, &mut table, &memory, open, CallState::CallIn));

        let verdict = c.result(&syscall_trap(ROOT, openat(0, 0, 0), CallState::CallIn));
        assert_eq!(verdict.status, TraceStatus::PathDeny);
        assert_eq!(
            verdict.violation,
            Some(Violation::Path {
                path: "/tmp/secret".to_string(),
                flags: libc::O_RDONLY as i64
            })
        );
    }

    #[test]
    fn relative_open_resolves_against_cwd() {
        let mut c = checker(&policy(&["/home"], TriggerMode::OnExit));
        let mut table = table();
        let memory = FakeMemory::new().with_cstring(PATH_ADDR, "docs/../notes.txt");

        let open = openat(libc::AT_FDCWD, libc::O_RDONLY, 3);
        assert!(run(&mut c, &mut table, &memory, open, CallState::CallOut));
        assert_eq!(
            root_files(&table).path_of(3).as_deref(),
            Some("/home/user/notes.txt")
        );
        assert_eq!(root_files(&table).opened(), 1);
    }

    #[test]
    fn openat_resolves_against_directory_descriptor() {
        let mut c = checker(&policy(&["/srv"], TriggerMode::OnExit));
        let mut table = table();
        root_files(&table).open(7, "/srv/data", libc::O_DIRECTORY as i64);
        let memory = FakeMemory::new().with_cstring(PATH_ADDR, "in.txt");

        assert!(run(&mut c, &mut table, &memory, openat(7, 0, 8), CallState::CallOut));
        assert_eq!(root_files(&table).path_of(8).as_deref(), Some("/srv/data/in.txt"));

        // Unknown directory descriptor cannot be resolved
        assert!(!run(&mut c, &mut table, &memory, openat(9, 0, 10), CallState::CallOut));
        assert!(matches!(
            c.result(&syscall_trap(ROOT, openat(9, 0, 10), CallState::CallOut)).violation,
            Some(Violation::Path { ref path, .. }) if path == "<fd 9>/in.txt"
        ));
    }

    #[test]
    fn match_mode_requires_exact_flags() {
        let mut p = policy(&[], TriggerMode::OnExit);
        p.files = AccessList::new(vec![AccessEntry::new(
            "/etc/hosts",
            libc::O_RDONLY as i64,
            AccessMode::Match,
        )]);
        let mut c = checker(&p);
        let mut table = table();
        let memory = FakeMemory::new().with_cstring(PATH_ADDR, "/etc/hosts");

        let plain = openat(libc::AT_FDCWD, libc::O_RDONLY, 3);
        assert!(run(&mut c, &mut table, &memory, plain, CallState::CallOut));
        let cloexec = openat(libc::AT_FDCWD, libc::O_RDONLY | libc::O_CLOEXEC, 4);
        assert!(!run(&mut c, &mut table, &memory, cloexec, CallState::CallOut));
    }

    #[test]
    fn contains_mode_accepts_flag_subset() {
        let mut p = policy(&[], TriggerMode::OnExit);
        p.directories = AccessList::new(vec![AccessEntry::new(
            "/data",
            (libc::O_RDONLY | libc::O_CLOEXEC) as i64,
            AccessMode::Contains,
        )]);
        let mut c = checker(&p);
        let mut table = table();
        let memory = FakeMemory::new().with_cstring(PATH_ADDR, "/data/a");

        let read = openat(libc::AT_FDCWD, libc::O_CLOEXEC, 3);
        assert!(run(&mut c, &mut table, &memory, read, CallState::CallOut));
        let write = openat(libc::AT_FDCWD, libc::O_WRONLY, 4);
        assert!(!run(&mut c, &mut table, &memory, write, CallState::CallOut));
    }

    #[test]
    fn failed_open_on_exit_is_ignored() {
        let mut c = checker(&policy(&["/usr"], TriggerMode::OnExit));
        let mut table = table();
        let memory = FakeMemory::new().with_cstring(PATH_ADDR, "/etc/ld.so.preload");

        let probe = openat(libc::AT_FDCWD, 0, -(libc::ENOENT as i64));
        assert!(run(&mut c, &mut table, &memory, probe, CallState::CallOut));
        assert_eq!(root_files(&table).opened(), 0);
    }

    #[test]
    fn entry_trigger_uses_placeholder_until_return() {
        let mut c = checker(&policy(&["/"], TriggerMode::OnEntry));
        let mut table = table();
        let memory = FakeMemory::new().with_cstring(PATH_ADDR, "/etc/passwd");
        let placeholder = placeholder_fd(pid(ROOT));

        assert!(run(&mut c, &mut table, &memory, openat(libc::AT_FDCWD, 0, 0), CallState::CallIn));
        assert_eq!(root_files(&table).path_of(placeholder).as_deref(), Some("/etc/passwd"));

        assert!(run(&mut c, &mut table, &memory, openat(libc::AT_FDCWD, 0, 5), CallState::CallOut));
        assert!(root_files(&table).select(placeholder).is_none());
        assert_eq!(root_files(&table).path_of(5).as_deref(), Some("/etc/passwd"));

        // failed open: placeholder discarded, not counted
        assert!(run(&mut c, &mut table, &memory, openat(libc::AT_FDCWD, 0, 0), CallState::CallIn));
        assert!(run(&mut c, &mut table, &memory, openat(libc::AT_FDCWD, 0, -2), CallState::CallOut));
        assert!(root_files(&table).select(placeholder).is_none());
        assert_eq!(root_files(&table).opened(), 1);
        assert_eq!(root_files(&table).held(), 1);
    }

    #[test]
    fn too_many_held_descriptors_is_fdout() {
        let mut p = policy(&["/"], TriggerMode::OnExit);
        p.per_process.open_files = 1;
        let mut c = checker(&p);
        let mut table = table();
        let memory = FakeMemory::new().with_cstring(PATH_ADDR, "/x");

        assert!(run(&mut c, &mut table, &memory, openat(libc::AT_FDCWD, 0, 3), CallState::CallOut));
        assert!(!run(&mut c, &mut table, &memory, openat(libc::AT_FDCWD, 0, 4), CallState::CallOut));
        let verdict = c.result(&syscall_trap(ROOT, openat(0, 0, 0), CallState::CallOut));
        assert_eq!(verdict.status, TraceStatus::FdOut);
        assert_eq!(verdict.violation, Some(Violation::Files { held: 2 }));
    }

    #[test]
    fn close_frees_a_slot() {
        let mut p = policy(&["/"], TriggerMode::OnExit);
        p.per_process.open_files = 1;
        let mut c = checker(&p);
        let mut table = table();
        let memory = FakeMemory::new().with_cstring(PATH_ADDR, "/x");

        assert!(run(&mut c, &mut table, &memory, openat(libc::AT_FDCWD, 0, 3), CallState::CallOut));
        let close = call(sysno::CLOSE, [3, 0, 0, 0, 0, 0], 0);
        assert!(run(&mut c, &mut table, &memory, close, CallState::CallOut));
        assert!(run(&mut c, &mut table, &memory, openat(libc::AT_FDCWD, 0, 3), CallState::CallOut));
    }

    #[test]
    fn dup_family_keeps_path() {
        let mut c = checker(&Policy::default());
        let mut table = table();
        let memory = FakeMemory::new();
        root_files(&table).open(3, "/var/log/app.log", libc::O_WRONLY as i64);

        let dup2 = call(sysno::DUP2, [3, 9, 0, 0, 0, 0], 9);
        assert!(run(&mut c, &mut table, &memory, dup2, CallState::CallOut));
        let fcntl = call(
            sysno::FCNTL,
            [3, libc::F_DUPFD_CLOEXEC as u64, 10, 0, 0, 0],
            10,
        );
        assert!(run(&mut c, &mut table, &memory, fcntl, CallState::CallOut));
        let getfl = call(sysno::FCNTL, [3, libc::F_GETFL as u64, 0, 0, 0, 0], 1);
        assert!(run(&mut c, &mut table, &memory, getfl, CallState::CallOut));

        assert_eq!(root_files(&table).path_of(9).as_deref(), Some("/var/log/app.log"));
        assert_eq!(root_files(&table).path_of(10).as_deref(), Some("/var/log/app.log"));
        assert!(root_files(&table).select(1).unwrap().inherited);
    }

    #[test]
    fn chdir_and_fchdir_move_cwd() {
        let mut c = checker(&policy(&["/"], TriggerMode::OnExit));
        let mut table = table();
        let memory = FakeMemory::new().with_cstring(PATH_ADDR, "../shared");

        let chdir = call(sysno::CHDIR, [PATH_ADDR, 0, 0, 0, 0, 0], 0);
        assert!(run(&mut c, &mut table, &memory, chdir, CallState::CallOut));
        assert_eq!(table.thread(pid(ROOT)).unwrap().cwd.get(), "/home/shared");

        root_files(&table).open(4, "/opt", libc::O_DIRECTORY as i64);
        let fchdir = call(sysno::FCHDIR, [4, 0, 0, 0, 0, 0], 0);
        assert!(run(&mut c, &mut table, &memory, fchdir, CallState::CallOut));
        assert_eq!(table.thread(pid(ROOT)).unwrap().cwd.get(), "/opt");
    }

    #[test]
    fn chdir_outside_access_lists_is_denied() {
        let mut c = checker(&policy(&["/home"], TriggerMode::OnEntry));
        let mut table = table();
        let memory = FakeMemory::new().with_cstring(PATH_ADDR, "/root");
        let chdir = call(sysno::CHDIR, [PATH_ADDR, 0, 0, 0, 0, 0], 0);
        assert!(!run(&mut c, &mut table, &memory, chdir, CallState::CallIn));
    }

    #[test]
    fn unshare_files_detaches_descriptor_table() {
        let mut c = checker(&Policy::default());
        let mut table = table();
        table.attach_thread(pid(ROOT), pid(ROOT + 1)).unwrap();
        let memory = FakeMemory::new();

        let unshare = call(sysno::UNSHARE, [libc::CLONE_FILES as u64, 0, 0, 0, 0, 0], 0);
        let mut ctx = CheckContext {
            table: &mut table,
            memory: &memory,
        };
        let trap = syscall_trap(ROOT + 1, unshare, CallState::CallOut);
        assert!(c.check(&mut ctx, &trap).unwrap());

        let child = table.thread(pid(ROOT + 1)).unwrap();
        assert!(!child.files.shares_with(root_files(&table)));
        assert!(child.cwd.refcount() == 2);
    }

    #[test]
    fn openat2_flags_come_from_open_how() {
        let mut p = policy(&[], TriggerMode::OnExit);
        p.directories = AccessList::new(vec![AccessEntry::new(
            "/ro",
            libc::O_RDONLY as i64,
            AccessMode::Contains,
        )]);
        let mut c = checker(&p);
        let mut table = table();
        let how = 0x20_0000u64;
        let memory = FakeMemory::new().with_cstring(PATH_ADDR, "/ro/file");
        memory
            .write_bytes(pid(ROOT), how, &(libc::O_WRONLY as u64).to_ne_bytes())
            .unwrap();

        let open = call(
            sysno::OPENAT2,
            [libc::AT_FDCWD as i64 as u64, PATH_ADDR, how, 24, 0, 0],
            3,
        );
        assert!(!run(&mut c, &mut table, &memory, open, CallState::CallOut));
    }
}
