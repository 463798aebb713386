//! Canonical syscall-number space.
//!
//! Every decoding strategy translates into x86_64 numbering, so checkers and
//! policies only ever see one table. Calls with no canonical counterpart map
//! to [`UNMAPPED`], which lies outside the range and is therefore always denied.

/// Exclusive upper bound of the canonical space.
pub const CANONICAL_MAX: usize = 512;

/// Translation result for numbers with no canonical counterpart.
pub const UNMAPPED: i64 = CANONICAL_MAX as i64;

/// Marks a syscall issued through the x32 ABI.
pub const X32_SYSCALL_BIT: u64 = 0x4000_0000;

pub const READ: i64 = 0;
pub const WRITE: i64 = 1;
pub const OPEN: i64 = 2;
pub const CLOSE: i64 = 3;
pub const MMAP: i64 = 9;
pub const BRK: i64 = 12;
pub const PREAD64: i64 = 17;
pub const PWRITE64: i64 = 18;
pub const READV: i64 = 19;
pub const WRITEV: i64 = 20;
pub const DUP: i64 = 32;
pub const DUP2: i64 = 33;
pub const GETPID: i64 = 39;
pub const SENDTO: i64 = 44;
pub const RECVFROM: i64 = 45;
pub const SENDMSG: i64 = 46;
pub const RECVMSG: i64 = 47;
pub const CLONE: i64 = 56;
pub const FORK: i64 = 57;
pub const VFORK: i64 = 58;
pub const EXECVE: i64 = 59;
pub const EXIT: i64 = 60;
pub const FCNTL: i64 = 72;
pub const CHDIR: i64 = 80;
pub const FCHDIR: i64 = 81;
pub const CREAT: i64 = 85;
pub const EXIT_GROUP: i64 = 231;
pub const OPENAT: i64 = 257;
pub const UNSHARE: i64 = 272;
pub const DUP3: i64 = 292;
pub const PREADV: i64 = 295;
pub const PWRITEV: i64 = 296;
pub const RECVMMSG: i64 = 299;
pub const SENDMMSG: i64 = 307;
pub const EXECVEAT: i64 = 322;
pub const PREADV2: i64 = 327;
pub const PWRITEV2: i64 = 328;
pub const CLONE3: i64 = 435;
pub const OPENAT2: i64 = 437;

const NAMES_LOW: [&str; 335] = [
    "read", "write", "open", "close", "stat",
    "fstat", "lstat", "poll", "lseek", "mmap",
    "mprotect", "munmap", "brk", "rt_sigaction", "rt_sigprocmask",
    "rt_sigreturn", "ioctl", "pread64", "pwrite64", "readv",
    "writev", "access", "pipe", "select", "sched_yield",
    "mremap", "msync", "mincore", "madvise", "shmget",
    "shmat", "shmctl", "dup", "dup2", "pause",
    "nanosleep", "getitimer", "alarm", "setitimer", "getpid",
    "sendfile", "socket", "connect", "accept", "sendto",
    "recvfrom", "sendmsg", "recvmsg", "shutdown", "bind",
    "listen", "getsockname", "getpeername", "socketpair", "setsockopt",
    "getsockopt", "clone", "fork", "vfork", "execve",
    "exit", "wait4", "kill", "uname", "semget",
    "semop", "semctl", "shmdt", "msgget", "msgsnd",
    "msgrcv", "msgctl", "fcntl", "flock", "fsync",
    "fdatasync", "truncate", "ftruncate", "getdents", "getcwd",
    "chdir", "fchdir", "rename", "mkdir", "rmdir",
    "creat", "link", "unlink", "symlink", "readlink",
    "chmod", "fchmod", "chown", "fchown", "lchown",
    "umask", "gettimeofday", "getrlimit", "getrusage", "sysinfo",
    "times", "ptrace", "getuid", "syslog", "getgid",
    "setuid", "setgid", "geteuid", "getegid", "setpgid",
    "getppid", "getpgrp", "setsid", "setreuid", "setregid",
    "getgroups", "setgroups", "setresuid", "getresuid", "setresgid",
    "getresgid", "getpgid", "setfsuid", "setfsgid", "getsid",
    "capget", "capset", "rt_sigpending", "rt_sigtimedwait", "rt_sigqueueinfo",
    "rt_sigsuspend", "sigaltstack", "utime", "mknod", "uselib",
    "personality", "ustat", "statfs", "fstatfs", "sysfs",
    "getpriority", "setpriority", "sched_setparam", "sched_getparam", "sched_setscheduler",
    "sched_getscheduler", "sched_get_priority_max", "sched_get_priority_min", "sched_rr_get_interval", "mlock",
    "munlock", "mlockall", "munlockall", "vhangup", "modify_ldt",
    "pivot_root", "_sysctl", "prctl", "arch_prctl", "adjtimex",
    "setrlimit", "chroot", "sync", "acct", "settimeofday",
    "mount", "umount2", "swapon", "swapoff", "reboot",
    "sethostname", "setdomainname", "iopl", "ioperm", "create_module",
    "init_module", "delete_module", "get_kernel_syms", "query_module", "quotactl",
    "nfsservctl", "getpmsg", "putpmsg", "afs_syscall", "tuxcall",
    "security", "gettid", "readahead", "setxattr", "lsetxattr",
    "fsetxattr", "getxattr", "lgetxattr", "fgetxattr", "listxattr",
    "llistxattr", "flistxattr", "removexattr", "lremovexattr", "fremovexattr",
    "tkill", "time", "futex", "sched_setaffinity", "sched_getaffinity",
    "set_thread_area", "io_setup", "io_destroy", "io_getevents", "io_submit",
    "io_cancel", "get_thread_area", "lookup_dcookie", "epoll_create", "epoll_ctl_old",
    "epoll_wait_old", "remap_file_pages", "getdents64", "set_tid_address", "restart_syscall",
    "semtimedop", "fadvise64", "timer_create", "timer_settime", "timer_gettime",
    "timer_getoverrun", "timer_delete", "clock_settime", "clock_gettime", "clock_getres",
    "clock_nanosleep", "exit_group", "epoll_wait", "epoll_ctl", "tgkill",
    "utimes", "vserver", "mbind", "set_mempolicy", "get_mempolicy",
    "mq_open", "mq_unlink", "mq_timedsend", "mq_timedreceive", "mq_notify",
    "mq_getsetattr", "kexec_load", "waitid", "add_key", "request_key",
    "keyctl", "ioprio_set", "ioprio_get", "inotify_init", "inotify_add_watch",
    "inotify_rm_watch", "migrate_pages", "openat", "mkdirat", "mknodat",
    "fchownat", "futimesat", "newfstatat", "unlinkat", "renameat",
    "linkat", "symlinkat", "readlinkat", "fchmodat", "faccessat",
    "pselect6", "ppoll", "unshare", "set_robust_list", "get_robust_list",
    "splice", "tee", "sync_file_range", "vmsplice", "move_pages",
    "utimensat", "epoll_pwait", "signalfd", "timerfd_create", "eventfd",
    "fallocate", "timerfd_settime", "timerfd_gettime", "accept4", "signalfd4",
    "eventfd2", "epoll_create1", "dup3", "pipe2", "inotify_init1",
    "preadv", "pwritev", "rt_tgsigqueueinfo", "perf_event_open", "recvmmsg",
    "fanotify_init", "fanotify_mark", "prlimit64", "name_to_handle_at", "open_by_handle_at",
    "clock_adjtime", "syncfs", "sendmmsg", "setns", "getcpu",
    "process_vm_readv", "process_vm_writev", "kcmp", "finit_module", "sched_setattr",
    "sched_getattr", "renameat2", "seccomp", "getrandom", "memfd_create",
    "kexec_file_load", "bpf", "execveat", "userfaultfd", "membarrier",
    "mlock2", "copy_file_range", "preadv2", "pwritev2", "pkey_mprotect",
    "pkey_alloc", "pkey_free", "statx", "io_pgetevents", "rseq",
];

const HIGH_BASE: usize = 424;

const NAMES_HIGH: [&str; 39] = [
    "pidfd_send_signal", "io_uring_setup", "io_uring_enter", "io_uring_register", "open_tree",
    "move_mount", "fsopen", "fsconfig", "fsmount", "fspick",
    "pidfd_open", "clone3", "close_range", "openat2", "pidfd_getfd",
    "faccessat2", "process_madvise", "epoll_pwait2", "mount_setattr", "quotactl_fd",
    "landlock_create_ruleset", "landlock_add_rule", "landlock_restrict_self", "memfd_secret", "process_mrelease",
    "futex_waitv", "set_mempolicy_home_node", "cachestat", "fchmodat2", "map_shadow_stack",
    "futex_wake", "futex_wait", "futex_requeue", "statmount", "listmount",
    "lsm_get_self_attr", "lsm_set_self_attr", "lsm_list_modules", "mseal",
];

/// Name of a canonical number, if the number is assigned.
pub fn name_of(number: usize) -> Option<&'static str> {
    if number < NAMES_LOW.len() {
        return Some(NAMES_LOW[number]);
    }
    number
        .checked_sub(HIGH_BASE)
        .and_then(|i| NAMES_HIGH.get(i))
        .copied()
}

/// Canonical number of a syscall name.
pub fn number_of(name: &str) -> Option<usize> {
    if let Some(n) = NAMES_LOW.iter().position(|&n| n == name) {
        return Some(n);
    }
    NAMES_HIGH
        .iter()
        .position(|&n| n == name)
        .map(|i| i + HIGH_BASE)
}

/// x32-only entry points at 512..=547, each mapped to its native twin.
const X32_SPECIFIC: [i64; 36] = [
    13, 15, 16, 19, 20, 45, 46, 47, 59, 101, 127, 128, 129, 131, 222, 244, 246, 247,
    273, 274, 278, 279, 295, 296, 297, 299, 307, 310, 311, 54, 55, 206, 209, 322, 327, 328,
];

/// (i386 number, canonical number), sorted by i386 number.
const IA32_TO_CANONICAL: &[(u64, i64)] = &[
    (0, 219), (1, 60), (2, 57), (3, 0), (4, 1), (5, 2), (6, 3), (8, 85),
    (9, 86), (10, 87), (11, 59), (12, 80), (13, 201), (14, 133), (15, 90), (19, 8),
    (20, 39), (21, 165), (26, 101), (27, 37), (29, 34), (30, 132), (33, 21), (36, 162),
    (37, 62), (38, 82), (39, 83), (40, 84), (41, 32), (42, 22), (43, 100), (45, 12),
    (54, 16), (55, 72), (57, 109), (60, 95), (61, 161), (63, 33), (64, 110), (65, 111),
    (66, 112), (75, 160), (77, 98), (78, 96), (83, 88), (85, 89), (91, 11), (92, 76),
    (93, 77), (94, 91), (96, 140), (97, 141), (99, 137), (100, 138), (104, 38), (105, 36),
    (106, 4), (107, 6), (108, 5), (114, 61), (116, 99), (118, 74), (119, 15), (120, 56),
    (122, 63), (125, 10), (133, 81), (140, 8), (141, 78), (142, 23), (143, 73), (144, 26),
    (145, 19), (146, 20), (147, 124), (148, 75), (150, 149), (151, 150), (152, 151), (153, 152),
    (158, 24), (162, 35), (163, 25), (168, 7), (172, 157), (173, 15), (174, 13), (175, 14),
    (176, 127), (177, 128), (179, 130), (180, 17), (181, 18), (183, 79), (186, 131), (187, 40),
    (190, 58), (191, 97), (192, 9), (193, 76), (194, 77), (195, 4), (196, 6), (197, 5),
    (199, 102), (200, 104), (201, 107), (202, 108), (213, 105), (214, 106), (219, 28), (220, 217),
    (221, 72), (224, 186), (240, 202), (243, 205), (244, 211), (252, 231), (258, 218), (265, 228),
    (266, 229), (267, 230), (270, 234), (295, 257), (300, 262), (301, 263), (305, 267), (307, 269),
    (310, 272), (311, 273), (331, 293), (333, 295), (334, 296), (337, 299), (340, 302), (345, 307),
    (355, 318), (356, 319), (359, 41), (360, 53), (361, 49), (362, 42), (363, 50), (364, 288),
    (365, 55), (366, 54), (367, 51), (368, 52), (369, 44), (370, 46), (371, 45), (372, 47),
    (373, 48), (378, 327), (379, 328), (383, 332), (384, 158), (386, 334), (403, 228), (407, 230),
    (435, 435), (437, 437), (439, 439),
];

/// i386 multiplexer for the socket calls
pub const IA32_SOCKETCALL: u64 = 102;

/// (canonical number, argument count) per `SYS_*` socketcall selector,
/// indexed from 1. SYS_SEND and SYS_RECV are sendto/recvfrom without an
/// address.
const SOCKETCALLS: [(i64, usize); 20] = [
    (41, 3),  // socket
    (49, 3),  // bind
    (42, 3),  // connect
    (50, 2),  // listen
    (43, 3),  // accept
    (51, 3),  // getsockname
    (52, 3),  // getpeername
    (53, 4),  // socketpair
    (SENDTO, 4),
    (RECVFROM, 4),
    (SENDTO, 6),
    (RECVFROM, 6),
    (48, 2),  // shutdown
    (54, 5),  // setsockopt
    (55, 5),  // getsockopt
    (SENDMSG, 3),
    (RECVMSG, 3),
    (288, 4), // accept4
    (RECVMMSG, 5),
    (SENDMMSG, 4),
];

/// Canonical number and argument count behind a socketcall selector.
pub fn from_socketcall(selector: u64) -> Option<(i64, usize)> {
    let index = usize::try_from(selector).ok()?.checked_sub(1)?;
    SOCKETCALLS.get(index).copied()
}

/// (aarch64 number, canonical number), sorted by aarch64 number.
const AARCH64_TO_CANONICAL: &[(u64, i64)] = &[
    (17, 79), (23, 32), (24, 292), (25, 72), (29, 16), (34, 258), (35, 263), (48, 269),
    (49, 80), (50, 81), (51, 161), (56, 257), (57, 3), (59, 293), (61, 217), (62, 8),
    (63, 0), (64, 1), (65, 19), (66, 20), (67, 17), (68, 18), (69, 295), (70, 296),
    (78, 267), (79, 262), (80, 5), (93, 60), (94, 231), (95, 247), (96, 218), (97, 272),
    (98, 202), (99, 273), (101, 35), (113, 228), (114, 229), (115, 230), (124, 24), (129, 62),
    (130, 200), (131, 234), (132, 131), (134, 13), (135, 14), (139, 15), (153, 100), (160, 63),
    (163, 97), (164, 160), (165, 98), (166, 95), (167, 157), (169, 96), (172, 39), (173, 110),
    (174, 102), (175, 107), (176, 104), (177, 108), (178, 186), (179, 99), (198, 41), (199, 53),
    (200, 49), (201, 50), (202, 43), (203, 42), (204, 51), (205, 52), (206, 44), (207, 45),
    (208, 54), (209, 55), (210, 48), (211, 46), (212, 47), (214, 12), (215, 11), (216, 25),
    (220, 56), (221, 59), (222, 9), (226, 10), (227, 26), (233, 28), (242, 288), (243, 299),
    (260, 61), (261, 302), (269, 307), (278, 318), (279, 319), (281, 322), (286, 327), (287, 328),
    (291, 332), (293, 334), (435, 435), (437, 437), (439, 439),
];

fn lookup(table: &[(u64, i64)], raw: u64) -> i64 {
    match table.binary_search_by_key(&raw, |&(from, _)| from) {
        Ok(i) => table[i].1,
        Err(_) => UNMAPPED,
    }
}

/// Native x86_64 numbers are canonical already.
pub fn from_x86_64(raw: u64) -> i64 {
    raw as i64
}

pub fn from_x32(raw: u64) -> i64 {
    let n = raw & !X32_SYSCALL_BIT;
    match n {
        0..=511 => n as i64,
        512..=547 => X32_SPECIFIC[(n - 512) as usize],
        _ => UNMAPPED,
    }
}

pub fn from_ia32(raw: u64) -> i64 {
    lookup(IA32_TO_CANONICAL, raw)
}

pub fn from_aarch64(raw: u64) -> i64 {
    lookup(AARCH64_TO_CANONICAL, raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_table_matches_constants() {
        assert_eq!(name_of(READ as usize), Some("read"));
        assert_eq!(name_of(CLONE as usize), Some("clone"));
        assert_eq!(name_of(EXIT_GROUP as usize), Some("exit_group"));
        assert_eq!(name_of(OPENAT as usize), Some("openat"));
        assert_eq!(name_of(UNSHARE as usize), Some("unshare"));
        assert_eq!(name_of(PWRITEV2 as usize), Some("pwritev2"));
        assert_eq!(name_of(CLONE3 as usize), Some("clone3"));
        assert_eq!(name_of(OPENAT2 as usize), Some("openat2"));
        assert_eq!(name_of(400), None);
        assert_eq!(number_of("execveat"), Some(EXECVEAT as usize));
        assert_eq!(number_of("mseal"), Some(462));
    }

    #[test]
    fn translation_tables_are_sorted() {
        for table in [IA32_TO_CANONICAL, AARCH64_TO_CANONICAL] {
            assert!(table.windows(2).all(|w| w[0].0 < w[1].0));
            assert!(table.iter().all(|&(_, c)| (c as usize) < CANONICAL_MAX));
        }
    }

    #[test]
    fn ia32_numbers_translate() {
        assert_eq!(from_ia32(3), READ);
        assert_eq!(from_ia32(5), OPEN);
        assert_eq!(from_ia32(120), CLONE);
        assert_eq!(from_ia32(190), VFORK);
        assert_eq!(from_ia32(252), EXIT_GROUP);
        assert_eq!(from_ia32(295), OPENAT);
        assert_eq!(from_ia32(102), UNMAPPED);
    }

    #[test]
    fn socketcall_selectors_translate() {
        assert_eq!(from_socketcall(1), Some((41, 3)));
        assert_eq!(from_socketcall(10), Some((RECVFROM, 4)));
        assert_eq!(from_socketcall(20), Some((SENDMMSG, 4)));
        assert_eq!(from_socketcall(0), None);
        assert_eq!(from_socketcall(21), None);
        assert!(SOCKETCALLS.iter().all(|&(n, c)| name_of(n as usize).is_some() && c <= 6));
    }

    #[test]
    fn x32_numbers_strip_marker_bit() {
        assert_eq!(from_x32(X32_SYSCALL_BIT | 1), WRITE);
        assert_eq!(from_x32(X32_SYSCALL_BIT | 520), EXECVE);
        assert_eq!(from_x32(X32_SYSCALL_BIT | 547), PWRITEV2);
        assert_eq!(from_x32(X32_SYSCALL_BIT | 600), UNMAPPED);
    }

    #[test]
    fn aarch64_numbers_translate() {
        assert_eq!(from_aarch64(56), OPENAT);
        assert_eq!(from_aarch64(63), READ);
        assert_eq!(from_aarch64(220), CLONE);
        assert_eq!(from_aarch64(94), EXIT_GROUP);
        assert_eq!(from_aarch64(1000), UNMAPPED);
    }
}
