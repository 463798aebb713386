/// Inherited descriptor hygiene for the tracee.
///
/// Runs in the forked child right before exec: every descriptor above the
/// stdio triple is marked close-on-exec so the traced program starts with
/// exactly stdin, stdout and stderr.
/// - Prefer close_range(CLOSE_RANGE_CLOEXEC)
/// - Fallback to iterating /proc/self/fd
use crate::config::types::{Result, TraceError};
use std::fs;

/// Mark every descriptor >= 3 close-on-exec.
pub fn mark_inherited_fds_cloexec() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if try_close_range_cloexec() {
            return Ok(());
        }
    }

    mark_fds_via_proc()
}

/// close_range(3, ~0, CLOSE_RANGE_CLOEXEC), Linux 5.11+
#[cfg(target_os = "linux")]
fn try_close_range_cloexec() -> bool {
    use std::os::raw::c_int;

    const CLOSE_RANGE_CLOEXEC: c_int = 1 << 2;

    // SAFETY: close_range takes integers only; unsupported kernels fail with ENOSYS.
    let result = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            3 as libc::c_uint,
            !0 as libc::c_uint,
            CLOSE_RANGE_CLOEXEC,
        )
    };

    result == 0
}

fn mark_fds_via_proc() -> Result<()> {
    let mut failed = Vec::new();

    for fd in open_fds()? {
        if fd <= 2 {
            continue;
        }
        // SAFETY: fcntl on an integer descriptor; a closed one fails with EBADF.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            // The directory handle used to list /proc/self/fd is already gone.
            continue;
        }
        // SAFETY: as above; only the descriptor flags change.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
            failed.push((fd, std::io::Error::last_os_error()));
        }
    }

    if !failed.is_empty() {
        let detail = failed
            .iter()
            .map(|(fd, err)| format!("fd {}: {}", fd, err))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(TraceError::Spawn(format!(
            "Failed to mark {} FD(s) close-on-exec: {}",
            failed.len(),
            detail
        )));
    }

    Ok(())
}

/// Descriptors currently open in this process, ascending.
pub fn open_fds() -> Result<Vec<i32>> {
    let fd_dir = "/proc/self/fd";

    let entries = fs::read_dir(fd_dir)
        .map_err(|e| TraceError::Spawn(format!("Failed to read {}: {}", fd_dir, e)))?;

    let mut fds: Vec<i32> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.parse::<i32>().ok())
        .collect();

    fds.sort_unstable();
    Ok(fds)
}
