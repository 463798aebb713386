//! aarch64 host: native `svc #0` convention.
//!
//! x0 carries both the first argument and the return value; exit stops take
//! their arguments from the thread's cached entry stop.

use super::{sysno, CompatMode, Registers, SyscallAbi, SyscallInfo};
use crate::config::types::{ptrace_error, Result};
use crate::kernel::ptrace::memory::TraceeMemory;
use nix::errno::Errno;
use nix::unistd::Pid;

const NT_PRSTATUS: libc::c_int = 1;

pub struct NativeAbi;

static NATIVE: NativeAbi = NativeAbi;

impl SyscallAbi for NativeAbi {
    fn mode(&self) -> CompatMode {
        CompatMode::Aarch64
    }

    fn decode(&self, regs: &Registers) -> SyscallInfo {
        SyscallInfo {
            mode: CompatMode::Aarch64,
            number: sysno::from_aarch64(regs.regs[8]),
            raw: regs.regs[8],
            args: [
                regs.regs[0],
                regs.regs[1],
                regs.regs[2],
                regs.regs[3],
                regs.regs[4],
                regs.regs[5],
            ],
            retval: regs.regs[0] as i64,
        }
    }
}

pub fn strategy(_mode: CompatMode) -> &'static dyn SyscallAbi {
    &NATIVE
}

pub fn read_registers(pid: Pid) -> Result<Registers> {
    // SAFETY: the register file is plain integers; all-zero is a valid value.
    let mut regs: Registers = unsafe { std::mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: &mut regs as *mut Registers as *mut libc::c_void,
        iov_len: std::mem::size_of::<Registers>(),
    };
    // SAFETY: the iovec describes `regs`, which outlives the call.
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw(),
            NT_PRSTATUS as *mut libc::c_void,
            &mut iov as *mut libc::iovec as *mut libc::c_void,
        )
    };
    Errno::result(rc)
        .map(|_| regs)
        .map_err(|e| ptrace_error("PTRACE_GETREGSET", pid, e))
}

/// Only one convention exists for aarch64 tracees.
pub fn detect_mode(_mem: &dyn TraceeMemory, _pid: Pid, _regs: &Registers) -> Result<CompatMode> {
    Ok(CompatMode::Aarch64)
}
