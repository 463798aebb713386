//! Syscall calling conventions.
//!
//! One [`SyscallAbi`] strategy exists per architecture and compat mode. The
//! backend detects the mode once per process generation, caches it on the
//! process node and decodes every later stop with the matching strategy. All
//! strategies translate into the canonical numbering of [`sysno`].

pub mod sysno;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{detect_mode, read_registers, strategy};

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::{detect_mode, read_registers, strategy};

use crate::config::types::{Result, TraceError};
use crate::kernel::ptrace::memory::TraceeMemory;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// Register file as the tracing interface returns it
pub type Registers = libc::user_regs_struct;

/// Calling-convention variant a syscall was issued under
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompatMode {
    /// Native 64-bit `syscall`
    X86_64,
    /// 64-bit registers, 32-bit pointers, marker bit in the number
    X32,
    /// `int 0x80` / `sysenter` from 32-bit code
    Ia32,
    /// Native `svc #0`
    Aarch64,
}

impl CompatMode {
    /// Stride of `struct mmsghdr` in tracee memory.
    pub fn mmsghdr_size(self) -> u64 {
        match self {
            CompatMode::X32 | CompatMode::Ia32 => 32,
            CompatMode::X86_64 | CompatMode::Aarch64 => 64,
        }
    }

    /// Offset of `msg_len` inside `struct mmsghdr`.
    pub fn mmsghdr_len_offset(self) -> u64 {
        match self {
            CompatMode::X32 | CompatMode::Ia32 => 28,
            CompatMode::X86_64 | CompatMode::Aarch64 => 56,
        }
    }
}

/// Decoded syscall stop
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyscallInfo {
    pub mode: CompatMode,
    /// Canonical number, possibly outside the canonical range
    pub number: i64,
    /// Number as the tracee issued it
    pub raw: u64,
    pub args: [u64; 6],
    /// Meaningful on return only
    pub retval: i64,
}

impl SyscallInfo {
    pub fn arg(&self, index: usize) -> u64 {
        self.args[index]
    }

    /// Argument as a C `int` (descriptors, dirfds), sign-correct in every mode.
    pub fn arg_int(&self, index: usize) -> i32 {
        self.args[index] as u32 as i32
    }
}

/// Decoding strategy for one calling convention
pub trait SyscallAbi: Sync {
    fn mode(&self) -> CompatMode;

    fn decode(&self, regs: &Registers) -> SyscallInfo;
}

/// Rewrite an ia32 `socketcall` entry into the canonical socket call it
/// multiplexes, with the real arguments read from the tracee's argument
/// block. A block that cannot be read leaves the call unmapped.
pub fn demultiplex(mem: &dyn TraceeMemory, tid: Pid, call: &mut SyscallInfo) -> Result<()> {
    if call.mode != CompatMode::Ia32 || call.raw != sysno::IA32_SOCKETCALL {
        return Ok(());
    }
    let Some((number, nargs)) = sysno::from_socketcall(call.args[0]) else {
        return Ok(());
    };

    let block = call.args[1];
    let mut args = [0u64; 6];
    for (i, slot) in args.iter_mut().enumerate().take(nargs) {
        match mem.read_u32(tid, block.wrapping_add(4 * i as u64)) {
            Ok(word) => *slot = word as u64,
            Err(e @ TraceError::Vanished(_)) => return Err(e),
            Err(e) => {
                log::debug!("socketcall block of {} unreadable: {}", tid, e);
                return Ok(());
            }
        }
    }
    call.number = number;
    call.args = args;
    Ok(())
}
