//! x86_64 host: native, x32 and ia32 calling conventions.

use super::{sysno, CompatMode, Registers, SyscallAbi, SyscallInfo};
use crate::config::types::{ptrace_error, Result, TraceError};
use crate::kernel::ptrace::memory::TraceeMemory;
use nix::sys::ptrace;
use nix::unistd::Pid;

const USER_CS_64: u64 = 0x33;
const USER_CS_32: u64 = 0x23;

const INSN_SYSCALL: [u8; 2] = [0x0f, 0x05];
const INSN_INT80: [u8; 2] = [0xcd, 0x80];
const INSN_SYSENTER: [u8; 2] = [0x0f, 0x34];

const LOW32: u64 = 0xffff_ffff;

pub struct NativeAbi;
pub struct X32Abi;
pub struct Ia32Abi;

static NATIVE: NativeAbi = NativeAbi;
static X32: X32Abi = X32Abi;
static IA32: Ia32Abi = Ia32Abi;

impl SyscallAbi for NativeAbi {
    fn mode(&self) -> CompatMode {
        CompatMode::X86_64
    }

    fn decode(&self, regs: &Registers) -> SyscallInfo {
        SyscallInfo {
            mode: CompatMode::X86_64,
            number: sysno::from_x86_64(regs.orig_rax),
            raw: regs.orig_rax,
            args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
            retval: regs.rax as i64,
        }
    }
}

impl SyscallAbi for X32Abi {
    fn mode(&self) -> CompatMode {
        CompatMode::X32
    }

    fn decode(&self, regs: &Registers) -> SyscallInfo {
        SyscallInfo {
            mode: CompatMode::X32,
            number: sysno::from_x32(regs.orig_rax),
            raw: regs.orig_rax,
            args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
            retval: regs.rax as i64,
        }
    }
}

impl SyscallAbi for Ia32Abi {
    fn mode(&self) -> CompatMode {
        CompatMode::Ia32
    }

    fn decode(&self, regs: &Registers) -> SyscallInfo {
        let raw = regs.orig_rax & LOW32;
        SyscallInfo {
            mode: CompatMode::Ia32,
            number: sysno::from_ia32(raw),
            raw,
            args: [
                regs.rbx & LOW32,
                regs.rcx & LOW32,
                regs.rdx & LOW32,
                regs.rsi & LOW32,
                regs.rdi & LOW32,
                regs.rbp & LOW32,
            ],
            // eax holds a 32-bit value; negative errnos need sign extension
            retval: regs.rax as u32 as i32 as i64,
        }
    }
}

pub fn strategy(mode: CompatMode) -> &'static dyn SyscallAbi {
    match mode {
        CompatMode::X32 => &X32,
        CompatMode::Ia32 => &IA32,
        CompatMode::X86_64 | CompatMode::Aarch64 => &NATIVE,
    }
}

pub fn read_registers(pid: Pid) -> Result<Registers> {
    ptrace::getregs(pid).map_err(|e| ptrace_error("PTRACE_GETREGS", pid, e))
}

/// Classify by the two instruction bytes preceding the stop address, falling
/// back to the code segment selector when they are not a syscall gate.
pub fn classify(insn: [u8; 2], orig_rax: u64, cs: u64) -> Option<CompatMode> {
    let x32 = orig_rax & sysno::X32_SYSCALL_BIT != 0 && orig_rax != u64::MAX;
    match insn {
        INSN_SYSCALL if x32 => Some(CompatMode::X32),
        INSN_SYSCALL => Some(CompatMode::X86_64),
        INSN_INT80 | INSN_SYSENTER => Some(CompatMode::Ia32),
        _ => match cs {
            USER_CS_64 if x32 => Some(CompatMode::X32),
            USER_CS_64 => Some(CompatMode::X86_64),
            USER_CS_32 => Some(CompatMode::Ia32),
            _ => None,
        },
    }
}

pub fn detect_mode(mem: &dyn TraceeMemory, pid: Pid, regs: &Registers) -> Result<CompatMode> {
    let mut insn = [0u8; 2];
    let read = mem.read_bytes(pid, regs.rip.wrapping_sub(2), &mut insn);
    if read.is_err() {
        insn = [0, 0];
    }

    match classify(insn, regs.orig_rax, regs.cs) {
        Some(mode) => {
            log::debug!("pid {} uses {:?} syscall ABI", pid, mode);
            Ok(mode)
        }
        None => Err(read.err().unwrap_or_else(|| {
            TraceError::Backend(format!(
                "cannot determine syscall ABI of pid {} (insn={:02x?}, cs={:#x})",
                pid, insn, regs.cs
            ))
        })),
    }
}
