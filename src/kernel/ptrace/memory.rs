//! Word-granular access to tracee memory.
//!
//! The tracing interface only moves whole machine words. Unaligned ranges read
//! or rewrite the containing words and splice in the requested bytes.

use crate::config::types::{memory_error, Result};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;

pub const WORD: usize = std::mem::size_of::<u64>();

const WORD_MASK: u64 = !(WORD as u64 - 1);

const INITIAL_STRING_CAPACITY: usize = 64;

/// Longest path copied out of a tracee, matching the kernel's PATH_MAX.
pub const PATH_MAX: usize = libc::PATH_MAX as usize;

pub trait TraceeMemory {
    fn peek_word(&self, pid: Pid, addr: u64) -> Result<u64>;

    fn poke_word(&self, pid: Pid, addr: u64, word: u64) -> Result<()>;

    fn read_bytes(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let at = addr.wrapping_add(done as u64);
            let aligned = at & WORD_MASK;
            let offset = (at - aligned) as usize;
            let word = self.peek_word(pid, aligned)?.to_ne_bytes();
            let n = (WORD - offset).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&word[offset..offset + n]);
            done += n;
        }
        Ok(())
    }

    fn write_bytes(&self, pid: Pid, addr: u64, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let at = addr.wrapping_add(done as u64);
            let aligned = at & WORD_MASK;
            let offset = (at - aligned) as usize;
            let n = (WORD - offset).min(data.len() - done);
            let mut word = if n == WORD {
                [0u8; WORD]
            } else {
                self.peek_word(pid, aligned)?.to_ne_bytes()
            };
            word[offset..offset + n].copy_from_slice(&data[done..done + n]);
            self.poke_word(pid, aligned, u64::from_ne_bytes(word))?;
            done += n;
        }
        Ok(())
    }

    fn read_u64(&self, pid: Pid, addr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(pid, addr, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    fn read_u32(&self, pid: Pid, addr: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(pid, addr, &mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }

    /// Copy a NUL-terminated string, truncated to `max` bytes.
    ///
    /// The buffer grows by half its capacity whenever it fills up.
    fn read_cstring(&self, pid: Pid, addr: u64, max: usize) -> Result<String> {
        let mut buf: Vec<u8> = Vec::with_capacity(INITIAL_STRING_CAPACITY.min(max.max(1)));
        let mut at = addr;

        'words: loop {
            let aligned = at & WORD_MASK;
            let offset = (at - aligned) as usize;
            let word = self.peek_word(pid, aligned)?.to_ne_bytes();

            for &byte in &word[offset..] {
                if byte == 0 || buf.len() >= max {
                    break 'words;
                }
                if buf.len() == buf.capacity() {
                    buf.reserve_exact((buf.capacity() / 2).max(WORD));
                }
                buf.push(byte);
            }
            at = aligned.wrapping_add(WORD as u64);
        }

        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// PEEKDATA/POKEDATA on a stopped tracee
#[derive(Debug, Default, Clone, Copy)]
pub struct PtraceMemory;

impl TraceeMemory for PtraceMemory {
    fn peek_word(&self, pid: Pid, addr: u64) -> Result<u64> {
        ptrace::read(pid, addr as ptrace::AddressType)
            .map(|word| word as u64)
            .map_err(|e| memory_error(pid, addr, e))
    }

    fn poke_word(&self, pid: Pid, addr: u64, word: u64) -> Result<()> {
        // SAFETY: POKEDATA passes the word by value; no local memory is touched.
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEDATA,
                pid.as_raw(),
                addr as *mut libc::c_void,
                word as *mut libc::c_void,
            )
        };
        Errno::result(rc)
            .map(drop)
            .map_err(|e| memory_error(pid, addr, e))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeMemory;
    use super::*;
    use crate::config::types::TraceError;

    fn pid() -> Pid {
        Pid::from_raw(42)
    }

    #[test]
    fn unaligned_write_preserves_neighbouring_bytes() {
        let mem = FakeMemory::new();
        mem.write_bytes(pid(), 0x1000, &[0xaa; 24]).unwrap();
        mem.write_bytes(pid(), 0x1005, b"hello").unwrap();

        let mut out = [0u8; 16];
        mem.read_bytes(pid(), 0x1000, &mut out).unwrap();
        assert_eq!(&out[..5], &[0xaa; 5]);
        assert_eq!(&out[5..10], b"hello");
        assert_eq!(&out[10..], &[0xaa; 6]);
    }

    #[test]
    fn read_spanning_words_touches_each_word_once() {
        let mem = FakeMemory::new();
        mem.write_bytes(pid(), 0x2000, b"0123456789abcdef").unwrap();
        *mem.peeks.borrow_mut() = 0;

        let mut out = [0u8; 4];
        mem.read_bytes(pid(), 0x2006, &mut out).unwrap();
        assert_eq!(&out, b"6789");
        assert_eq!(*mem.peeks.borrow(), 2);
    }

    #[test]
    fn cstring_stops_at_terminator() {
        let mem = FakeMemory::new().with_cstring(0x3003, "/etc/passwd");
        assert_eq!(mem.read_cstring(pid(), 0x3003, PATH_MAX).unwrap(), "/etc/passwd");
    }

    #[test]
    fn cstring_grows_past_initial_capacity() {
        let long = "a/".repeat(200);
        let mem = FakeMemory::new().with_cstring(0x4000, &long);
        assert_eq!(mem.read_cstring(pid(), 0x4000, PATH_MAX).unwrap(), long);
    }

    #[test]
    fn cstring_is_bounded_by_max() {
        let mem = FakeMemory::new().with_cstring(0x5000, "abcdefghijklmnop");
        assert_eq!(mem.read_cstring(pid(), 0x5000, 5).unwrap(), "abcde");
    }

    #[test]
    fn faulting_word_is_a_hard_error() {
        let mem = FakeMemory::faulting_from(0x6008);
        mem.write_bytes(pid(), 0x6000, b"12345678").unwrap();
        let err = mem.read_cstring(pid(), 0x6000, PATH_MAX).unwrap_err();
        assert!(matches!(err, TraceError::Memory { addr: 0x6008, .. }));
    }

    #[test]
    fn read_u64_handles_unaligned_address() {
        let mem = FakeMemory::new();
        mem.write_bytes(pid(), 0x7004, &0x1122_3344_5566_7788u64.to_ne_bytes())
            .unwrap();
        assert_eq!(mem.read_u64(pid(), 0x7004).unwrap(), 0x1122_3344_5566_7788);
    }
}
