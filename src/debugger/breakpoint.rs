//! Software breakpoints: patch the first byte at a live address with `0xCC` (`INT3`), restore
//! the original byte to step over or remove the breakpoint.

use std::cell::Cell;

use nix::libc::c_void;
use nix::sys;
use nix::unistd::Pid;

use crate::debugger::address::RelocatedAddress;
use crate::error::{Error, Result};

const INT3: u8 = 0xCC;

/// Replace the low byte of `word` with `INT3`, returning the patched word and the byte it
/// displaced. Pure, so the byte math can be checked without a live tracee.
fn patch_int3(word: u64) -> (u64, u8) {
    let saved = (word & 0xff) as u8;
    let patched = (word & !0xff) | INT3 as u64;
    (patched, saved)
}

/// Put `saved` back as the low byte of `word`.
fn restore_byte(word: u64, saved: u8) -> u64 {
    (word & !0xff) | saved as u64
}

/// A single `INT3` breakpoint at a fixed live address in the tracee.
pub struct Breakpoint {
    addr: RelocatedAddress,
    pid: Pid,
    saved_data: Cell<u8>,
    enabled: Cell<bool>,
}

impl Breakpoint {
    pub fn new(addr: RelocatedAddress, pid: Pid) -> Self {
        Self {
            addr,
            pid,
            saved_data: Cell::new(0),
            enabled: Cell::new(false),
        }
    }

    pub fn addr(&self) -> RelocatedAddress {
        self.addr
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    fn as_ptr(&self) -> *mut c_void {
        self.addr.as_usize() as *mut c_void
    }

    /// Patch the tracee's text with `INT3`, remembering the displaced byte.
    pub fn enable(&self) -> Result<()> {
        let word = sys::ptrace::read(self.pid, self.as_ptr()).map_err(Error::Ptrace)? as u64;
        let (patched, saved) = patch_int3(word);
        self.saved_data.set(saved);
        unsafe {
            sys::ptrace::write(self.pid, self.as_ptr(), patched as *mut c_void)
                .map_err(Error::Ptrace)?;
        }
        self.enabled.set(true);
        Ok(())
    }

    /// Undo [`Breakpoint::enable`], restoring the original byte.
    pub fn disable(&self) -> Result<()> {
        let word = sys::ptrace::read(self.pid, self.as_ptr()).map_err(Error::Ptrace)? as u64;
        let restored = restore_byte(word, self.saved_data.get());
        unsafe {
            sys::ptrace::write(self.pid, self.as_ptr(), restored as *mut c_void)
                .map_err(Error::Ptrace)?;
        }
        self.enabled.set(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_int3_preserves_upper_bytes_and_saves_low_byte() {
        let word = 0x1122_3344_5566_7788u64;
        let (patched, saved) = patch_int3(word);
        assert_eq!(saved, 0x88);
        assert_eq!(patched, 0x1122_3344_5566_77CC);
        assert_eq!(patched & !0xff, word & !0xff);
    }

    #[test]
    fn restore_byte_undoes_patch_int3() {
        let word = 0xdead_beef_cafe_babeu64;
        let (patched, saved) = patch_int3(word);
        assert_eq!(restore_byte(patched, saved), word);
    }

    #[test]
    fn patch_is_a_single_byte_change() {
        let word = 0u64;
        let (patched, saved) = patch_int3(word);
        assert_eq!(saved, 0);
        assert_eq!(patched, 0xCC);
    }
}
