//! The register file: host register enumeration, DWARF register-number mapping, and
//! ptrace-backed get/set access.
//!
//! The kernel's `user_regs_struct` has a fixed field layout; this module treats it as flat
//! storage and reaches into it by ordinal (the position of a register in [`REGISTER_DESCRIPTORS`],
//! which mirrors the struct's actual field order), never by field name. That ordinal is also
//! reused as the offset `ptrace(PTRACE_PEEKUSER/POKEUSER)` would expect, so a descriptor fully
//! determines how to read or write one register.

use nix::libc::user_regs_struct;
use nix::sys;
use nix::unistd::Pid;
use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};

/// One of the 27 general-purpose/segment/flags registers `PTRACE_GETREGS` exposes.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    R15,
    R14,
    R13,
    R12,
    Rbp,
    Rbx,
    R11,
    R10,
    R9,
    R8,
    Rax,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    OrigRax,
    Rip,
    Cs,
    Eflags,
    Rsp,
    Ss,
    FsBase,
    GsBase,
    Ds,
    Es,
    Fs,
    Gs,
}

/// `(register, dwarf number, display name)`. Order here is the ordinal used to index into
/// `user_regs_struct` when reinterpreted as `[u64; 27]` — it matches the struct's actual field
/// layout on x86-64 Linux, not the order a human would list registers in. `-1` means the DWARF
/// CFI register numbering has no equivalent for this register (`rip`, `orig_rax`).
pub const REGISTER_DESCRIPTORS: [(Register, i64, &str); 27] = [
    (Register::R15, 15, "r15"),
    (Register::R14, 14, "r14"),
    (Register::R13, 13, "r13"),
    (Register::R12, 12, "r12"),
    (Register::Rbp, 6, "rbp"),
    (Register::Rbx, 3, "rbx"),
    (Register::R11, 11, "r11"),
    (Register::R10, 10, "r10"),
    (Register::R9, 9, "r9"),
    (Register::R8, 8, "r8"),
    (Register::Rax, 0, "rax"),
    (Register::Rcx, 2, "rcx"),
    (Register::Rdx, 1, "rdx"),
    (Register::Rsi, 4, "rsi"),
    (Register::Rdi, 5, "rdi"),
    (Register::OrigRax, -1, "orig_rax"),
    (Register::Rip, -1, "rip"),
    (Register::Cs, 51, "cs"),
    (Register::Eflags, 49, "eflags"),
    (Register::Rsp, 7, "rsp"),
    (Register::Ss, 52, "ss"),
    (Register::FsBase, 58, "fs_base"),
    (Register::GsBase, 59, "gs_base"),
    (Register::Ds, 53, "ds"),
    (Register::Es, 50, "es"),
    (Register::Fs, 54, "fs"),
    (Register::Gs, 55, "gs"),
];

fn ordinal_of(register: Register) -> usize {
    REGISTER_DESCRIPTORS
        .iter()
        .position(|(r, _, _)| *r == register)
        .expect("every Register variant has a descriptor")
}

/// Reinterpret a `user_regs_struct` as 27 consecutive `u64` words, in declaration order.
///
/// Safety: `user_regs_struct` on x86-64 Linux is a plain struct of 27 `unsigned long` fields
/// with no padding; reading it as `[u64; 27]` reproduces exactly what `ptrace(PEEKUSER)` would
/// return for each offset.
fn as_words(regs: &user_regs_struct) -> &[u64; 27] {
    unsafe { &*(regs as *const user_regs_struct as *const [u64; 27]) }
}

fn as_words_mut(regs: &mut user_regs_struct) -> &mut [u64; 27] {
    unsafe { &mut *(regs as *mut user_regs_struct as *mut [u64; 27]) }
}

/// Look up a register by its DWARF (CFI) number, as used in `.eh_frame`/`.debug_frame`
/// expressions and `DW_OP_regN`/`DW_OP_bregN` location operations.
pub fn register_from_dwarf(dwarf_number: u16) -> Result<Register> {
    REGISTER_DESCRIPTORS
        .iter()
        .find(|(_, d, _)| *d == dwarf_number as i64)
        .map(|(r, _, _)| *r)
        .ok_or(Error::UnknownDwarfRegister(dwarf_number))
}

pub fn name_of(register: Register) -> &'static str {
    REGISTER_DESCRIPTORS
        .iter()
        .find(|(r, _, _)| *r == register)
        .map(|(_, _, n)| *n)
        .expect("every Register variant has a descriptor")
}

/// A snapshot of every register of the traced process, read in one `PTRACE_GETREGS` call.
pub struct RegisterSet {
    regs: user_regs_struct,
}

impl RegisterSet {
    /// Read the current register file of `pid` via `PTRACE_GETREGS`.
    pub fn current(pid: Pid) -> Result<Self> {
        let regs = sys::ptrace::getregs(pid).map_err(Error::Ptrace)?;
        Ok(Self { regs })
    }

    /// Read a single register's value by ordinal lookup — never by struct field name.
    pub fn value(&self, register: Register) -> u64 {
        as_words(&self.regs)[ordinal_of(register)]
    }

    /// Write a single register's value in this in-memory snapshot. Call [`RegisterSet::persist`]
    /// to push it back into the traced process.
    pub fn set(&mut self, register: Register, value: u64) {
        as_words_mut(&mut self.regs)[ordinal_of(register)] = value;
    }

    /// Write this register file back into `pid` via `PTRACE_SETREGS`.
    pub fn persist(&self, pid: Pid) -> Result<()> {
        sys::ptrace::setregs(pid, self.regs).map_err(Error::Ptrace)
    }

    /// Convenience: read one register straight off the tracee without holding a snapshot.
    pub fn get(pid: Pid, register: Register) -> Result<u64> {
        Ok(Self::current(pid)?.value(register))
    }

    /// Convenience: read-modify-write one register straight against the tracee.
    pub fn put(pid: Pid, register: Register, value: u64) -> Result<()> {
        let mut regs = Self::current(pid)?;
        regs.set(register, value);
        regs.persist(pid)
    }

    pub fn get_dwarf(pid: Pid, dwarf_number: u16) -> Result<u64> {
        Self::get(pid, register_from_dwarf(dwarf_number)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_register_has_a_unique_ordinal() {
        let mut seen = std::collections::HashSet::new();
        for (i, (r, _, _)) in REGISTER_DESCRIPTORS.iter().enumerate() {
            assert_eq!(ordinal_of(*r), i);
            assert!(seen.insert(*r), "duplicate register {r:?}");
        }
        assert_eq!(REGISTER_DESCRIPTORS.len(), 27);
    }

    #[test]
    fn struct_reinterpret_matches_field_order() {
        let regs = user_regs_struct {
            r15: 15,
            r14: 14,
            r13: 13,
            r12: 12,
            rbp: 6,
            rbx: 3,
            r11: 11,
            r10: 10,
            r9: 9,
            r8: 8,
            rax: 0,
            rcx: 2,
            rdx: 1,
            rsi: 4,
            rdi: 5,
            orig_rax: 0xaa,
            rip: 0xbb,
            cs: 51,
            eflags: 49,
            rsp: 7,
            ss: 52,
            fs_base: 58,
            gs_base: 59,
            ds: 53,
            es: 50,
            fs: 54,
            gs: 55,
        };
        let words = as_words(&regs);
        for (i, (_, dwarf_or_marker, _)) in REGISTER_DESCRIPTORS.iter().enumerate() {
            if *dwarf_or_marker >= 0 {
                assert_eq!(words[i], *dwarf_or_marker as u64, "word {i} mismatched");
            }
        }
    }

    #[test]
    fn dwarf_lookup_resolves_known_numbers() {
        assert_eq!(register_from_dwarf(0).unwrap(), Register::Rax);
        assert_eq!(register_from_dwarf(7).unwrap(), Register::Rsp);
        assert_eq!(register_from_dwarf(58).unwrap(), Register::FsBase);
    }

    #[test]
    fn dwarf_lookup_rejects_unmapped_numbers() {
        assert!(register_from_dwarf(200).is_err());
        // rip/orig_rax are intentionally unreachable via dwarf number (-1 in the table).
        assert!(register_from_dwarf(u16::MAX).is_err());
    }

    #[test]
    fn name_round_trips_through_display_and_descriptor_table() {
        for (r, _, name) in REGISTER_DESCRIPTORS.iter() {
            assert_eq!(name_of(*r), *name);
            assert_eq!(r.to_string(), *name);
        }
    }
}
