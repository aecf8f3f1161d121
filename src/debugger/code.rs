//! `siginfo_t::si_code` values the kernel reports alongside `SIGTRAP`.

/// Sent by the kernel itself rather than attributed to a specific trap reason; on many kernels
/// this, not `TRAP_BRKPT`, is what accompanies a software breakpoint's `INT3` trap.
pub const SI_KERNEL: i32 = 0x80;

/// Process hit a breakpoint (`INT3`).
pub const TRAP_BRKPT: i32 = 0x1;
/// Process hit a single-step trace trap.
pub const TRAP_TRACE: i32 = 0x2;
