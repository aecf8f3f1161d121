//! Adapter between `gimli`'s `Expression` evaluator and a live ptrace'd process.
//!
//! Deliberately minimal: this debugger only ever evaluates a variable's `DW_AT_location`
//! `exprloc`, and the expressions that appear there in practice only ask for a register value
//! or a dereference of tracee memory (`DW_OP_fbreg`-style frame-relative locations are not
//! supported — there is no frame-base plumbing here at all, matching the limits of the simple
//! `ptrace_expr_context` this is grounded on).

use gimli::{Encoding, EvaluationResult, Expression, Location, Value};
use nix::sys;
use nix::sys::ptrace::AddressType;
use nix::unistd::Pid;

use crate::debugger::dwarf::EndianRcSlice;
use crate::debugger::register::register_from_dwarf;
use crate::debugger::RegisterSet;
use crate::error::{Error, Result};

/// Where a variable's value currently lives.
#[derive(Debug, Clone, Copy)]
pub enum VariableLocation {
    Address(u64),
    Register(u16),
}

/// Evaluate a `DW_AT_location` `exprloc` against a running tracee, yielding the single location
/// piece it resolves to. Errors on any construct beyond register/memory dereference.
///
/// Addresses a `DW_AT_location` expression deals in (both the ones it dereferences mid-evaluation
/// and the one it finally resolves to) are DWARF-space; `load_address` is the executable's load
/// bias (zero for a non-PIE target) needed to turn them into live addresses before any
/// `ptrace::read`, matching `deref_size(a, sz)`'s `a + load_address` contract.
pub fn evaluate(
    encoding: Encoding,
    expr: Expression<EndianRcSlice>,
    pid: Pid,
    load_address: usize,
) -> Result<VariableLocation> {
    let mut eval = expr.evaluation(encoding);
    let mut result = eval.evaluate().map_err(Error::DwarfParsing)?;

    loop {
        result = match result {
            EvaluationResult::Complete => break,
            EvaluationResult::RequiresRegister { register, .. } => {
                let value = RegisterSet::get_dwarf(pid, register.0)?;
                eval.resume_with_register(Value::Generic(value))
                    .map_err(Error::DwarfParsing)?
            }
            EvaluationResult::RequiresMemory { address, size, .. } => {
                let relocated = address as usize + load_address;
                let word = sys::ptrace::read(pid, relocated as AddressType).map_err(Error::Ptrace)? as u64;
                let mask = if size >= 8 { u64::MAX } else { (1u64 << (size * 8)) - 1 };
                eval.resume_with_memory(Value::Generic(word & mask))
                    .map_err(Error::DwarfParsing)?
            }
            _ => return Err(Error::UnhandledVariableLocation),
        };
    }

    let pieces = eval.result();
    let piece = pieces.first().ok_or(Error::UnhandledVariableLocation)?;
    match piece.location {
        Location::Address { address } => Ok(VariableLocation::Address(address)),
        Location::Register { register } => Ok(VariableLocation::Register(register.0)),
        _ => Err(Error::UnhandledVariableLocation),
    }
}

/// Read the live value a `VariableLocation` points at, as a raw 64-bit word (the original
/// debugger prints variables as raw integers; no type-directed formatting here). `Address` is
/// DWARF-space, same as within [`evaluate`], so `load_address` is added before the `ptrace::read`.
pub fn read_value(pid: Pid, location: VariableLocation, load_address: usize) -> Result<u64> {
    match location {
        VariableLocation::Address(addr) => {
            let relocated = addr as usize + load_address;
            Ok(sys::ptrace::read(pid, relocated as AddressType).map_err(Error::Ptrace)? as u64)
        }
        VariableLocation::Register(dwarf_num) => {
            let register = register_from_dwarf(dwarf_num)?;
            Ok(RegisterSet::get(pid, register)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dw_op_reg0_decodes_as_rax() {
        // DW_OP_reg0 = 0x50: "the value is in register 0" (rax), no memory access needed.
        assert_eq!(register_from_dwarf(0).unwrap().to_string(), "rax");
    }
}
