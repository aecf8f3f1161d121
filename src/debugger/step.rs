//! Stepping algorithms: single-instruction, line granularity, and call-aware step over/out.
//!
//! Grounded directly on the original debugger's `step_in`/`step_over`/`step_out`, not the
//! teacher's CFA-unwinder based stepping engine: step-in single-steps until the line table's
//! `line` field changes; step-over plants temporary breakpoints at every other line of the
//! current function plus the return address, continues once, then removes whichever of those it
//! added; step-out plants a single temporary breakpoint at the return address.

use super::address::RelocatedAddress;
use super::{Debugger, Register, SourcePlace, StopReason};
use crate::error::{Error, Result};

impl Debugger {
    /// Single-step until execution reaches a different source line than the one it started on.
    /// Returns early if a breakpoint, signal, or exit intervenes before that happens.
    pub fn step_in(&mut self) -> Result<StopReason> {
        let start_line = self.current_line();
        loop {
            match self.single_step_instruction()? {
                StopReason::Stepped => {}
                other => return Ok(other),
            }
            let line = self.current_line();
            if line.is_some() && line != start_line {
                let pc = self.pc()?;
                let place = self.place_at(pc);
                return Ok(StopReason::Breakpoint(pc, place));
            }
        }
    }

    /// Run until control returns to the current function without descending into any call made
    /// from the current line.
    pub fn step_over(&mut self) -> Result<StopReason> {
        let pc = self.pc()?;
        let global_pc = self.to_global(pc);
        let func = self.resolver.find_function_from_pc(global_pc)?;
        let func_name = || func.name().unwrap_or("<anonymous>").to_string();
        let low = func.low_pc().ok_or_else(|| Error::FunctionNotFound(func_name()))?;
        let high = func.high_pc().ok_or_else(|| Error::FunctionNotFound(func_name()))?;

        let current_line_addr = self
            .resolver
            .find_place_from_pc(global_pc)
            .map(|p| p.address)
            .unwrap_or(global_pc);

        let mut planted = vec![];
        for line_addr in self.resolver.line_addresses_in_range(low, high) {
            if line_addr == current_line_addr {
                continue;
            }
            let addr = self.to_relocated(line_addr);
            if !self.breakpoints.contains_key(&addr) {
                self.set_breakpoint_at_addr(addr)?;
                planted.push(addr);
            }
        }

        let return_address = self.return_address()?;
        if !self.breakpoints.contains_key(&return_address) {
            self.set_breakpoint_at_addr(return_address)?;
            planted.push(return_address);
        }

        let result = self.cont()?;

        for addr in planted {
            self.remove_breakpoint(addr)?;
        }

        Ok(result)
    }

    /// Run until the current function returns, via a single temporary breakpoint at the return
    /// address read off the stack frame's saved return address (`*(rbp+8)`).
    pub fn step_out(&mut self) -> Result<StopReason> {
        let return_address = self.return_address()?;
        let already_present = self.breakpoints.contains_key(&return_address);
        if !already_present {
            self.set_breakpoint_at_addr(return_address)?;
        }

        let result = self.cont()?;

        if !already_present {
            self.remove_breakpoint(return_address)?;
        }

        Ok(result)
    }

    fn return_address(&self) -> Result<RelocatedAddress> {
        let frame_pointer = self.get_register(Register::Rbp)?;
        let value = self.read_memory(RelocatedAddress::from(frame_pointer + 8))?;
        Ok(RelocatedAddress::from(value))
    }

    fn current_line(&self) -> Option<u64> {
        let pc = self.pc().ok()?;
        let global = self.to_global(pc);
        self.resolver.find_place_from_pc(global).ok().map(|p| p.line)
    }

    fn place_at(&self, pc: RelocatedAddress) -> Option<SourcePlace> {
        let global = self.to_global(pc);
        self.resolver
            .find_place_from_pc(global)
            .ok()
            .map(|p| SourcePlace { file: p.file.to_string(), line: p.line })
    }
}
