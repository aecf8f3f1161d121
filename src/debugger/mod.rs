//! The Tracer Core: owns the traced process, the breakpoint table, and every primitive
//! operation (memory/register I/O, wait/signal dispatch, backtrace, variable inspection) the
//! REPL's commands are built out of.

pub mod address;
pub mod breakpoint;
pub mod code;
pub mod dwarf;
pub mod process;
pub mod register;
pub mod step;
pub mod symbol;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use nix::libc::{c_void, siginfo_t};
use nix::sys;
use nix::sys::ptrace::AddressType;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use object::Object;

use crate::error::{Error, Result};

use address::{GlobalAddress, RelocatedAddress};
use breakpoint::Breakpoint;
use dwarf::Resolver;
use process::Child;
pub use register::{Register, RegisterSet};
use symbol::SymbolTable;

/// A place reached by a breakpoint or a step, resolved to source coordinates when debug
/// information covers the address.
#[derive(Debug, Clone)]
pub struct SourcePlace {
    pub file: String,
    pub line: u64,
}

/// The reason [`Debugger::cont`] / a stepping call returned control to the REPL.
pub enum StopReason {
    Breakpoint(RelocatedAddress, Option<SourcePlace>),
    Signal(Signal, siginfo_t),
    Exited(i32),
    /// A plain single-step trace trap with nothing more to report (used internally by the
    /// stepping engine; the REPL never sees this directly).
    Stepped,
}

/// One reconstructed stack frame: the enclosing function's name and entry address (`low_pc`,
/// relocated), not the frame's raw return-address pc — matching how the original debugger's
/// backtrace prints a frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub number: u32,
    pub function_address: RelocatedAddress,
    pub function_name: Option<String>,
}

/// A local variable of the currently executing function, with its live value already read.
#[derive(Debug, Clone)]
pub struct VariableView {
    pub name: String,
    pub location: dwarf::eval::VariableLocation,
    pub value: u64,
}

/// Receives notifications about process-level events so the REPL can render them; the core
/// itself never prints anything.
pub trait EventHook {
    fn on_breakpoint(&self, pc: RelocatedAddress, place: Option<&SourcePlace>);
    fn on_signal(&self, signal: Signal, info: &siginfo_t);
    fn on_exit(&self, code: i32);
}

/// Main entry point of the core: one executable, loaded once, optionally attached to a live
/// process.
pub struct Debugger {
    program: PathBuf,
    pid: Option<Pid>,
    load_address: usize,
    is_pie: bool,
    entry_point: GlobalAddress,
    resolver: Resolver,
    symbols: SymbolTable,
    breakpoints: HashMap<RelocatedAddress, Breakpoint>,
    hook: Box<dyn EventHook>,
}

/// The parts of a `Debugger` derived purely from reading an ELF/DWARF file, independent of any
/// live process. Re-derivable at any point the debugger learns of a (possibly different)
/// executable backing the target — at construction, and again on `attach` once the real path is
/// known via `/proc/<pid>/exe`.
struct ExecutableView {
    resolver: Resolver,
    symbols: SymbolTable,
    entry_point: GlobalAddress,
    is_pie: bool,
}

fn parse_executable(program: &Path) -> Result<ExecutableView> {
    let file = fs::File::open(program)?;
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let object_file = object::File::parse(&*mmap)?;

    Ok(ExecutableView {
        resolver: Resolver::parse(&object_file)?,
        symbols: SymbolTable::load(&object_file),
        entry_point: GlobalAddress::from(object_file.entry()),
        is_pie: object_file.kind() == object::ObjectKind::Dynamic,
    })
}

impl Debugger {
    /// Parse `program`'s ELF/DWARF once. Does not launch or attach to anything yet.
    pub fn new(program: impl AsRef<Path>, hook: impl EventHook + 'static) -> Result<Self> {
        let program = program.as_ref().to_path_buf();
        let view = parse_executable(&program)?;

        Ok(Self {
            program,
            pid: None,
            load_address: 0,
            is_pie: view.is_pie,
            entry_point: view.entry_point,
            resolver: view.resolver,
            symbols: view.symbols,
            breakpoints: HashMap::new(),
            hook: Box::new(hook),
        })
    }

    pub fn pid(&self) -> Result<Pid> {
        self.pid.ok_or(Error::NotRunning)
    }

    fn require_pid(&self) -> Result<Pid> {
        self.pid()
    }

    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    /// `fork()` + `PTRACE_TRACEME` + `execve` the debugee, then wait for the initial
    /// post-exec stop and compute its load address.
    pub fn launch(&mut self, args: Vec<String>) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        let program = self.program.to_string_lossy().to_string();
        let child = Child::new(program, args).launch()?;
        let pid = child.pid();
        self.pid = Some(pid);
        self.wait_for_signal()?;
        self.initialize_load_address()?;
        Ok(())
    }

    /// `PTRACE_ATTACH` to an already-running process. The executable backing `pid` is resolved
    /// via `readlink("/proc/<pid>/exe")` and re-parsed, so `attach` works correctly even when it
    /// targets a different binary than the one `Debugger::new` was constructed with.
    pub fn attach(&mut self, pid: Pid) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        let exe = fs::read_link(format!("/proc/{pid}/exe"))?;
        let view = parse_executable(&exe)?;
        self.program = exe;
        self.resolver = view.resolver;
        self.symbols = view.symbols;
        self.entry_point = view.entry_point;
        self.is_pie = view.is_pie;

        sys::ptrace::attach(pid).map_err(Error::Ptrace)?;
        self.pid = Some(pid);
        self.wait_for_signal()?;
        self.initialize_load_address()?;
        Ok(())
    }

    /// Disable every installed breakpoint (restoring the original instruction bytes),
    /// `PTRACE_DETACH`, then clear the breakpoint table and load address back to their
    /// `NOT_RUNNING` defaults (spec.md §3's Debugger state: `m_pid = 0`, breakpoint table empty,
    /// `load_address = 0`).
    pub fn detach(&mut self) -> Result<()> {
        let pid = self.require_pid()?;
        for bp in self.breakpoints.values() {
            if bp.is_enabled() {
                bp.disable()?;
            }
        }
        sys::ptrace::detach(pid, None).map_err(Error::Ptrace)?;
        self.clear_debuggee_data();
        Ok(())
    }

    /// Return to the `NOT_RUNNING` state: no pid, empty breakpoint table, zero load address.
    /// Shared by `detach` and by observing the target exit/get signalled (`wait_for_signal`).
    fn clear_debuggee_data(&mut self) {
        self.pid = None;
        self.breakpoints.clear();
        self.load_address = 0;
    }

    /// Read the executable's load bias from `/proc/<pid>/maps`; zero for a non-PIE binary.
    fn initialize_load_address(&mut self) -> Result<()> {
        if !self.is_pie {
            self.load_address = 0;
            return Ok(());
        }
        let pid = self.require_pid()?;
        let maps = fs::read_to_string(format!("/proc/{pid}/maps"))?;
        let first_line = maps.lines().next().unwrap_or_default();
        let addr_field = first_line.split('-').next().unwrap_or("0");
        self.load_address = usize::from_str_radix(addr_field, 16).unwrap_or(0);
        Ok(())
    }

    pub fn load_address(&self) -> usize {
        self.load_address
    }

    pub fn to_global(&self, addr: RelocatedAddress) -> GlobalAddress {
        addr.into_global(self.load_address)
    }

    pub fn to_relocated(&self, addr: GlobalAddress) -> RelocatedAddress {
        addr.relocate(self.load_address)
    }

    // ---------------------------------------------------------------- registers & memory

    pub fn get_register(&self, register: Register) -> Result<u64> {
        RegisterSet::get(self.require_pid()?, register)
    }

    pub fn set_register(&self, register: Register, value: u64) -> Result<()> {
        RegisterSet::put(self.require_pid()?, register, value)
    }

    pub fn pc(&self) -> Result<RelocatedAddress> {
        Ok(RelocatedAddress::from(self.get_register(Register::Rip)?))
    }

    fn set_pc(&self, addr: RelocatedAddress) -> Result<()> {
        self.set_register(Register::Rip, addr.as_u64())
    }

    pub fn read_memory(&self, addr: RelocatedAddress) -> Result<u64> {
        let pid = self.require_pid()?;
        Ok(sys::ptrace::read(pid, addr.as_usize() as AddressType).map_err(Error::Ptrace)? as u64)
    }

    pub fn write_memory(&self, addr: RelocatedAddress, value: u64) -> Result<()> {
        let pid = self.require_pid()?;
        unsafe {
            sys::ptrace::write(pid, addr.as_usize() as AddressType, value as *mut c_void)
                .map_err(Error::Ptrace)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------- breakpoints

    pub fn set_breakpoint_at_addr(&mut self, addr: RelocatedAddress) -> Result<()> {
        let pid = self.require_pid()?;
        let bp = Breakpoint::new(addr, pid);
        bp.enable()?;
        self.breakpoints.insert(addr, bp);
        Ok(())
    }

    /// Resolve `name` to every matching function (more than one compilation unit can define a
    /// function of the same name) and set a breakpoint just past each one's prologue — spec.md
    /// §4.5 calls this out explicitly as "by design", so a name collision plants breakpoints at
    /// every match rather than silently picking one.
    pub fn set_breakpoint_at_function(&mut self, name: &str) -> Result<Vec<RelocatedAddress>> {
        let funcs = self.resolver.find_functions_by_name(name);
        if funcs.is_empty() {
            return Err(Error::FunctionNotFound(name.to_string()));
        }
        let mut addrs = vec![];
        for func in &funcs {
            let place = self.resolver.address_after_prologue(func)?;
            let addr = self.to_relocated(place.address);
            self.set_breakpoint_at_addr(addr)?;
            addrs.push(addr);
        }
        Ok(addrs)
    }

    pub fn set_breakpoint_at_line(&mut self, file: &str, line: u64) -> Result<RelocatedAddress> {
        let place = self.resolver.address_of_line(file, line)?;
        let addr = self.to_relocated(place.address);
        self.set_breakpoint_at_addr(addr)?;
        Ok(addr)
    }

    pub fn remove_breakpoint(&mut self, addr: RelocatedAddress) -> Result<()> {
        if let Some(bp) = self.breakpoints.get(&addr) {
            if bp.is_enabled() {
                bp.disable()?;
            }
        }
        self.breakpoints.remove(&addr);
        Ok(())
    }

    fn has_active_breakpoint(&self, addr: RelocatedAddress) -> bool {
        self.breakpoints.get(&addr).map(|b| b.is_enabled()).unwrap_or(false)
    }

    /// If the pc currently sits on a breakpoint's `INT3`, disable it, single-step past the
    /// real instruction, then re-enable it.
    pub(crate) fn step_over_breakpoint(&mut self) -> Result<()> {
        let pc = self.pc()?;
        if let Some(bp) = self.breakpoints.get(&pc) {
            if bp.is_enabled() {
                bp.disable()?;
                self.ptrace_singlestep_and_wait()?;
                bp.enable()?;
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------- execution control

    /// `PTRACE_CONT`, after first stepping over any breakpoint sitting at the current pc.
    pub fn cont(&mut self) -> Result<StopReason> {
        self.step_over_breakpoint()?;
        let pid = self.require_pid()?;
        sys::ptrace::cont(pid, None).map_err(Error::Ptrace)?;
        self.wait_for_signal()
    }

    fn ptrace_singlestep_and_wait(&mut self) -> Result<StopReason> {
        let pid = self.require_pid()?;
        sys::ptrace::step(pid, None).map_err(Error::Ptrace)?;
        self.wait_for_signal()
    }

    /// Single-step one instruction, transparently stepping over a breakpoint if the pc is
    /// currently sitting on one.
    pub fn single_step_instruction(&mut self) -> Result<StopReason> {
        let pc = self.pc()?;
        if self.has_active_breakpoint(pc) {
            self.step_over_breakpoint()?;
            Ok(StopReason::Stepped)
        } else {
            self.ptrace_singlestep_and_wait()
        }
    }

    /// Block on the tracee's next stop and classify it; dispatches `on_breakpoint`/`on_signal`/
    /// `on_exit` to the hook and returns the same classification to the caller.
    fn wait_for_signal(&mut self) -> Result<StopReason> {
        let pid = self.require_pid()?;
        let status = sys::wait::waitpid(pid, None).map_err(Error::Waitpid)?;

        match status {
            WaitStatus::Exited(_, code) => {
                self.clear_debuggee_data();
                self.hook.on_exit(code);
                Ok(StopReason::Exited(code))
            }
            WaitStatus::Signaled(_, signal, _) => {
                self.clear_debuggee_data();
                self.hook.on_exit(128 + signal as i32);
                Ok(StopReason::Exited(128 + signal as i32))
            }
            WaitStatus::Stopped(_, signal) => self.handle_stop(signal),
            _ => {
                log::warn!(target: "debugger", "unexpected wait status: {status:?}");
                Ok(StopReason::Stepped)
            }
        }
    }

    fn handle_stop(&mut self, signal: Signal) -> Result<StopReason> {
        let pid = self.require_pid()?;
        let info = sys::ptrace::getsiginfo(pid).map_err(Error::Ptrace)?;

        match signal {
            Signal::SIGTRAP => self.handle_sigtrap(info),
            other => {
                self.hook.on_signal(other, &info);
                Ok(StopReason::Signal(other, info))
            }
        }
    }

    fn handle_sigtrap(&mut self, info: siginfo_t) -> Result<StopReason> {
        match info.si_code {
            code::SI_KERNEL | code::TRAP_BRKPT => {
                // the tracee is stopped one byte past the `INT3`; rewind pc to the breakpoint's
                // own address, matching the original `set_pc(get_pc() - 1)`.
                let pc = self.pc()?.offset(-1);
                self.set_pc(pc)?;

                let global = self.to_global(pc);
                let place = self
                    .resolver
                    .find_place_from_pc(global)
                    .ok()
                    .map(|p| SourcePlace { file: p.file.to_string(), line: p.line });

                self.hook.on_breakpoint(pc, place.as_ref());
                Ok(StopReason::Breakpoint(pc, place))
            }
            code::TRAP_TRACE => Ok(StopReason::Stepped),
            other => {
                log::debug!(target: "debugger", "unknown SIGTRAP si_code {other}");
                Ok(StopReason::Stepped)
            }
        }
    }

    // ---------------------------------------------------------------- symbols

    pub fn lookup_symbol(&self, name: &str) -> Vec<(&str, &symbol::Symbol)> {
        self.symbols.lookup(name)
    }

    // ---------------------------------------------------------------- backtrace

    /// Walk the `rbp` chain until reaching `main`. This assumes every frame was compiled with
    /// frame pointers retained (no CFI/unwind-table based reconstruction). Each emitted frame
    /// carries its enclosing function's name and entry address (`low_pc`), not the raw pc/return
    /// address used to find it.
    pub fn backtrace(&self) -> Result<Vec<Frame>> {
        let pid = self.require_pid()?;
        let mut frames = vec![];

        let pc = self.pc()?;
        let mut current_func = self.resolver.find_function_from_pc(self.to_global(pc)).ok();
        let mut current_name = current_func.as_ref().and_then(|f| f.name().map(str::to_string));
        let mut current_addr = current_func
            .as_ref()
            .and_then(|f| f.low_pc())
            .map(|a| self.to_relocated(a))
            .unwrap_or(pc);
        frames.push(Frame { number: 0, function_address: current_addr, function_name: current_name.clone() });

        let mut frame_pointer = RegisterSet::get(pid, Register::Rbp)?;
        let mut return_address = self.read_memory(RelocatedAddress::from(frame_pointer + 8))?;

        let mut number = 1;
        while current_name.as_deref() != Some("main") {
            let ret = RelocatedAddress::from(return_address);
            current_func = self.resolver.find_function_from_pc(self.to_global(ret)).ok();
            current_name = current_func.as_ref().and_then(|f| f.name().map(str::to_string));
            current_addr = current_func
                .as_ref()
                .and_then(|f| f.low_pc())
                .map(|a| self.to_relocated(a))
                .unwrap_or(ret);
            frames.push(Frame { number, function_address: current_addr, function_name: current_name.clone() });
            if current_name.is_none() {
                break;
            }
            frame_pointer = self.read_memory(RelocatedAddress::from(frame_pointer))?;
            return_address = self.read_memory(RelocatedAddress::from(frame_pointer + 8))?;
            number += 1;
        }

        Ok(frames)
    }

    // ---------------------------------------------------------------- variables

    /// Every local variable of the function enclosing the current pc, with its current value.
    /// Only `exprloc`-form `DW_AT_location` is supported (the original's "Unhandled variable
    /// location" limit), and frame-relative (`DW_OP_fbreg`) expressions are not evaluated since
    /// no frame-base context is plumbed through.
    pub fn list_variables(&self) -> Result<Vec<VariableView>> {
        let pid = self.require_pid()?;
        let pc = self.to_global(self.pc()?);
        let func = self.resolver.find_function_from_pc(pc)?;
        let encoding = self.resolver.encoding();

        let mut out = vec![];
        for var in self.resolver.function_variables(&func) {
            let Some(name) = var.name.clone() else { continue };
            let Some(loc_bytes) = var.location.clone() else {
                return Err(Error::UnhandledVariableLocation);
            };
            let expr = gimli::Expression(dwarf::EndianRcSlice::new(
                loc_bytes.into(),
                gimli::RunTimeEndian::Little,
            ));
            let location = dwarf::eval::evaluate(encoding, expr, pid, self.load_address)?;
            let value = dwarf::eval::read_value(pid, location, self.load_address)?;
            out.push(VariableView { name, location, value });
        }
        Ok(out)
    }

    pub fn entry_point(&self) -> GlobalAddress {
        self.entry_point
    }
}
