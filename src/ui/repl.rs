//! Command loop: read a line, prefix-match it against the known commands, dispatch to the
//! [`Debugger`]. One command is handled per line; a failing command is reported and the loop
//! continues, matching the original debugger's `handle_command`.

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use nix::unistd::Pid;

use crate::debugger::address::RelocatedAddress;
use crate::debugger::register::Register;
use crate::debugger::{Debugger, StopReason};
use crate::error::Error;
use crate::ui::hook::print_source_context;

/// True when `input` is a non-empty prefix of `command` — the same rule the original debugger's
/// `is_prefix` uses to let users type `c`, `cont`, or `continue` interchangeably.
fn is_prefix(input: &str, command: &str) -> bool {
    !input.is_empty() && input.len() <= command.len() && command.starts_with(input)
}

pub struct Repl {
    debugger: Debugger,
    editor: DefaultEditor,
    default_args: Vec<String>,
}

impl Repl {
    pub fn new(debugger: Debugger, default_args: Vec<String>) -> anyhow::Result<Self> {
        Ok(Self { debugger, editor: DefaultEditor::new()?, default_args })
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match self.editor.readline("(rdbg) ") {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if !self.dispatch(line) {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
                Err(e) => {
                    log::error!(target: "repl", "readline error: {e}");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Returns `false` when the REPL should exit.
    fn dispatch(&mut self, line: &str) -> bool {
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else { return true };
        let rest: Vec<&str> = words.collect();

        let result = if is_prefix(cmd, "quit") {
            return false;
        } else if is_prefix(cmd, "run") {
            self.launch_args(&rest)
        } else if is_prefix(cmd, "attach") {
            self.attach(&rest)
        } else if is_prefix(cmd, "detach") {
            self.debugger.detach()
        } else if is_prefix(cmd, "continue") {
            self.debugger.cont().map(|_| ())
        } else if is_prefix(cmd, "step") {
            self.step_and_report(Debugger::step_in)
        } else if is_prefix(cmd, "next") {
            self.step_and_report(Debugger::step_over)
        } else if is_prefix(cmd, "finish") {
            self.step_and_report(Debugger::step_out)
        } else if is_prefix(cmd, "stepi") {
            self.step_and_report(Debugger::single_step_instruction)
        } else if is_prefix(cmd, "break") {
            self.set_breakpoint(&rest)
        } else if is_prefix(cmd, "delete") {
            self.remove_breakpoint(&rest)
        } else if is_prefix(cmd, "backtrace") {
            self.print_backtrace()
        } else if is_prefix(cmd, "variables") {
            self.print_variables()
        } else if is_prefix(cmd, "register") {
            self.register_command(&rest)
        } else if is_prefix(cmd, "memory") {
            self.memory_command(&rest)
        } else if is_prefix(cmd, "symbol") {
            self.print_symbol(&rest)
        } else {
            println!("unknown command: {cmd} (try: run, attach, detach, break, delete, continue, step, next, finish, stepi, backtrace, variables, register, memory, symbol, quit)");
            return true;
        };

        if let Err(e) = result {
            println!("error: {e}");
        }
        true
    }

    fn launch_args(&mut self, args: &[&str]) -> crate::error::Result<()> {
        let args = if args.is_empty() {
            self.default_args.clone()
        } else {
            args.iter().map(|s| s.to_string()).collect()
        };
        self.debugger.launch(args)
    }

    fn attach(&mut self, args: &[&str]) -> crate::error::Result<()> {
        let pid_arg = args
            .first()
            .ok_or_else(|| Error::MalformedArgument("attach requires a pid".into()))?;
        let pid: i32 = pid_arg
            .parse()
            .map_err(|_| Error::MalformedArgument(pid_arg.to_string()))?;
        self.debugger.attach(Pid::from_raw(pid))
    }

    /// Run a stepping operation and, when it lands on a place the resolver can name, print the
    /// source-context window — the stepping engine's own stops never go through `EventHook` (only
    /// ptrace-reported SIGTRAPs do), so the REPL prints this one explicitly.
    fn step_and_report(&mut self, op: fn(&mut Debugger) -> crate::error::Result<StopReason>) -> crate::error::Result<()> {
        match op(&mut self.debugger)? {
            StopReason::Breakpoint(pc, Some(place)) => {
                println!("Stopped at {pc}: {}:{}", place.file, place.line);
                print_source_context(&place.file, place.line);
            }
            StopReason::Breakpoint(pc, None) => println!("Stopped at {pc}"),
            StopReason::Signal(..) | StopReason::Exited(_) | StopReason::Stepped => {}
        }
        Ok(())
    }

    fn set_breakpoint(&mut self, args: &[&str]) -> crate::error::Result<()> {
        let location = args.first().ok_or_else(|| Error::MalformedArgument("break requires a location".into()))?;

        let addr = if let Some(hex) = location.strip_prefix("0x") {
            u64::from_str_radix(hex, 16)
                .ok()
                .map(RelocatedAddress::from)
        } else {
            None
        };

        if let Some(addr) = addr {
            println!("Setting breakpoint at address {addr}");
            self.debugger.set_breakpoint_at_addr(addr)
        } else if let Some((file, line)) = location.rsplit_once(':') {
            let line: u64 = line
                .parse()
                .map_err(|_| Error::MalformedArgument(location.to_string()))?;
            let addr = self.debugger.set_breakpoint_at_line(file, line)?;
            println!("Setting breakpoint at address {addr}: {file}:{line}");
            Ok(())
        } else {
            let addrs = self.debugger.set_breakpoint_at_function(location)?;
            for addr in addrs {
                println!("Setting breakpoint at address {addr}: {location}()");
            }
            Ok(())
        }
    }

    fn remove_breakpoint(&mut self, args: &[&str]) -> crate::error::Result<()> {
        let location = args
            .first()
            .ok_or_else(|| Error::MalformedArgument("delete requires an address".into()))?;
        let hex = location.strip_prefix("0x").unwrap_or(location);
        let addr = u64::from_str_radix(hex, 16)
            .map_err(|_| Error::MalformedArgument(location.to_string()))?;
        self.debugger.remove_breakpoint(RelocatedAddress::from(addr))
    }

    fn print_backtrace(&self) -> crate::error::Result<()> {
        for frame in self.debugger.backtrace()? {
            println!(
                "#{} {} {}",
                frame.number,
                frame.function_address,
                frame.function_name.as_deref().unwrap_or("??")
            );
        }
        Ok(())
    }

    fn print_variables(&self) -> crate::error::Result<()> {
        for var in self.debugger.list_variables()? {
            println!("{} = {} (0x{:x})", var.name, var.value, var.value);
        }
        Ok(())
    }

    fn print_registers(&self) -> crate::error::Result<()> {
        for (register, _, name) in crate::debugger::register::REGISTER_DESCRIPTORS {
            let value = self.debugger.get_register(register)?;
            println!("{name:<10} 0x{value:016x}");
        }
        Ok(())
    }

    fn register_command(&mut self, args: &[&str]) -> crate::error::Result<()> {
        match args {
            ["dump"] => self.print_registers(),
            ["read", name] => {
                let register: Register = name
                    .parse()
                    .map_err(|_| Error::UnknownRegister(name.to_string()))?;
                println!("0x{:016x}", self.debugger.get_register(register)?);
                Ok(())
            }
            ["write", name, value] => {
                let register: Register = name
                    .parse()
                    .map_err(|_| Error::UnknownRegister(name.to_string()))?;
                let value = parse_u64(value)?;
                self.debugger.set_register(register, value)
            }
            _ => Err(Error::MalformedArgument(
                "usage: register dump | register read <name> | register write <name> <value>".into(),
            )),
        }
    }

    fn memory_command(&mut self, args: &[&str]) -> crate::error::Result<()> {
        match args {
            ["read", addr] => {
                let addr = RelocatedAddress::from(parse_u64(addr)?);
                println!("0x{:016x}", self.debugger.read_memory(addr)?);
                Ok(())
            }
            ["write", addr, value] => {
                let addr = RelocatedAddress::from(parse_u64(addr)?);
                let value = parse_u64(value)?;
                self.debugger.write_memory(addr, value)
            }
            _ => Err(Error::MalformedArgument(
                "usage: memory read <addr> | memory write <addr> <value>".into(),
            )),
        }
    }

    fn print_symbol(&self, args: &[&str]) -> crate::error::Result<()> {
        let name = args
            .first()
            .ok_or_else(|| Error::MalformedArgument("symbol requires a name".into()))?;
        let matches = self.debugger.lookup_symbol(name);
        if matches.is_empty() {
            return Err(Error::SymbolNotFound(name.to_string()));
        }
        for (name, symbol) in matches {
            println!("{name} {} {}", symbol.kind.as_str(), symbol.addr);
        }
        Ok(())
    }
}

fn parse_u64(s: &str) -> crate::error::Result<u64> {
    let hex = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(hex, 16)
        .or_else(|_| s.parse())
        .map_err(|_| Error::MalformedArgument(s.to_string()))
}
