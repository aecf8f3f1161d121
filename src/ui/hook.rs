//! Renders [`EventHook`] notifications to the terminal. Kept separate from [`crate::debugger`]
//! so the core never prints anything itself.

use nix::libc::siginfo_t;
use nix::sys::signal::Signal;

use crate::debugger::address::RelocatedAddress;
use crate::debugger::{EventHook, SourcePlace};

/// Print a small window of source lines around `line`, with `>` marking the matched line —
/// the "source-context window" the original debugger prints on every stop it can resolve to a
/// place. Silently does nothing if `file` can't be read (e.g. the debugee's source tree isn't
/// present on this machine); that's normal and not worth an error.
pub fn print_source_context(file: &str, line: u64) {
    const WINDOW: u64 = 2;

    let Ok(contents) = std::fs::read_to_string(file) else {
        return;
    };
    let lines: Vec<&str> = contents.lines().collect();
    if line == 0 || line as usize > lines.len() {
        return;
    }

    let start = line.saturating_sub(WINDOW).max(1);
    let end = (line + WINDOW).min(lines.len() as u64);
    for n in start..=end {
        let marker = if n == line { ">" } else { " " };
        println!("{marker} {n:>4} {}", lines[(n - 1) as usize]);
    }
}

pub struct TerminalHook;

impl EventHook for TerminalHook {
    fn on_breakpoint(&self, pc: RelocatedAddress, place: Option<&SourcePlace>) {
        match place {
            Some(place) => {
                println!("Hit breakpoint at address {pc}: {}:{}", place.file, place.line);
                print_source_context(&place.file, place.line);
            }
            None => println!("Hit breakpoint at address {pc}"),
        }
    }

    fn on_signal(&self, signal: Signal, info: &siginfo_t) {
        match signal {
            Signal::SIGSEGV => println!("Yay, segfault. Reason: {}", info.si_code),
            other => println!("Got signal {other} \"{}\"", other.as_str()),
        }
    }

    fn on_exit(&self, code: i32) {
        println!("Debugee exited with code {code}");
    }
}
