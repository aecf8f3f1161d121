//! Debugger application entry point.

mod debugger;
mod error;
mod ui;

use clap::Parser;

use debugger::Debugger;
use nix::unistd::Pid;
use ui::hook::TerminalHook;
use ui::repl::Repl;

#[derive(Parser, Debug)]
#[command(author, version, about = "A small native Linux x86-64 source-level debugger.")]
struct Args {
    /// Executable file to debug.
    program: String,

    /// Attach to this already-running pid instead of waiting for a `run` command. The REPL's
    /// `attach <pid>` command remains the primary way to do this; this flag is a startup-time
    /// convenience for the common "attach right away" case.
    #[arg(long)]
    attach: Option<i32>,

    /// Arguments passed to the debugee when started with `run`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut debugger = Debugger::new(&args.program, TerminalHook)?;
    if let Some(pid) = args.attach {
        debugger.attach(Pid::from_raw(pid))?;
    }
    let mut repl = Repl::new(debugger, args.args)?;
    repl.run()
}
