//! Launching a fresh tracee. Attaching to an already-running process is handled directly by
//! the Tracer Core (`PTRACE_ATTACH` needs no child preparation); this module only covers the
//! fork+exec dance a freshly launched debugee goes through before it can be traced.

use std::marker::PhantomData;
use std::os::unix::process::CommandExt;
use std::process::Command;

use nix::sys;
use nix::sys::personality::Persona;
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::{Error, Result};

pub trait State {}

/// A child that has been `fork()`ed, called `PTRACE_TRACEME` and `execve`'d, and is now
/// stopped at its entry point waiting for the tracer.
pub struct Installed;
impl State for Installed {}

/// A child description that hasn't been forked yet.
pub struct Template;
impl State for Template {}

pub struct Child<S: State> {
    program: String,
    args: Vec<String>,
    pid: Option<Pid>,
    _p: PhantomData<S>,
}

impl Child<Template> {
    pub fn new<ARGS, I>(program: impl Into<String>, args: ARGS) -> Child<Template>
    where
        ARGS: IntoIterator<Item = I>,
        I: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            pid: None,
            _p: PhantomData,
        }
    }

    /// `fork()` + `PTRACE_TRACEME` + `execve`, disabling ASLR so DWARF addresses and
    /// `/proc/<pid>/maps` stay predictable across runs of the same binary.
    ///
    /// The child calls `PTRACE_TRACEME` then `execve`s; the kernel stops it with `SIGTRAP` right
    /// after the exec. This function returns as soon as the pid is known — it does *not* wait
    /// for that initial stop itself, so the caller's own `wait_for_signal` observes it exactly
    /// once (a second `waitpid` here would block forever: the child would already be stopped
    /// with nothing left to report).
    pub fn launch(&self) -> Result<Child<Installed>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        unsafe {
            cmd.pre_exec(|| {
                sys::ptrace::traceme()?;
                sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
                Ok(())
            });
        }

        match unsafe { fork() }.map_err(Error::Ptrace)? {
            ForkResult::Parent { child: pid } => Ok(Child {
                program: self.program.clone(),
                args: self.args.clone(),
                pid: Some(pid),
                _p: PhantomData,
            }),
            ForkResult::Child => {
                let err = cmd.exec();
                panic!("exec of debugee failed: {err}");
            }
        }
    }
}

impl Child<Installed> {
    pub fn pid(&self) -> Pid {
        self.pid.expect("an Installed child always has a pid")
    }
}
