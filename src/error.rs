//! The core's typed error taxonomy. Kept deliberately small: everything here is a condition the
//! REPL can report and keep running after, never a reason to tear down the process.

use crate::debugger::address::GlobalAddress;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("malformed argument: {0}")]
    MalformedArgument(String),
    #[error("unknown register: {0}")]
    UnknownRegister(String),
    #[error("unknown dwarf register number: {0}")]
    UnknownDwarfRegister(u16),

    #[error("function not found: {0}")]
    FunctionNotFound(String),
    #[error("line entry not found for address {0}")]
    LineEntryNotFound(GlobalAddress),
    #[error("compilation unit not found for address {0}")]
    CompilationUnitNotFound(GlobalAddress),
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("unhandled variable location")]
    UnhandledVariableLocation,

    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("dwarf parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),

    #[error("the debugee is not running")]
    NotRunning,
    #[error("the debugee already ran")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Transform a `Result` into an `Option`, logging a warning on error. Used at the REPL boundary
/// so one bad command doesn't take the whole session down.
#[macro_export]
macro_rules! weak_error {
    ($res:expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "debugger", "{e}");
                None
            }
        }
    };
}
