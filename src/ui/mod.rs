//! The single-threaded REPL: a `rustyline`-backed command loop that drives a [`crate::debugger::Debugger`]
//! and renders its events to the terminal.

pub mod hook;
pub mod repl;
