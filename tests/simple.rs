//! Black-box sessions against the compiled binary, driven over a pty — the REPL has no other
//! API, so this is how the original debugger's own test suite exercises it too.
//!
//! Each test forks and ptrace-controls its own child, but they're run `#[serial]` anyway: the
//! pty pool and the ptrace scope sysctl some CI containers set are both machine-wide, so running
//! these concurrently with default cargo-test parallelism is a known source of flakiness the
//! teacher's own integration suite works around the same way.

use std::ops::Add;
use std::process::Command;

use assert_cmd::cargo::CommandCargoExt;
use rexpect::session::PtySession;
use serial_test::serial;

fn spawn_against(program: &str, args: &[&str]) -> PtySession {
    let mut cmd = Command::cargo_bin("rdbg").unwrap();
    cmd.arg(program);
    cmd.args(args);

    let program_line = cmd.get_program().to_string_lossy().to_string()
        + &cmd
            .get_args()
            .fold(String::new(), |res: String, a| res.add(" ").add(&a.to_string_lossy()));

    rexpect::spawn(&program_line, Some(5000)).unwrap()
}

#[test]
#[serial]
fn run_then_continue_exits_debugee() {
    let mut session = spawn_against("/bin/true", &[]);
    session.send_line("run").unwrap();
    session.send_line("continue").unwrap();
    session.exp_string("Debugee exited with code 0").unwrap();
    session.send_line("quit").unwrap();
}

#[test]
#[serial]
fn register_dump_requires_a_running_debugee() {
    let mut session = spawn_against("/bin/true", &[]);
    session.send_line("register dump").unwrap();
    session.exp_string("error: the debugee is not running").unwrap();
    session.send_line("quit").unwrap();
}

#[test]
#[serial]
fn breakpoint_at_current_pc_is_hit_immediately() {
    let mut session = spawn_against("/bin/sleep", &["5"]);
    session.send_line("run").unwrap();

    session.send_line("register read rip").unwrap();
    let (_, rip) = session.exp_regex(r"0x[0-9a-f]{16}").unwrap();

    session.send_line(&format!("break {rip}")).unwrap();
    session.exp_string("Setting breakpoint at address").unwrap();

    session.send_line("continue").unwrap();
    session.exp_string("Hit breakpoint at address").unwrap();

    session.send_line("quit").unwrap();
}

#[test]
#[serial]
fn unknown_command_is_reported_without_killing_the_session() {
    let mut session = spawn_against("/bin/true", &[]);
    session.send_line("frobnicate").unwrap();
    session.exp_string("unknown command: frobnicate").unwrap();
    session.send_line("quit").unwrap();
}

#[test]
#[serial]
fn detach_disables_breakpoints_and_stops_tracing() {
    let mut session = spawn_against("/bin/sleep", &["5"]);
    session.send_line("run").unwrap();

    session.send_line("register read rip").unwrap();
    let (_, rip) = session.exp_regex(r"0x[0-9a-f]{16}").unwrap();

    session.send_line(&format!("break {rip}")).unwrap();
    session.exp_string("Setting breakpoint at address").unwrap();

    session.send_line("detach").unwrap();
    session.send_line("register dump").unwrap();
    session.exp_string("error: the debugee is not running").unwrap();

    session.send_line("quit").unwrap();
}

#[test]
#[serial]
fn attach_requires_a_numeric_pid() {
    let mut session = spawn_against("/bin/true", &[]);
    session.send_line("attach notapid").unwrap();
    session.exp_string("error: malformed argument").unwrap();
    session.send_line("quit").unwrap();
}
