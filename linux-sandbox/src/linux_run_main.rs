use std::ffi::CString;
use std::path::PathBuf;

use clap::Parser;
use codex_protocol::protocol::SandboxPolicy;

use crate::landlock::apply_sandbox_policy_to_current_thread;

#[derive(Debug, Parser)]
pub struct LandlockCommand {
    /// Directory the policy's workspace-relative roots resolve against.
    #[arg(long = "sandbox-policy-cwd")]
    pub sandbox_policy_cwd: PathBuf,

    /// The policy, as JSON.
    #[arg(long = "sandbox-policy")]
    pub sandbox_policy: SandboxPolicy,

    /// Full command args to run under the sandbox.
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

pub fn run_main() -> ! {
    let LandlockCommand {
        sandbox_policy_cwd,
        sandbox_policy,
        command,
    } = LandlockCommand::parse();

    if let Err(e) = apply_sandbox_policy_to_current_thread(&sandbox_policy, &sandbox_policy_cwd) {
        fail(&format!("error applying sandbox policy: {e}"));
    }

    if command.is_empty() {
        fail("no command specified to execute");
    }

    let c_command = match CString::new(command[0].as_str()) {
        Ok(c) => c,
        Err(_) => fail("command contains an interior NUL byte"),
    };
    let c_args: Vec<CString> = match command.iter().map(|arg| CString::new(arg.as_str())).collect() {
        Ok(args) => args,
        Err(_) => fail("argument contains an interior NUL byte"),
    };
    let mut c_args_ptrs: Vec<*const libc::c_char> = c_args.iter().map(|arg| arg.as_ptr()).collect();
    c_args_ptrs.push(std::ptr::null());

    unsafe {
        libc::execvp(c_command.as_ptr(), c_args_ptrs.as_ptr());
    }

    // If execvp returns, there was an error.
    let err = std::io::Error::last_os_error();
    fail(&format!("failed to execvp {}: {err}", command[0]));
}

fn fail(message: &str) -> ! {
    eprintln!("codex-linux-sandbox: {message}");
    std::process::exit(1);
}
