//! `codex-linux-sandbox`: confines itself with landlock and seccomp, then
//! execs the target command. Invoked by the engine with
//! `--sandbox-policy-cwd <dir> --sandbox-policy <json> -- <cmd…>`.

#[cfg(target_os = "linux")]
mod landlock;
#[cfg(target_os = "linux")]
mod linux_run_main;
#[cfg(target_os = "linux")]
mod read_only_mounts;

#[cfg(target_os = "linux")]
pub fn run_main() -> ! {
    linux_run_main::run_main();
}

#[cfg(not(target_os = "linux"))]
pub fn run_main() -> ! {
    eprintln!("codex-linux-sandbox is only supported on Linux");
    std::process::exit(1);
}
