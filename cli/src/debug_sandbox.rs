use std::path::PathBuf;

use anyhow::Context;
use codex_core::config::Config;
use codex_core::config::ConfigOverrides;
use codex_core::exec_env::create_env;
use codex_core::landlock::spawn_command_under_linux_sandbox;
use codex_core::seatbelt::spawn_command_under_seatbelt;
use codex_core::spawn::StdioPolicy;
use codex_protocol::config_types::SandboxMode;
use tracing::debug;

use crate::LandlockCommand;
use crate::SeatbeltCommand;
use crate::exit_status::handle_exit_status;

pub async fn run_command_under_seatbelt(
    command: SeatbeltCommand,
    codex_linux_sandbox_exe: Option<PathBuf>,
) -> anyhow::Result<()> {
    let SeatbeltCommand { full_auto, command } = command;
    run_command_under_sandbox(
        full_auto,
        command,
        codex_linux_sandbox_exe,
        SandboxType::Seatbelt,
    )
    .await
}

pub async fn run_command_under_landlock(
    command: LandlockCommand,
    codex_linux_sandbox_exe: Option<PathBuf>,
) -> anyhow::Result<()> {
    let LandlockCommand { full_auto, command } = command;
    run_command_under_sandbox(
        full_auto,
        command,
        codex_linux_sandbox_exe,
        SandboxType::Landlock,
    )
    .await
}

#[derive(Debug)]
enum SandboxType {
    Seatbelt,
    Landlock,
}

async fn run_command_under_sandbox(
    full_auto: bool,
    command: Vec<String>,
    codex_linux_sandbox_exe: Option<PathBuf>,
    sandbox_type: SandboxType,
) -> anyhow::Result<()> {
    if command.is_empty() {
        anyhow::bail!("no command given");
    }
    let cwd = std::env::current_dir()?;
    let config = Config::load_with_overrides(ConfigOverrides {
        sandbox_mode: Some(create_sandbox_mode(full_auto)),
        codex_linux_sandbox_exe,
        cwd: Some(cwd.clone()),
        ..Default::default()
    })?;
    let env = create_env(&config.shell_environment_policy);
    debug!(?sandbox_type, policy = %config.sandbox_policy, "running command under sandbox");

    let mut child = match sandbox_type {
        SandboxType::Seatbelt => {
            spawn_command_under_seatbelt(
                command,
                &config.sandbox_policy,
                cwd,
                StdioPolicy::Inherit,
                env,
            )
            .await?
        }
        SandboxType::Landlock => {
            let codex_linux_sandbox_exe = config
                .codex_linux_sandbox_exe
                .context("codex-linux-sandbox executable not found")?;
            spawn_command_under_linux_sandbox(
                codex_linux_sandbox_exe,
                command,
                &config.sandbox_policy,
                cwd,
                StdioPolicy::Inherit,
                env,
            )
            .await?
        }
    };
    let status = child.wait().await?;

    handle_exit_status(status);
}

pub fn create_sandbox_mode(full_auto: bool) -> SandboxMode {
    if full_auto {
        SandboxMode::WorkspaceWrite
    } else {
        SandboxMode::ReadOnly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn full_auto_selects_workspace_write() {
        assert_eq!(SandboxMode::WorkspaceWrite, create_sandbox_mode(true));
        assert_eq!(SandboxMode::ReadOnly, create_sandbox_mode(false));
    }
}
