use clap::Parser;
use codex_arg0::arg0_dispatch_or_else;
use codex_cli::ClassifyCommand;
use codex_cli::LandlockCommand;
use codex_cli::SeatbeltCommand;
use codex_cli::classify::run_classify;
use codex_cli::debug_sandbox::run_command_under_landlock;
use codex_cli::debug_sandbox::run_command_under_seatbelt;
use tracing_subscriber::EnvFilter;

/// Codex CLI
#[derive(Debug, Parser)]
#[clap(author, version, bin_name = "codex")]
struct MultitoolCli {
    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Internal debugging commands.
    Debug(DebugArgs),
}

#[derive(Debug, Parser)]
struct DebugArgs {
    #[command(subcommand)]
    cmd: DebugCommand,
}

#[derive(Debug, clap::Subcommand)]
enum DebugCommand {
    /// Run a command under Seatbelt (macOS only).
    Seatbelt(SeatbeltCommand),

    /// Run a command under Landlock+seccomp (Linux only).
    Landlock(LandlockCommand),

    /// Print the safety decision for a command without running it.
    Classify(ClassifyCommand),
}

fn main() -> anyhow::Result<()> {
    arg0_dispatch_or_else(|codex_linux_sandbox_exe| async move {
        cli_main(codex_linux_sandbox_exe).await?;
        Ok(())
    })
}

async fn cli_main(codex_linux_sandbox_exe: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = MultitoolCli::parse();
    match cli.subcommand {
        Subcommand::Debug(debug_args) => match debug_args.cmd {
            DebugCommand::Seatbelt(seatbelt_command) => {
                run_command_under_seatbelt(seatbelt_command, codex_linux_sandbox_exe).await?;
            }
            DebugCommand::Landlock(landlock_command) => {
                run_command_under_landlock(landlock_command, codex_linux_sandbox_exe).await?;
            }
            DebugCommand::Classify(classify_command) => {
                run_classify(classify_command)?;
            }
        },
    }

    Ok(())
}
