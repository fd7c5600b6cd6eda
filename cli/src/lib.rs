pub mod classify;
pub mod debug_sandbox;
mod exit_status;

use clap::Parser;
use clap::ValueEnum;
use codex_core::protocol::AskForApproval;
use codex_protocol::config_types::SandboxMode;

#[derive(Debug, Parser)]
pub struct SeatbeltCommand {
    /// Convenience alias for low-friction sandboxed automatic execution
    /// (workspace-write sandbox instead of read-only).
    #[arg(long = "full-auto", default_value_t = false)]
    pub full_auto: bool,

    /// Full command args to run under seatbelt.
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Parser)]
pub struct LandlockCommand {
    /// Convenience alias for low-friction sandboxed automatic execution
    /// (workspace-write sandbox instead of read-only).
    #[arg(long = "full-auto", default_value_t = false)]
    pub full_auto: bool,

    /// Full command args to run under landlock.
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Parser)]
pub struct ClassifyCommand {
    #[arg(long = "approval-policy", value_enum, default_value_t = ApprovalModeCliArg::OnRequest)]
    pub approval_policy: ApprovalModeCliArg,

    #[arg(long = "sandbox-mode", value_enum, default_value_t = SandboxModeCliArg::ReadOnly)]
    pub sandbox_mode: SandboxModeCliArg,

    /// Treat the command as one the model asked to run outside the sandbox.
    #[arg(long = "escalated", default_value_t = false)]
    pub with_escalated_permissions: bool,

    /// The command to classify. It is not run.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// `--approval-policy` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum ApprovalModeCliArg {
    /// Only known-safe read-only commands run without asking.
    Untrusted,
    /// Run everything in the sandbox; ask only when a sandboxed run fails.
    OnFailure,
    /// The model decides when to ask.
    OnRequest,
    /// Never ask; failures go straight back to the model.
    Never,
}

impl From<ApprovalModeCliArg> for AskForApproval {
    fn from(value: ApprovalModeCliArg) -> Self {
        match value {
            ApprovalModeCliArg::Untrusted => AskForApproval::UnlessTrusted,
            ApprovalModeCliArg::OnFailure => AskForApproval::OnFailure,
            ApprovalModeCliArg::OnRequest => AskForApproval::OnRequest,
            ApprovalModeCliArg::Never => AskForApproval::Never,
        }
    }
}

/// `--sandbox-mode` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum SandboxModeCliArg {
    ReadOnly,
    WorkspaceWrite,
    NoRestriction,
}

impl From<SandboxModeCliArg> for SandboxMode {
    fn from(value: SandboxModeCliArg) -> Self {
        match value {
            SandboxModeCliArg::ReadOnly => SandboxMode::ReadOnly,
            SandboxModeCliArg::WorkspaceWrite => SandboxMode::WorkspaceWrite,
            SandboxModeCliArg::NoRestriction => SandboxMode::NoRestriction,
        }
    }
}
