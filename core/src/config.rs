use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;
use tracing::info;

use crate::config_types::McpServerConfig;
use crate::config_types::SandboxWorkspaceWrite;
use crate::config_types::ShellEnvironmentPolicy;
use crate::config_types::ShellEnvironmentPolicyToml;
use crate::config_types::ToolsToml;
use crate::error::CodexErr;
use crate::error::Result;
use crate::exec::DEFAULT_EXEC_TIMEOUT_MS;
use crate::protocol::AskForApproval;
use crate::protocol::SandboxPolicy;
use codex_protocol::config_types::ReasoningEffort;
use codex_protocol::config_types::ReasoningSummary;
use codex_protocol::config_types::SandboxMode;
use codex_protocol::config_types::ToolToggles;

pub const OPENAI_DEFAULT_MODEL: &str = "gpt-5-codex";

const CONFIG_TOML_FILE: &str = "config.toml";

/// Default number of times a failed model stream is retried before the turn
/// fails.
pub const DEFAULT_STREAM_MAX_RETRIES: u64 = 5;

/// Hard cap on a user-configured stream retry count.
const MAX_STREAM_MAX_RETRIES: u64 = 100;

/// Application configuration loaded from disk and merged with overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Optional override of model selection.
    pub model: String,

    pub model_reasoning_effort: Option<ReasoningEffort>,

    pub model_reasoning_summary: ReasoningSummary,

    /// Approval policy for executing commands.
    pub approval_policy: AskForApproval,

    pub sandbox_policy: SandboxPolicy,

    pub shell_environment_policy: ShellEnvironmentPolicy,

    /// Built-in tools offered to the model.
    pub tools: ToolToggles,

    /// Definition for external tool servers.
    pub mcp_servers: HashMap<String, McpServerConfig>,

    /// Default per-command timeout for shell-family tools.
    pub default_exec_timeout_ms: u64,

    /// Maximum number of retries for a dropped model stream.
    pub stream_max_retries: u64,

    /// Base instructions override.
    pub base_instructions: Option<String>,

    /// The directory that should be treated as the current working directory
    /// for the session. All relative paths inside the business-logic layer are
    /// resolved against this path.
    pub cwd: PathBuf,

    /// Directory containing all Codex state (defaults to `~/.codex` but can be
    /// overridden by the `CODEX_HOME` environment variable).
    pub codex_home: PathBuf,

    /// Path to the `codex-linux-sandbox` executable. This must be set if
    /// [`crate::exec::SandboxType::LinuxSeccomp`] is used. Note that this
    /// cannot be set in the config file: it must be set in code via
    /// [`ConfigOverrides`].
    ///
    /// When this program is invoked, arg0 will be set to `codex-linux-sandbox`.
    pub codex_linux_sandbox_exe: Option<PathBuf>,
}

/// Base config deserialized from ~/.codex/config.toml.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ConfigToml {
    pub model: Option<String>,

    pub model_reasoning_effort: Option<ReasoningEffort>,
    pub model_reasoning_summary: Option<ReasoningSummary>,

    /// Default approval policy for executing commands.
    pub approval_policy: Option<AskForApproval>,

    #[serde(default)]
    pub shell_environment_policy: ShellEnvironmentPolicyToml,

    /// Sandbox mode to use.
    pub sandbox_mode: Option<SandboxMode>,

    /// Sandbox configuration to apply if `sandbox_mode` is `workspace-write`.
    pub sandbox_workspace_write: Option<SandboxWorkspaceWrite>,

    #[serde(default)]
    pub tools: ToolsToml,

    #[serde(default)]
    pub mcp_servers: HashMap<String, McpServerConfig>,

    pub default_exec_timeout_ms: Option<u64>,

    pub stream_max_retries: Option<u64>,

    pub base_instructions: Option<String>,
}

impl ConfigToml {
    /// Derive the effective sandbox policy from the configuration.
    fn derive_sandbox_policy(&self, sandbox_mode_override: Option<SandboxMode>) -> SandboxPolicy {
        let resolved_sandbox_mode = sandbox_mode_override
            .or(self.sandbox_mode)
            .unwrap_or_default();
        match resolved_sandbox_mode {
            SandboxMode::ReadOnly => SandboxPolicy::new_read_only_policy(),
            SandboxMode::WorkspaceWrite => match self.sandbox_workspace_write.as_ref() {
                Some(SandboxWorkspaceWrite {
                    writable_roots,
                    network_access,
                    exclude_tmpdir_env_var,
                    exclude_slash_tmp,
                }) => SandboxPolicy::WorkspaceWrite {
                    writable_roots: writable_roots.clone(),
                    network_access: *network_access,
                    exclude_tmpdir_env_var: *exclude_tmpdir_env_var,
                    exclude_slash_tmp: *exclude_slash_tmp,
                },
                None => SandboxPolicy::new_workspace_write_policy(),
            },
            SandboxMode::NoRestriction => SandboxPolicy::NoRestriction,
        }
    }
}

/// Optional overrides for user configuration (e.g., from CLI flags).
#[derive(Default, Debug, Clone)]
pub struct ConfigOverrides {
    pub model: Option<String>,
    pub cwd: Option<PathBuf>,
    pub approval_policy: Option<AskForApproval>,
    pub sandbox_mode: Option<SandboxMode>,
    pub codex_linux_sandbox_exe: Option<PathBuf>,
    pub base_instructions: Option<String>,
    pub tools: Option<ToolToggles>,
}

impl Config {
    /// Load `config.toml` from [`find_codex_home`] and apply `overrides`.
    pub fn load_with_overrides(overrides: ConfigOverrides) -> Result<Self> {
        let codex_home = find_codex_home()?;
        let cfg = load_config_toml(&codex_home)?;
        Self::load_from_base_config_with_overrides(cfg, overrides, codex_home)
    }

    /// Meant to be used exclusively for tests: `load_with_overrides()` should
    /// be used in all other cases.
    pub fn load_from_base_config_with_overrides(
        cfg: ConfigToml,
        overrides: ConfigOverrides,
        codex_home: PathBuf,
    ) -> Result<Self> {
        let ConfigOverrides {
            model,
            cwd,
            approval_policy,
            sandbox_mode,
            codex_linux_sandbox_exe,
            base_instructions,
            tools,
        } = overrides;

        let sandbox_policy = cfg.derive_sandbox_policy(sandbox_mode);

        let resolved_cwd = match cwd {
            None => {
                info!("cwd not set, using current dir");
                std::env::current_dir()?
            }
            Some(p) if p.is_absolute() => p,
            Some(p) => {
                // Resolve relative path against the current working directory.
                info!("cwd is relative, resolving against current dir");
                let mut current = std::env::current_dir()?;
                current.push(p);
                current
            }
        };

        let default_exec_timeout_ms = cfg
            .default_exec_timeout_ms
            .unwrap_or(DEFAULT_EXEC_TIMEOUT_MS);
        if default_exec_timeout_ms == 0 {
            return Err(CodexErr::InvalidConfig(
                "default_exec_timeout_ms must be greater than zero".to_string(),
            ));
        }

        let tools = tools.unwrap_or_else(|| cfg.tools.apply_to(ToolToggles::default()));

        Ok(Self {
            model: model
                .or(cfg.model)
                .unwrap_or_else(|| OPENAI_DEFAULT_MODEL.to_string()),
            model_reasoning_effort: cfg.model_reasoning_effort,
            model_reasoning_summary: cfg.model_reasoning_summary.unwrap_or_default(),
            approval_policy: approval_policy
                .or(cfg.approval_policy)
                .unwrap_or_default(),
            sandbox_policy,
            shell_environment_policy: cfg.shell_environment_policy.into(),
            tools,
            mcp_servers: cfg.mcp_servers,
            default_exec_timeout_ms,
            stream_max_retries: cfg
                .stream_max_retries
                .unwrap_or(DEFAULT_STREAM_MAX_RETRIES)
                .min(MAX_STREAM_MAX_RETRIES),
            base_instructions: base_instructions.or(cfg.base_instructions),
            cwd: resolved_cwd,
            codex_home,
            codex_linux_sandbox_exe,
        })
    }
}

/// Reads `config.toml` under `codex_home`. A missing file yields the default
/// configuration; a malformed one is an error.
pub fn load_config_toml(codex_home: &Path) -> Result<ConfigToml> {
    let path = codex_home.join(CONFIG_TOML_FILE);
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{} not found, using defaults", path.display());
            Ok(ConfigToml::default())
        }
        Err(e) => Err(e.into()),
    }
}

/// Returns the path to the Codex configuration directory, which can be
/// specified by the `CODEX_HOME` environment variable. If not set, defaults to
/// `~/.codex`.
///
/// - If `CODEX_HOME` is set, the value will be canonicalized and this
///   function will Err if the path does not exist.
/// - If `CODEX_HOME` is not set, this function does not verify that the
///   directory exists.
pub fn find_codex_home() -> std::io::Result<PathBuf> {
    // Honor the `CODEX_HOME` environment variable when it is set to allow users
    // (and tests) to override the default location.
    if let Ok(val) = std::env::var("CODEX_HOME")
        && !val.is_empty()
    {
        return PathBuf::from(val).canonicalize();
    }

    let mut p = dirs::home_dir().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not find home directory",
        )
    })?;
    p.push(".codex");
    Ok(p)
}
