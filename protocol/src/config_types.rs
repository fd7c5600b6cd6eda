use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// How much effort a reasoning-capable model should spend before answering.
#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    #[default]
    Medium,
    High,
    /// Option to disable reasoning.
    None,
}

/// Granularity of the reasoning summary the model streams back.
#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReasoningSummary {
    #[default]
    Auto,
    Concise,
    Detailed,
    /// Option to disable reasoning summaries.
    None,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SandboxMode {
    #[default]
    ReadOnly,

    WorkspaceWrite,

    #[serde(alias = "danger-full-access")]
    NoRestriction,
}

/// Built-in tools that may be offered to the model on a turn. Each flag is
/// independent; external tools are governed by the configured servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolToggles {
    pub shell: bool,
    pub apply_patch: bool,
    pub update_plan: bool,
    /// PTY-backed `exec_command` / `write_stdin` / `close_session`.
    pub unified_exec: bool,
    pub external: bool,
}

impl Default for ToolToggles {
    fn default() -> Self {
        Self {
            shell: true,
            apply_patch: true,
            update_plan: true,
            unified_exec: false,
            external: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sandbox_mode_accepts_legacy_full_access_name() {
        let mode: SandboxMode = serde_json::from_str("\"danger-full-access\"").unwrap();
        assert_eq!(SandboxMode::NoRestriction, mode);
        assert_eq!("no-restriction", SandboxMode::NoRestriction.to_string());
    }

    #[test]
    fn tool_toggles_fill_missing_fields_with_defaults() {
        let toggles: ToolToggles = toml_like_json(r#"{"unified_exec": true}"#);
        assert_eq!(
            ToolToggles {
                unified_exec: true,
                ..ToolToggles::default()
            },
            toggles
        );
    }

    fn toml_like_json(s: &str) -> ToolToggles {
        serde_json::from_str(s).unwrap()
    }
}
