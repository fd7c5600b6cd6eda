use std::collections::HashSet;

use codex_core::command_fingerprint;
use codex_core::config::Config;
use codex_core::config::ConfigOverrides;
use codex_core::safety::SafetyCheck;
use codex_core::safety::assess_command_safety;

use crate::ClassifyCommand;

/// Prints what the engine would decide for `command` under the given
/// policies, with no prior approvals, as one line of JSON. The command is
/// not run.
pub fn run_classify(command: ClassifyCommand) -> anyhow::Result<()> {
    let ClassifyCommand {
        approval_policy,
        sandbox_mode,
        with_escalated_permissions,
        command,
    } = command;

    let config = Config::load_with_overrides(ConfigOverrides {
        approval_policy: Some(approval_policy.into()),
        sandbox_mode: Some(sandbox_mode.into()),
        ..Default::default()
    })?;

    let check = assess_command_safety(
        &command,
        config.approval_policy,
        &config.sandbox_policy,
        &HashSet::new(),
        with_escalated_permissions,
    );

    println!("{}", render(&check, &command_fingerprint(&command))?);
    Ok(())
}

fn render(check: &SafetyCheck, fingerprint: &str) -> serde_json::Result<String> {
    let mut value = serde_json::to_value(check)?;
    if let Some(object) = value.as_object_mut() {
        object.insert(
            "fingerprint".to_string(),
            serde_json::Value::String(fingerprint.to_string()),
        );
    }
    serde_json::to_string(&value)
}
