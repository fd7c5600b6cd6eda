use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use tokio::process::Child;

use crate::protocol::SandboxPolicy;
use crate::spawn::StdioPolicy;
use crate::spawn::spawn_child_async;

/// Spawns `command` through the `codex-linux-sandbox` helper, which installs
/// landlock and seccomp in its own process and then execs the command. The
/// policy travels as JSON, so the helper sees exactly what the engine decided.
pub async fn spawn_command_under_linux_sandbox<P>(
    codex_linux_sandbox_exe: P,
    command: Vec<String>,
    sandbox_policy: &SandboxPolicy,
    cwd: PathBuf,
    stdio_policy: StdioPolicy,
    env: HashMap<String, String>,
) -> std::io::Result<Child>
where
    P: AsRef<Path>,
{
    let args = create_linux_sandbox_command_args(command, sandbox_policy, &cwd)?;
    let arg0 = Some("codex-linux-sandbox");
    spawn_child_async(
        codex_linux_sandbox_exe.as_ref().to_path_buf(),
        args,
        arg0,
        cwd,
        sandbox_policy,
        stdio_policy,
        env,
    )
    .await
}

/// Converts the sandbox policy into the CLI invocation for `codex-linux-sandbox`.
pub(crate) fn create_linux_sandbox_command_args(
    command: Vec<String>,
    sandbox_policy: &SandboxPolicy,
    cwd: &Path,
) -> std::io::Result<Vec<String>> {
    let sandbox_policy_cwd = cwd.to_string_lossy().to_string();
    let sandbox_policy_json = serde_json::to_string(sandbox_policy).map_err(std::io::Error::other)?;

    let mut linux_cmd: Vec<String> = vec![
        "--sandbox-policy-cwd".to_string(),
        sandbox_policy_cwd,
        "--sandbox-policy".to_string(),
        sandbox_policy_json,
        "--".to_string(),
    ];
    linux_cmd.extend(command);

    Ok(linux_cmd)
}
