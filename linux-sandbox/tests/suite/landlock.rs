#![expect(clippy::unwrap_used)]

use std::path::PathBuf;

use codex_core::config_types::ShellEnvironmentPolicy;
use codex_core::error::CodexErr;
use codex_core::error::SandboxErr;
use codex_core::exec::ExecParams;
use codex_core::exec::SandboxType;
use codex_core::exec::process_exec_tool_call;
use codex_core::exec_env::create_env;
use codex_core::protocol::SandboxPolicy;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

const TIMEOUT_MS: u64 = 5_000;

fn helper() -> Option<PathBuf> {
    Some(PathBuf::from(env!("CARGO_BIN_EXE_codex-linux-sandbox")))
}

async fn run_cmd(cmd: &[&str], writable_roots: &[PathBuf]) -> codex_core::error::Result<i32> {
    let cwd = std::env::current_dir().unwrap();
    let params = ExecParams {
        command: cmd.iter().map(|s| s.to_string()).collect(),
        cwd: cwd.clone(),
        timeout_ms: Some(TIMEOUT_MS),
        env: create_env(&ShellEnvironmentPolicy::default()),
        with_escalated_permissions: None,
        justification: None,
    };
    let sandbox_policy = SandboxPolicy::WorkspaceWrite {
        writable_roots: writable_roots.to_vec(),
        network_access: false,
        exclude_tmpdir_env_var: true,
        exclude_slash_tmp: true,
    };
    let output = process_exec_tool_call(
        params,
        SandboxType::LinuxSeccomp,
        &sandbox_policy,
        &cwd,
        &helper(),
        None,
        &CancellationToken::new(),
    )
    .await?;
    Ok(output.exit_code)
}

/// Landlock is missing on some CI kernels; skip rather than fail there.
fn landlock_unavailable(err: &CodexErr) -> bool {
    matches!(err, CodexErr::Sandbox(SandboxErr::Denied { output }) if output.stderr.text.contains("error applying sandbox policy"))
}

#[tokio::test]
async fn reads_are_allowed_everywhere() {
    match run_cmd(&["cat", "/proc/self/status"], &[]).await {
        Ok(code) => assert_eq!(0, code),
        Err(err) if landlock_unavailable(&err) => {}
        Err(err) => panic!("unexpected error: {err:?}"),
    }
}

#[tokio::test]
async fn writes_inside_a_writable_root_are_allowed() {
    let tmpfile = NamedTempFile::new().unwrap();
    let root = tmpfile.path().parent().unwrap().to_path_buf();
    let target = tmpfile.path().to_string_lossy().to_string();
    match run_cmd(&["bash", "-c", &format!("echo hi > {target}")], &[root]).await {
        Ok(code) => assert_eq!(0, code),
        Err(err) if landlock_unavailable(&err) => {}
        Err(err) => panic!("unexpected error: {err:?}"),
    }
}

#[tokio::test]
async fn writes_outside_writable_roots_are_denied() {
    let tmpfile = NamedTempFile::new().unwrap();
    let target = tmpfile.path().to_string_lossy().to_string();
    let result = run_cmd(&["bash", "-c", &format!("echo hi > {target}")], &[]).await;
    assert!(
        matches!(result, Err(CodexErr::Sandbox(SandboxErr::Denied { .. }))),
        "expected denial, got {result:?}"
    );
}

#[tokio::test]
async fn network_is_denied_without_network_access() {
    let result = run_cmd(&["bash", "-c", "exec 3<>/dev/tcp/127.0.0.1/9"], &[]).await;
    assert!(
        matches!(result, Err(CodexErr::Sandbox(SandboxErr::Denied { .. }))),
        "expected denial, got {result:?}"
    );
}

#[tokio::test]
async fn git_dir_inside_a_writable_root_stays_read_only() {
    let root = tempfile::tempdir().unwrap();
    let git_dir = root.path().join(".git");
    std::fs::create_dir(&git_dir).unwrap();
    let git_config = git_dir.join("config");
    std::fs::write(&git_config, "[core]\n").unwrap();
    let roots = [root.path().to_path_buf()];

    let sibling = root.path().join("notes.txt");
    match run_cmd(
        &["bash", "-c", &format!("echo ok > {}", sibling.display())],
        &roots,
    )
    .await
    {
        Ok(code) => assert_eq!(0, code),
        // No landlock or no unprivileged user namespaces on this host.
        Err(err) if landlock_unavailable(&err) => return,
        Err(err) => panic!("unexpected error: {err:?}"),
    }
    assert_eq!("ok\n", std::fs::read_to_string(&sibling).unwrap());

    let result = run_cmd(
        &["bash", "-c", &format!("echo pwned > {}", git_config.display())],
        &roots,
    )
    .await;
    assert!(
        matches!(result, Err(CodexErr::Sandbox(SandboxErr::Denied { .. }))),
        "expected denial, got {result:?}"
    );
    assert_eq!("[core]\n", std::fs::read_to_string(&git_config).unwrap());

    let result = run_cmd(
        &["bash", "-c", &format!("rm -rf {}", git_dir.display())],
        &roots,
    )
    .await;
    assert!(result.is_err(), "expected denial, got {result:?}");
    assert!(git_config.exists());
}
