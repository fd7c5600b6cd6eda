use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use tokio::process::Child;

use crate::protocol::SandboxPolicy;
use crate::spawn::CODEX_SANDBOX_ENV_VAR;
use crate::spawn::StdioPolicy;
use crate::spawn::spawn_child_async;

const MACOS_SEATBELT_BASE_POLICY: &str = include_str!("seatbelt_base_policy.sbpl");
const MACOS_SEATBELT_NETWORK_POLICY: &str = include_str!("seatbelt_network_policy.sbpl");

/// When working with `sandbox-exec`, only consider `sandbox-exec` in `/usr/bin`
/// to defend against an attacker trying to inject a malicious version on the
/// PATH. If /usr/bin/sandbox-exec has been tampered with, then the attacker
/// already has root access.
pub(crate) const MACOS_PATH_TO_SEATBELT_EXECUTABLE: &str = "/usr/bin/sandbox-exec";

pub async fn spawn_command_under_seatbelt(
    command: Vec<String>,
    sandbox_policy: &SandboxPolicy,
    cwd: PathBuf,
    stdio_policy: StdioPolicy,
    mut env: HashMap<String, String>,
) -> std::io::Result<Child> {
    let args = create_seatbelt_command_args(command, sandbox_policy, &cwd);
    let arg0 = None;
    env.insert(CODEX_SANDBOX_ENV_VAR.to_string(), "seatbelt".to_string());
    spawn_child_async(
        PathBuf::from(MACOS_PATH_TO_SEATBELT_EXECUTABLE),
        args,
        arg0,
        cwd,
        sandbox_policy,
        stdio_policy,
        env,
    )
    .await
}

/// Arguments for `sandbox-exec`: the policy text, one `-D` parameter per
/// writable root and protected subpath, then `--` and the command.
pub(crate) fn create_seatbelt_command_args(
    command: Vec<String>,
    sandbox_policy: &SandboxPolicy,
    cwd: &Path,
) -> Vec<String> {
    let (file_write_policy, extra_cli_args) = if sandbox_policy.has_full_disk_write_access() {
        // Allegedly, this is more permissive than `(allow file-write*)`.
        (
            r#"(allow file-write* (regex #"^/"))"#.to_string(),
            Vec::new(),
        )
    } else {
        let writable_roots = sandbox_policy.get_writable_roots_with_cwd(cwd);

        let mut writable_folder_policies: Vec<String> = Vec::new();
        let mut cli_args: Vec<String> = Vec::new();

        for (index, wr) in writable_roots.iter().enumerate() {
            // Canonicalize to avoid mismatches like /var vs /private/var on macOS.
            let canonical_root = wr.root.canonicalize().unwrap_or_else(|_| wr.root.clone());
            let root_param = format!("WRITABLE_ROOT_{index}");
            cli_args.push(format!(
                "-D{root_param}={}",
                canonical_root.to_string_lossy()
            ));

            if wr.read_only_subpaths.is_empty() {
                writable_folder_policies.push(format!("(subpath (param \"{root_param}\"))"));
            } else {
                // Add parameters for each read-only subpath and generate
                // the `(require-not ...)` clauses.
                let mut require_parts: Vec<String> = Vec::new();
                require_parts.push(format!("(subpath (param \"{root_param}\"))"));
                for (subpath_index, ro) in wr.read_only_subpaths.iter().enumerate() {
                    let canonical_ro = canonical_root.join(
                        ro.strip_prefix(&wr.root).unwrap_or(ro.as_path()),
                    );
                    let ro_param = format!("WRITABLE_ROOT_{index}_RO_{subpath_index}");
                    cli_args.push(format!("-D{ro_param}={}", canonical_ro.to_string_lossy()));
                    require_parts
                        .push(format!("(require-not (subpath (param \"{ro_param}\")))"));
                }
                let policy_component = format!("(require-all {} )", require_parts.join(" "));
                writable_folder_policies.push(policy_component);
            }
        }

        if writable_folder_policies.is_empty() {
            ("".to_string(), Vec::new())
        } else {
            let file_write_policy = format!(
                "(allow file-write*\n{}\n)",
                writable_folder_policies.join(" ")
            );
            (file_write_policy, cli_args)
        }
    };

    let network_policy = if sandbox_policy.has_full_network_access() {
        MACOS_SEATBELT_NETWORK_POLICY
    } else {
        ""
    };

    let full_policy = format!(
        "{MACOS_SEATBELT_BASE_POLICY}\n{file_write_policy}\n{network_policy}"
    );

    let mut seatbelt_args: Vec<String> = vec!["-p".to_string(), full_policy];
    seatbelt_args.extend(extra_cli_args);
    seatbelt_args.push("--".to_string());
    seatbelt_args.extend(command);
    seatbelt_args
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn policy_text(args: &[String]) -> &str {
        assert_eq!("-p", args[0]);
        &args[1]
    }

    #[test]
    fn read_only_policy_has_no_write_rules_or_params() {
        let cwd = TempDir::new().unwrap();
        let args = create_seatbelt_command_args(
            vec!["touch".to_string(), "x".to_string()],
            &SandboxPolicy::ReadOnly,
            cwd.path(),
        );
        assert!(!policy_text(&args).contains("(allow file-write*\n"));
        assert!(!policy_text(&args).contains("network-outbound"));
        assert_eq!(
            vec!["--".to_string(), "touch".to_string(), "x".to_string()],
            args[2..].to_vec()
        );
    }

    #[test]
    fn workspace_write_protects_git_under_each_root() {
        let cwd = TempDir::new().unwrap();
        let extra = TempDir::new().unwrap();
        let policy = SandboxPolicy::WorkspaceWrite {
            writable_roots: vec![extra.path().to_path_buf()],
            network_access: false,
            exclude_tmpdir_env_var: true,
            exclude_slash_tmp: true,
        };
        let args =
            create_seatbelt_command_args(vec!["ls".to_string()], &policy, cwd.path());

        let extra_root = extra.path().canonicalize().unwrap();
        let cwd_root = cwd.path().canonicalize().unwrap();
        let expected_params = vec![
            format!("-DWRITABLE_ROOT_0={}", extra_root.to_string_lossy()),
            format!(
                "-DWRITABLE_ROOT_0_RO_0={}",
                extra_root.join(".git").to_string_lossy()
            ),
            format!("-DWRITABLE_ROOT_1={}", cwd_root.to_string_lossy()),
            format!(
                "-DWRITABLE_ROOT_1_RO_0={}",
                cwd_root.join(".git").to_string_lossy()
            ),
        ];
        assert_eq!(expected_params, args[2..6].to_vec());
        assert!(policy_text(&args).contains(
            "(require-all (subpath (param \"WRITABLE_ROOT_0\")) (require-not (subpath (param \"WRITABLE_ROOT_0_RO_0\"))) )"
        ));
        assert_eq!(vec!["--".to_string(), "ls".to_string()], args[6..].to_vec());
    }

    #[test]
    fn network_rules_follow_policy() {
        let cwd = TempDir::new().unwrap();
        let policy = SandboxPolicy::WorkspaceWrite {
            writable_roots: vec![],
            network_access: true,
            exclude_tmpdir_env_var: true,
            exclude_slash_tmp: true,
        };
        let args = create_seatbelt_command_args(vec!["curl".to_string()], &policy, cwd.path());
        assert!(policy_text(&args).contains("(allow network-outbound)"));
    }
}
