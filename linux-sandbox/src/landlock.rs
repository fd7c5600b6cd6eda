use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use codex_core::error::CodexErr;
use codex_core::error::Result;
use codex_core::error::SandboxErr;
use codex_protocol::protocol::SandboxPolicy;

use landlock::ABI;
use landlock::Access;
use landlock::AccessFs;
use landlock::CompatLevel;
use landlock::Compatible;
use landlock::Ruleset;
use landlock::RulesetAttr;
use landlock::RulesetCreatedAttr;
use landlock::RulesetStatus;
use landlock::path_beneath_rules;

use seccompiler::BpfProgram;
use seccompiler::SeccompAction;
use seccompiler::SeccompCmpArgLen;
use seccompiler::SeccompCmpOp;
use seccompiler::SeccompCondition;
use seccompiler::SeccompFilter;
use seccompiler::SeccompRule;
use seccompiler::TargetArch;
use seccompiler::apply_filter;
use tracing::debug;

use crate::read_only_mounts::remount_read_only;

#[cfg(target_arch = "x86_64")]
const TARGET_ARCH: TargetArch = TargetArch::x86_64;
#[cfg(target_arch = "aarch64")]
const TARGET_ARCH: TargetArch = TargetArch::aarch64;

/// Applies the policy to the calling thread. Called right before `execvp`,
/// so the restrictions are inherited by the command and everything it spawns.
/// Read-only subpaths of writable roots (such as `.git`) are enforced with a
/// read-only bind mount, since landlock can only widen access.
pub(crate) fn apply_sandbox_policy_to_current_thread(
    sandbox_policy: &SandboxPolicy,
    cwd: &Path,
) -> Result<()> {
    let writable_roots = if sandbox_policy.has_full_disk_write_access() {
        None
    } else {
        Some(sandbox_policy.get_writable_roots_with_cwd(cwd))
    };

    // Mounts first: neither seccomp nor landlock may be in place yet.
    if let Some(writable_roots) = &writable_roots {
        let read_only_subpaths: Vec<PathBuf> = writable_roots
            .iter()
            .flat_map(|writable_root| writable_root.read_only_subpaths.iter().cloned())
            .collect();
        remount_read_only(&read_only_subpaths)?;
    }

    if !sandbox_policy.has_full_network_access() {
        install_network_seccomp_filter_on_current_thread()?;
    }

    if let Some(writable_roots) = writable_roots {
        install_filesystem_landlock_rules_on_current_thread(
            writable_roots
                .into_iter()
                .map(|writable_root| writable_root.root)
                .collect(),
        )?;
    }

    Ok(())
}

/// Read access everywhere, write access only under `writable_roots` and
/// `/dev/null`.
fn install_filesystem_landlock_rules_on_current_thread(writable_roots: Vec<PathBuf>) -> Result<()> {
    let abi = ABI::V5;
    let access_rw = AccessFs::from_all(abi);
    let access_ro = AccessFs::from_read(abi);
    debug!(?writable_roots, "installing landlock rules");

    let mut ruleset = Ruleset::default()
        .set_compatibility(CompatLevel::BestEffort)
        .handle_access(access_rw)?
        .create()?
        .add_rules(path_beneath_rules(&["/"], access_ro))?
        .add_rules(path_beneath_rules(&["/dev/null"], access_rw))?
        .set_no_new_privs(true);

    if !writable_roots.is_empty() {
        ruleset = ruleset.add_rules(path_beneath_rules(&writable_roots, access_rw))?;
    }

    let status = ruleset.restrict_self()?;
    if status.ruleset == RulesetStatus::NotEnforced {
        return Err(CodexErr::Sandbox(SandboxErr::LandlockRestrict));
    }

    Ok(())
}

/// Denies every network syscall except those on AF_UNIX sockets, which local
/// tooling relies on.
fn install_network_seccomp_filter_on_current_thread() -> std::result::Result<(), SandboxErr> {
    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();

    for nr in [
        libc::SYS_connect,
        libc::SYS_accept,
        libc::SYS_accept4,
        libc::SYS_bind,
        libc::SYS_listen,
        libc::SYS_getpeername,
        libc::SYS_getsockname,
        libc::SYS_shutdown,
        libc::SYS_sendto,
        libc::SYS_sendmsg,
        libc::SYS_sendmmsg,
        libc::SYS_recvmsg,
        libc::SYS_recvmmsg,
        libc::SYS_getsockopt,
        libc::SYS_setsockopt,
        libc::SYS_ptrace,
    ] {
        // An empty rule list means "always match".
        rules.insert(nr, vec![]);
    }

    // socket(domain, ...) and socketpair are allowed for AF_UNIX only.
    let unix_only_rule = SeccompRule::new(vec![SeccompCondition::new(
        0,
        SeccompCmpArgLen::Dword,
        SeccompCmpOp::Ne,
        libc::AF_UNIX as u64,
    )?])?;
    rules.insert(libc::SYS_socket, vec![unix_only_rule.clone()]);
    rules.insert(libc::SYS_socketpair, vec![unix_only_rule]);

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM as u32),
        TARGET_ARCH,
    )?;
    let prog: BpfProgram = filter.try_into()?;
    apply_filter(&prog)?;
    debug!("network seccomp filter installed");

    Ok(())
}
