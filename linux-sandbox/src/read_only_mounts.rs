use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;

use codex_core::error::SandboxErr;
use tracing::debug;

/// Makes every existing path in `paths` read-only for this process and its
/// descendants by bind-mounting it onto itself read-only inside a private
/// mount namespace.
///
/// Landlock rules only ever grant access, so a read-only directory nested in a
/// writable root cannot be expressed as a landlock rule. Must run while the
/// process is single-threaded and before landlock is applied, because a
/// landlocked thread may not change its mounts.
pub(crate) fn remount_read_only(paths: &[PathBuf]) -> Result<(), SandboxErr> {
    let existing: Vec<&PathBuf> = paths.iter().filter(|path| path.exists()).collect();
    if existing.is_empty() {
        return Ok(());
    }

    enter_private_mount_namespace().map_err(SandboxErr::MountNamespace)?;
    for path in existing {
        bind_read_only(path).map_err(|source| SandboxErr::ReadOnlySubpath {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "remounted read-only");
    }
    Ok(())
}

/// Unshares a user namespace (mapping our own uid/gid onto themselves) plus a
/// mount namespace, then stops mount events propagating back to the host.
fn enter_private_mount_namespace() -> io::Result<()> {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    if unsafe { libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNS) } != 0 {
        return Err(io::Error::last_os_error());
    }
    std::fs::write("/proc/self/setgroups", "deny")?;
    std::fs::write("/proc/self/uid_map", format!("{uid} {uid} 1"))?;
    std::fs::write("/proc/self/gid_map", format!("{gid} {gid} 1"))?;

    mount(None, Path::new("/"), libc::MS_REC | libc::MS_PRIVATE)
}

fn bind_read_only(path: &Path) -> io::Result<()> {
    mount(Some(path), path, libc::MS_BIND | libc::MS_REC)?;
    // Flags inherited from the parent mount are locked in a user namespace; a
    // remount that drops them fails with EPERM.
    let locked = locked_mount_flags(path)?;
    mount(
        None,
        path,
        libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | locked,
    )
}

fn locked_mount_flags(path: &Path) -> io::Result<libc::c_ulong> {
    let c_path = c_path(path)?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut flags = 0;
    for (st_flag, ms_flag) in [
        (libc::ST_NOSUID, libc::MS_NOSUID),
        (libc::ST_NODEV, libc::MS_NODEV),
        (libc::ST_NOEXEC, libc::MS_NOEXEC),
        (libc::ST_NOATIME, libc::MS_NOATIME),
        (libc::ST_NODIRATIME, libc::MS_NODIRATIME),
        (libc::ST_RELATIME, libc::MS_RELATIME),
    ] {
        if stat.f_flag & st_flag != 0 {
            flags |= ms_flag;
        }
    }
    Ok(flags)
}

fn mount(source: Option<&Path>, target: &Path, flags: libc::c_ulong) -> io::Result<()> {
    let target = c_path(target)?;
    let source = source.map(c_path).transpose()?;
    let source_ptr = source
        .as_ref()
        .map_or(std::ptr::null(), |source| source.as_ptr());

    let rc = unsafe {
        libc::mount(
            source_ptr,
            target.as_ptr(),
            std::ptr::null(),
            flags,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}
