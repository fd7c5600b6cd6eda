//! argv[0] dispatch, so a single `codex` executable can also serve as the
//! Linux sandbox helper and as `apply_patch`.

use std::future::Future;
use std::path::Path;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::symlink;
use tempfile::TempDir;

const LINUX_SANDBOX_ARG0: &str = "codex-linux-sandbox";
const APPLY_PATCH_ARG0: &str = "apply_patch";
const MISSPELLED_APPLY_PATCH_ARG0: &str = "applypatch";

/// Environment keys a `.env` file may never set.
const ILLEGAL_ENV_VAR_PREFIX: &str = "CODEX_";

/// Wraps the `main` of a binary crate.
///
/// Invoked as `codex-linux-sandbox`, this runs
/// [`codex_linux_sandbox::run_main`] and never returns; invoked as
/// `apply_patch`, it applies the patch given as the first argument.
/// Otherwise it:
///
/// 1. loads `$CODEX_HOME/.env` and `./.env`, skipping `CODEX_*` keys, while
///    the process is still single-threaded;
/// 2. puts an `apply_patch` alias of the current executable on `PATH` so
///    sandboxed shell commands can call it;
/// 3. starts a multi-thread Tokio runtime and runs `main_fn` in it, passing
///    the path the engine should re-invoke as the Linux helper (`None` off
///    Linux).
pub fn arg0_dispatch_or_else<F, Fut>(main_fn: F) -> anyhow::Result<()>
where
    F: FnOnce(Option<PathBuf>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let argv0 = std::env::args_os().next().unwrap_or_default();
    let exe_name = Path::new(&argv0)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("");

    match exe_name {
        LINUX_SANDBOX_ARG0 => codex_linux_sandbox::run_main(),
        APPLY_PATCH_ARG0 | MISSPELLED_APPLY_PATCH_ARG0 => codex_apply_patch::main(),
        _ => {}
    }

    load_dotenv();

    // Held for the life of the process; dropping it removes the alias.
    let _path_entry = prepend_path_entry_for_apply_patch()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let codex_linux_sandbox_exe = if cfg!(target_os = "linux") {
            std::env::current_exe().ok()
        } else {
            None
        };
        main_fn(codex_linux_sandbox_exe).await
    })
}

fn load_dotenv() {
    if let Ok(codex_home) = codex_core::config::find_codex_home()
        && let Ok(iter) = dotenvy::from_path_iter(codex_home.join(".env"))
    {
        set_filtered(iter);
    }

    if let Ok(iter) = dotenvy::dotenv_iter() {
        set_filtered(iter);
    }
}

fn set_filtered<I>(iter: I)
where
    I: IntoIterator<Item = Result<(String, String), dotenvy::Error>>,
{
    for (key, value) in iter.into_iter().flatten() {
        if is_allowed_dotenv_key(&key) {
            // SAFETY: called before the runtime starts, while the process is
            // single-threaded.
            unsafe { std::env::set_var(&key, &value) };
        }
    }
}

fn is_allowed_dotenv_key(key: &str) -> bool {
    !key.to_ascii_uppercase().starts_with(ILLEGAL_ENV_VAR_PREFIX)
}

fn prepend_path_entry_for_apply_patch() -> std::io::Result<TempDir> {
    let temp_dir = TempDir::new()?;
    let exe = std::env::current_exe()?;

    #[cfg(unix)]
    for filename in [APPLY_PATCH_ARG0, MISSPELLED_APPLY_PATCH_ARG0] {
        symlink(&exe, temp_dir.path().join(filename))?;
    }
    #[cfg(not(unix))]
    let _ = exe;

    let path = match std::env::var_os("PATH") {
        Some(existing) => {
            let mut entries = vec![temp_dir.path().to_path_buf()];
            entries.extend(std::env::split_paths(&existing));
            std::env::join_paths(entries).map_err(std::io::Error::other)?
        }
        None => temp_dir.path().as_os_str().to_owned(),
    };
    // SAFETY: see `set_filtered`.
    unsafe { std::env::set_var("PATH", path) };

    Ok(temp_dir)
}
