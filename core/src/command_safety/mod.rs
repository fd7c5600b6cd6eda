//! Static heuristics over a proposed argv. Both checks are pure and only look
//! at the words of the command; they never touch the filesystem.

pub mod is_dangerous_command;
pub mod is_safe_command;

pub use is_dangerous_command::command_might_be_dangerous;
pub use is_safe_command::is_known_safe_command;

/// Strips any leading directories so `/usr/bin/git` is judged like `git`.
pub(crate) fn program_basename(cmd0: &str) -> &str {
    std::path::Path::new(cmd0)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(cmd0)
}
