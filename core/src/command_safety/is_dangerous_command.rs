use crate::bash::parse_bash_lc_plain_commands;

use super::program_basename;

/// True for commands that destroy work in ways a sandbox does not undo:
/// discarding git state or force-removing files. These always need an
/// explicit approval unless an identical invocation was approved earlier.
pub fn command_might_be_dangerous(command: &[String]) -> bool {
    if is_dangerous_to_call_with_exec(command) {
        return true;
    }

    // Support `bash -lc "<script>"` where any part of the script might contain a dangerous command.
    if let Some(all_commands) = parse_bash_lc_plain_commands(command)
        && all_commands
            .iter()
            .any(|cmd| is_dangerous_to_call_with_exec(cmd))
    {
        return true;
    }

    false
}

fn is_dangerous_to_call_with_exec(command: &[String]) -> bool {
    let Some(cmd0) = command.first() else {
        return false;
    };

    match program_basename(cmd0) {
        "git" => matches!(command.get(1).map(String::as_str), Some("reset" | "rm")),

        "rm" => command.iter().skip(1).any(|arg| is_force_flag(arg)),

        // for sudo <cmd> simply do the check for <cmd>
        "sudo" => is_dangerous_to_call_with_exec(&command[1..]),

        _ => false,
    }
}

/// `-f`, `--force`, and any short-flag cluster containing `f` such as `-rf`.
fn is_force_flag(arg: &str) -> bool {
    if arg == "--force" {
        return true;
    }
    match arg.strip_prefix('-') {
        Some(short) if !short.starts_with('-') => short.contains('f'),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec_str(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn git_reset_and_rm_are_dangerous() {
        assert!(command_might_be_dangerous(&vec_str(&["git", "reset"])));
        assert!(command_might_be_dangerous(&vec_str(&[
            "/usr/bin/git",
            "reset",
            "--hard"
        ])));
        assert!(command_might_be_dangerous(&vec_str(&["git", "rm", "a.txt"])));
        assert!(!command_might_be_dangerous(&vec_str(&["git", "status"])));
    }

    #[test]
    fn rm_is_dangerous_only_when_forced() {
        assert!(command_might_be_dangerous(&vec_str(&["rm", "-f", "a"])));
        assert!(command_might_be_dangerous(&vec_str(&["rm", "-rf", "dir"])));
        assert!(command_might_be_dangerous(&vec_str(&["rm", "-fr", "dir"])));
        assert!(command_might_be_dangerous(&vec_str(&["rm", "dir", "--force"])));
        assert!(!command_might_be_dangerous(&vec_str(&["rm", "a.txt"])));
        assert!(!command_might_be_dangerous(&vec_str(&["rm", "-r", "dir"])));
    }

    #[test]
    fn sudo_and_bash_lc_are_unwrapped() {
        assert!(command_might_be_dangerous(&vec_str(&[
            "sudo", "git", "reset", "--hard"
        ])));
        assert!(!command_might_be_dangerous(&vec_str(&["sudo"])));
        assert!(command_might_be_dangerous(&vec_str(&[
            "bash",
            "-lc",
            "ls && rm -rf build"
        ])));
        assert!(!command_might_be_dangerous(&vec_str(&[
            "bash",
            "-lc",
            "ls && git status"
        ])));
    }
}
