//! Normalized identifiers for actions the user has approved.
//!
//! An approval covers every later action with the same fingerprint for the
//! rest of the session, so the fingerprint keeps what changes the nature of a
//! command (program, subcommand, flags) and drops what merely varies between
//! invocations (file operands, flag values, a leading `cd`). Wrappers such
//! as `sudo` or `env` are looked through, and commands whose operands are
//! program text (`sh -c`, `python3 -c`, `awk`, `find -exec`) only match
//! verbatim.

use std::path::PathBuf;

use crate::bash::extract_words_from_command_node;
use crate::bash::find_first_command_node;
use crate::bash::remainder_start_after_wrapper_operator;
use crate::bash::try_parse_bash;
use crate::bash::try_parse_word_only_commands_sequence;
use crate::command_safety::command_might_be_dangerous;
use crate::command_safety::program_basename;

/// Programs whose first positional argument selects the operation, so
/// `git push` and `git status` must not share an approval.
const SUBCOMMAND_PROGRAMS: &[&str] = &[
    "git", "cargo", "npm", "pnpm", "yarn", "docker", "kubectl", "go",
];

/// Programs that run the command following their own options.
struct Wrapper {
    name: &'static str,
    /// Options that consume the next word.
    value_options: &'static [&'static str],
    /// Operands between the options and the wrapped command.
    leading_operands: usize,
}

const WRAPPERS: &[Wrapper] = &[
    Wrapper {
        name: "sudo",
        value_options: &["-u", "-g", "-C", "-D", "-h", "-p", "-r", "-t", "-U", "-T"],
        leading_operands: 0,
    },
    Wrapper {
        name: "doas",
        value_options: &["-u", "-C"],
        leading_operands: 0,
    },
    Wrapper {
        name: "env",
        value_options: &["-u", "-C", "--unset", "--chdir"],
        leading_operands: 0,
    },
    Wrapper {
        name: "nice",
        value_options: &["-n", "--adjustment"],
        leading_operands: 0,
    },
    Wrapper {
        name: "ionice",
        value_options: &["-c", "-n", "-p", "-P", "-u"],
        leading_operands: 0,
    },
    Wrapper {
        name: "nohup",
        value_options: &[],
        leading_operands: 0,
    },
    Wrapper {
        name: "stdbuf",
        value_options: &["-i", "-o", "-e"],
        leading_operands: 0,
    },
    Wrapper {
        name: "timeout",
        value_options: &["-s", "-k", "--signal", "--kill-after"],
        leading_operands: 1,
    },
    Wrapper {
        name: "xargs",
        value_options: &[
            "-a", "-d", "-E", "-I", "-L", "-n", "-P", "-s", "--arg-file", "--delimiter",
            "--max-args", "--max-procs", "--max-lines", "--max-chars",
        ],
        leading_operands: 0,
    },
    Wrapper {
        name: "exec",
        value_options: &["-a"],
        leading_operands: 0,
    },
    Wrapper {
        name: "command",
        value_options: &[],
        leading_operands: 0,
    },
];

const SHELLS: &[&str] = &["bash", "zsh", "sh", "dash", "ksh", "fish"];

pub fn command_fingerprint(command: &[String]) -> String {
    // Dangerous commands are only ever re-approved verbatim.
    if command_might_be_dangerous(command) {
        return exact_fingerprint(command);
    }

    let Some(invocation) = parse_shell_script_from_shell_invocation(command) else {
        return argv_fingerprint(command);
    };

    let script = strip_cd_prefix(&invocation.script).unwrap_or(invocation.script.as_str());
    let commands = try_parse_bash(script)
        .and_then(|tree| try_parse_word_only_commands_sequence(&tree, script))
        .filter(|cmds| !cmds.is_empty());
    match commands {
        Some(cmds) => cmds
            .iter()
            .map(|words| command_fingerprint(words))
            .collect::<Vec<_>>()
            .join(" ; "),
        // Anything with substitutions, redirects or control flow is only
        // matched literally.
        None => format!("script:{}", script.trim()),
    }
}

pub fn patch_fingerprint(paths: &[PathBuf]) -> String {
    let mut paths: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
    paths.sort();
    paths.dedup();
    format!("apply_patch {}", paths.join(" "))
}

fn argv_fingerprint(words: &[String]) -> String {
    let Some((cmd0, rest)) = words.split_first() else {
        return String::new();
    };
    let program = program_basename(cmd0);
    if runs_inline_code(program, rest) {
        return exact_fingerprint(words);
    }
    if let Some(wrapper) = WRAPPERS.iter().find(|wrapper| wrapper.name == program) {
        let (options, inner) = split_wrapper(wrapper, rest);
        if inner.is_empty() {
            return exact_fingerprint(words);
        }
        let mut prefix = vec![program.to_string()];
        prefix.extend(options.iter().cloned());
        return format!("{} {}", prefix.join(" "), command_fingerprint(inner));
    }

    let mut parts = vec![program.to_string()];

    if SUBCOMMAND_PROGRAMS.contains(&program)
        && let Some(sub) = rest.iter().find(|w| !w.starts_with('-'))
    {
        parts.push(sub.clone());
    }

    let mut flags: Vec<&str> = rest
        .iter()
        .filter(|w| w.len() > 1 && w.starts_with('-') && w.as_str() != "--")
        .map(|w| w.split_once('=').map(|(flag, _)| flag).unwrap_or(w))
        .collect();
    flags.sort_unstable();
    flags.dedup();
    parts.extend(flags.into_iter().map(str::to_string));

    parts.join(" ")
}

/// Splits a wrapper's arguments into its own options (values and `env`
/// assignments included) and the wrapped command.
fn split_wrapper<'a>(wrapper: &Wrapper, rest: &'a [String]) -> (&'a [String], &'a [String]) {
    let mut idx = 0;
    while let Some(word) = rest.get(idx) {
        if word == "--" {
            idx += 1;
            break;
        }
        if wrapper.name == "env" && !word.starts_with('-') && word.contains('=') {
            idx += 1;
        } else if word.len() > 1 && word.starts_with('-') {
            idx += if wrapper.value_options.contains(&word.as_str()) {
                2
            } else {
                1
            };
        } else {
            break;
        }
    }
    rest.split_at((idx + wrapper.leading_operands).min(rest.len()))
}

/// Whether the arguments carry program text, which an approval must cover
/// word for word.
fn runs_inline_code(program: &str, rest: &[String]) -> bool {
    let short_cluster_contains = |letters: &[char]| {
        rest.iter().any(|word| {
            word.len() > 1
                && word.starts_with('-')
                && !word.starts_with("--")
                && word[1..].chars().any(|c| letters.contains(&c))
        })
    };
    let has_option = |options: &[&str]| {
        rest.iter().any(|word| {
            let flag = word.split_once('=').map_or(word.as_str(), |(flag, _)| flag);
            options.contains(&flag)
        })
    };

    match program {
        p if SHELLS.contains(&p) => short_cluster_contains(&['c']),
        p if is_python(p) => short_cluster_contains(&['c']),
        "ruby" => short_cluster_contains(&['e']),
        "perl" => short_cluster_contains(&['e', 'E']),
        "node" | "nodejs" | "bun" => has_option(&["-e", "--eval", "-p", "--print"]),
        "php" => has_option(&["-r"]),
        "lua" | "osascript" => has_option(&["-e"]),
        "pwsh" | "powershell" => rest.iter().any(|word| {
            matches!(
                word.to_ascii_lowercase().as_str(),
                "-c" | "-command" | "-ec" | "-encodedcommand"
            )
        }),
        // The script is the first operand.
        "awk" | "gawk" | "mawk" | "nawk" | "sed" => true,
        "find" => has_option(&["-exec", "-execdir", "-ok", "-okdir", "-delete"]),
        _ => false,
    }
}

fn is_python(program: &str) -> bool {
    program
        .strip_prefix("python")
        .is_some_and(|version| version.chars().all(|c| c.is_ascii_digit() || c == '.'))
}

fn exact_fingerprint(words: &[String]) -> String {
    format!("exact:{}", join_argv(words))
}

fn strip_cd_prefix(script: &str) -> Option<&str> {
    let tree = try_parse_bash(script)?;
    let first_cmd = find_first_command_node(&tree)?;
    let words = extract_words_from_command_node(first_cmd, script)?;
    if !matches!(words.as_slice(), [first, _dir] if first == "cd") {
        return None;
    }
    let idx = remainder_start_after_wrapper_operator(first_cmd, script)?;
    script.get(idx..)
}

fn join_argv(command: &[String]) -> String {
    shlex::try_join(command.iter().map(String::as_str))
        .unwrap_or_else(|_| command.join(" "))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ShellScriptInvocation {
    script: String,
}

fn parse_shell_script_from_shell_invocation(command: &[String]) -> Option<ShellScriptInvocation> {
    fn is_allowed_exe(s: &str) -> bool {
        SHELLS.contains(&program_basename(s))
    }
    match command {
        [exe, flag, script] if is_allowed_exe(exe) && (flag == "-lc" || flag == "-c") => {
            Some(ShellScriptInvocation {
                script: script.clone(),
            })
        }
        [exe, flag1, flag2, script] if is_allowed_exe(exe) && flag1 == "-l" && flag2 == "-c" => {
            Some(ShellScriptInvocation {
                script: script.clone(),
            })
        }
        _ => None,
    }
}
