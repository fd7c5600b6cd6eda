mod parser;
mod seek_sequence;
mod standalone_executable;

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
pub use parser::Hunk;
pub use parser::ParseError;
use parser::ParseError::*;
pub use parser::UpdateFileChunk;
pub use parser::parse_patch;
use similar::TextDiff;
use thiserror::Error;
use tree_sitter::Node;
use tree_sitter::Parser;

pub use parser::ApplyPatchArgs;
pub use standalone_executable::main;

/// Detailed instructions for models on how to use the `apply_patch` tool.
pub const APPLY_PATCH_TOOL_INSTRUCTIONS: &str = include_str!("../apply_patch_tool_instructions.md");

const APPLY_PATCH_COMMANDS: [&str; 2] = ["apply_patch", "applypatch"];

#[derive(Debug, Error, PartialEq)]
pub enum ApplyPatchError {
    #[error(transparent)]
    ParseError(#[from] ParseError),
    #[error(transparent)]
    IoError(#[from] IoError),
    /// Error that occurs while computing replacements when applying patch chunks
    #[error("{0}")]
    ComputeReplacements(String),
    /// A raw patch body was provided without an explicit `apply_patch` invocation.
    #[error(
        "patch detected without explicit call to apply_patch. Rerun as [\"apply_patch\", \"<patch>\"]"
    )]
    ImplicitInvocation,
}

impl From<std::io::Error> for ApplyPatchError {
    fn from(err: std::io::Error) -> Self {
        ApplyPatchError::IoError(IoError {
            context: "I/O error".to_string(),
            source: err,
        })
    }
}

#[derive(Debug, Error)]
#[error("{context}: {source}")]
pub struct IoError {
    context: String,
    #[source]
    source: std::io::Error,
}

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.context == other.context && self.source.to_string() == other.source.to_string()
    }
}

#[derive(Debug, PartialEq)]
pub enum MaybeApplyPatch {
    Body(ApplyPatchArgs),
    ShellParseError(ExtractHeredocError),
    PatchParseError(ParseError),
    NotApplyPatch,
}

/// Recognizes `["apply_patch", body]` and
/// `["bash", "-lc", "[cd dir &&] apply_patch <<'EOF' ... EOF"]`.
pub fn maybe_parse_apply_patch(argv: &[String]) -> MaybeApplyPatch {
    match argv {
        [cmd, body] if APPLY_PATCH_COMMANDS.contains(&cmd.as_str()) => match parse_patch(body) {
            Ok(source) => MaybeApplyPatch::Body(source),
            Err(e) => MaybeApplyPatch::PatchParseError(e),
        },
        [bash, flag, script] if bash == "bash" && flag == "-lc" => {
            match extract_apply_patch_from_bash(script) {
                Ok((body, workdir)) => match parse_patch(&body) {
                    Ok(mut source) => {
                        source.workdir = workdir;
                        MaybeApplyPatch::Body(source)
                    }
                    Err(e) => MaybeApplyPatch::PatchParseError(e),
                },
                Err(ExtractHeredocError::CommandDidNotStartWithApplyPatch) => {
                    MaybeApplyPatch::NotApplyPatch
                }
                Err(e) => MaybeApplyPatch::ShellParseError(e),
            }
        }
        _ => MaybeApplyPatch::NotApplyPatch,
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum ApplyPatchFileChange {
    Add {
        content: String,
    },
    Delete {
        content: String,
    },
    Update {
        unified_diff: String,
        move_path: Option<PathBuf>,
        /// new_content that will result after the unified_diff is applied.
        new_content: String,
    },
}

#[derive(Debug, PartialEq)]
pub enum MaybeApplyPatchVerified {
    /// `argv` corresponded to an `apply_patch` invocation, and these are the
    /// resulting proposed file changes.
    Body(ApplyPatchAction),
    /// `argv` could not be parsed to determine whether it corresponds to an
    /// `apply_patch` invocation.
    ShellParseError(ExtractHeredocError),
    /// `argv` corresponded to an `apply_patch` invocation, but it could not
    /// be fulfilled due to the specified error.
    CorrectnessError(ApplyPatchError),
    /// `argv` decidedly did not correspond to an `apply_patch` invocation.
    NotApplyPatch,
}

/// A patch resolved against the filesystem: every path is absolute and every
/// update carries the content it will produce.
#[derive(Debug, PartialEq, Clone)]
pub struct ApplyPatchAction {
    changes: HashMap<PathBuf, ApplyPatchFileChange>,

    /// The raw patch argument that can be used with `apply_patch` as an exec
    /// call. i.e., if the original arg was parsed in "lenient" mode with a
    /// heredoc, this should be the value without the heredoc wrapper.
    pub patch: String,

    /// The working directory that was used to resolve relative paths in the patch.
    pub cwd: PathBuf,
}

impl ApplyPatchAction {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns the changes that would be made by applying the patch.
    pub fn changes(&self) -> &HashMap<PathBuf, ApplyPatchFileChange> {
        &self.changes
    }

    /// Every path the patch writes or removes, including move destinations.
    pub fn touched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::with_capacity(self.changes.len());
        for (path, change) in &self.changes {
            paths.push(path.clone());
            if let ApplyPatchFileChange::Update {
                move_path: Some(dest),
                ..
            } = change
            {
                paths.push(dest.clone());
            }
        }
        paths.sort();
        paths.dedup();
        paths
    }
}

/// cwd must be an absolute path so that we can resolve relative paths in the
/// patch.
pub fn maybe_parse_apply_patch_verified(argv: &[String], cwd: &Path) -> MaybeApplyPatchVerified {
    // A raw patch body without an explicit invocation is refused so the model
    // learns the call shape.
    if let [body] = argv
        && parse_patch(body).is_ok()
    {
        return MaybeApplyPatchVerified::CorrectnessError(ApplyPatchError::ImplicitInvocation);
    }
    if let [bash, flag, script] = argv
        && bash == "bash"
        && flag == "-lc"
        && parse_patch(script).is_ok()
    {
        return MaybeApplyPatchVerified::CorrectnessError(ApplyPatchError::ImplicitInvocation);
    }

    match maybe_parse_apply_patch(argv) {
        MaybeApplyPatch::Body(ApplyPatchArgs {
            patch,
            hunks,
            workdir,
        }) => {
            let effective_cwd = workdir
                .as_ref()
                .map(|dir| {
                    let path = Path::new(dir);
                    if path.is_absolute() {
                        path.to_path_buf()
                    } else {
                        cwd.join(path)
                    }
                })
                .unwrap_or_else(|| cwd.to_path_buf());
            match resolve_hunks(hunks, &effective_cwd) {
                Ok(changes) => MaybeApplyPatchVerified::Body(ApplyPatchAction {
                    changes,
                    patch,
                    cwd: effective_cwd,
                }),
                Err(e) => MaybeApplyPatchVerified::CorrectnessError(e),
            }
        }
        MaybeApplyPatch::ShellParseError(e) => MaybeApplyPatchVerified::ShellParseError(e),
        MaybeApplyPatch::PatchParseError(e) => MaybeApplyPatchVerified::CorrectnessError(e.into()),
        MaybeApplyPatch::NotApplyPatch => MaybeApplyPatchVerified::NotApplyPatch,
    }
}

fn resolve_hunks(
    hunks: Vec<Hunk>,
    cwd: &Path,
) -> Result<HashMap<PathBuf, ApplyPatchFileChange>, ApplyPatchError> {
    let mut changes = HashMap::new();
    for hunk in hunks {
        let path = hunk.resolve_path(cwd);
        match hunk {
            Hunk::AddFile { contents, .. } => {
                changes.insert(path, ApplyPatchFileChange::Add { content: contents });
            }
            Hunk::DeleteFile { .. } => {
                let content = std::fs::read_to_string(&path).map_err(|source| IoError {
                    context: format!("Failed to read {}", path.display()),
                    source,
                })?;
                changes.insert(path, ApplyPatchFileChange::Delete { content });
            }
            Hunk::UpdateFile {
                move_path, chunks, ..
            } => {
                let ApplyPatchFileUpdate {
                    unified_diff,
                    content,
                } = unified_diff_from_chunks(&path, &chunks)?;
                changes.insert(
                    path,
                    ApplyPatchFileChange::Update {
                        unified_diff,
                        move_path: move_path.map(|p| cwd.join(p)),
                        new_content: content,
                    },
                );
            }
        }
    }
    Ok(changes)
}

#[derive(Debug, PartialEq, Clone)]
pub enum ExtractHeredocError {
    CommandDidNotStartWithApplyPatch,
    FailedToLoadBashGrammar(String),
    FailedToParsePatchIntoAst,
    FailedToFindHeredocBody,
    HeredocNotUtf8,
}

/// Pulls the heredoc body out of `apply_patch <<'EOF' ... EOF`, optionally
/// preceded by `cd <dir> &&`. Returns the body and the `cd` target.
fn extract_apply_patch_from_bash(
    src: &str,
) -> std::result::Result<(String, Option<String>), ExtractHeredocError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_bash::LANGUAGE.into())
        .map_err(|e| ExtractHeredocError::FailedToLoadBashGrammar(e.to_string()))?;
    let tree = parser
        .parse(src, None)
        .ok_or(ExtractHeredocError::FailedToParsePatchIntoAst)?;
    let root = tree.root_node();

    let mut scan = HeredocScan::default();
    scan.visit(root, src.as_bytes())?;

    let workdir = match scan.commands.as_slice() {
        [only] if is_apply_patch(only) => None,
        [cd, apply] if cd.len() == 2 && cd[0] == "cd" && is_apply_patch(apply) => {
            Some(cd[1].clone())
        }
        _ => return Err(ExtractHeredocError::CommandDidNotStartWithApplyPatch),
    };
    if root.has_error() {
        return Err(ExtractHeredocError::FailedToParsePatchIntoAst);
    }

    let body = scan
        .heredoc_body
        .ok_or(ExtractHeredocError::FailedToFindHeredocBody)?;
    let mut lines: Vec<&str> = body.lines().collect();
    // Some grammar versions fold the terminator into the body node.
    while let Some(last) = lines.last() {
        let last = last.trim();
        if last.is_empty() || scan.delimiter.as_deref() == Some(last) {
            lines.pop();
        } else {
            break;
        }
    }
    Ok((lines.join("\n"), workdir))
}

fn is_apply_patch(command: &[String]) -> bool {
    command.len() == 1 && APPLY_PATCH_COMMANDS.contains(&command[0].as_str())
}

#[derive(Default)]
struct HeredocScan {
    commands: Vec<Vec<String>>,
    heredoc_body: Option<String>,
    delimiter: Option<String>,
}

impl HeredocScan {
    fn visit(&mut self, node: Node<'_>, src: &[u8]) -> Result<(), ExtractHeredocError> {
        match node.kind() {
            "command" => {
                let mut words = Vec::new();
                let mut cursor = node.walk();
                for child in node.children(&mut cursor) {
                    let text = child
                        .utf8_text(src)
                        .map_err(|_| ExtractHeredocError::HeredocNotUtf8)?;
                    match child.kind() {
                        "command_name" | "word" | "number" => words.push(text.to_string()),
                        "string" | "raw_string" => {
                            words.push(text.trim_matches(['"', '\'']).to_string())
                        }
                        _ => {}
                    }
                }
                self.commands.push(words);
            }
            "heredoc_start" => {
                let text = node
                    .utf8_text(src)
                    .map_err(|_| ExtractHeredocError::HeredocNotUtf8)?;
                self.delimiter = Some(text.trim_matches(['"', '\'']).to_string());
            }
            "heredoc_body" => {
                let text = node
                    .utf8_text(src)
                    .map_err(|_| ExtractHeredocError::HeredocNotUtf8)?;
                self.heredoc_body = Some(text.to_string());
                return Ok(());
            }
            _ => {}
        }

        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        for child in children {
            self.visit(child, src)?;
        }
        Ok(())
    }
}

/// Applies the patch and prints the result to stdout/stderr.
pub fn apply_patch(
    patch: &str,
    stdout: &mut impl std::io::Write,
    stderr: &mut impl std::io::Write,
) -> Result<(), ApplyPatchError> {
    let hunks = match parse_patch(patch) {
        Ok(source) => source.hunks,
        Err(e) => {
            match &e {
                InvalidPatchError(message) => {
                    writeln!(stderr, "Invalid patch: {message}")?;
                }
                InvalidHunkError {
                    message,
                    line_number,
                } => {
                    writeln!(
                        stderr,
                        "Invalid patch hunk on line {line_number}: {message}"
                    )
                    ?;
                }
            }
            return Err(ApplyPatchError::ParseError(e));
        }
    };

    apply_hunks(&hunks, stdout, stderr)?;

    Ok(())
}

/// Applies hunks relative to the process working directory.
pub fn apply_hunks(
    hunks: &[Hunk],
    stdout: &mut impl std::io::Write,
    stderr: &mut impl std::io::Write,
) -> Result<(), ApplyPatchError> {
    match apply_hunks_to_files(hunks) {
        Ok(affected) => {
            print_summary(&affected, stdout)?;
            Ok(())
        }
        Err(err) => {
            let msg = err.to_string();
            writeln!(stderr, "{msg}")?;
            Err(ApplyPatchError::IoError(IoError {
                context: "Failed to apply patch".to_string(),
                source: std::io::Error::other(msg),
            }))
        }
    }
}

/// Writes a resolved action to disk. Update contents come from the action
/// itself, so the files written are exactly the ones that were approved.
pub fn apply_action(action: &ApplyPatchAction) -> Result<AffectedPaths, ApplyPatchError> {
    let mut affected = AffectedPaths::default();
    let mut paths: Vec<&PathBuf> = action.changes.keys().collect();
    paths.sort();
    for path in paths {
        let Some(change) = action.changes.get(path) else {
            continue;
        };
        match change {
            ApplyPatchFileChange::Add { content } => {
                write_creating_parents(path, content)?;
                affected.added.push(path.clone());
            }
            ApplyPatchFileChange::Delete { .. } => {
                std::fs::remove_file(path).map_err(|source| IoError {
                    context: format!("Failed to delete file {}", path.display()),
                    source,
                })?;
                affected.deleted.push(path.clone());
            }
            ApplyPatchFileChange::Update {
                move_path,
                new_content,
                ..
            } => {
                if let Some(dest) = move_path {
                    write_creating_parents(dest, new_content)?;
                    std::fs::remove_file(path).map_err(|source| IoError {
                        context: format!("Failed to remove original {}", path.display()),
                        source,
                    })?;
                    affected.modified.push(dest.clone());
                } else {
                    std::fs::write(path, new_content).map_err(|source| IoError {
                        context: format!("Failed to write file {}", path.display()),
                        source,
                    })?;
                    affected.modified.push(path.clone());
                }
            }
        }
    }
    Ok(affected)
}

fn write_creating_parents(path: &Path, content: &str) -> Result<(), IoError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|source| IoError {
            context: format!("Failed to create parent directories for {}", path.display()),
            source,
        })?;
    }
    std::fs::write(path, content).map_err(|source| IoError {
        context: format!("Failed to write file {}", path.display()),
        source,
    })
}

/// Tracks file paths affected by applying a patch.
#[derive(Debug, Default, PartialEq)]
pub struct AffectedPaths {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

fn apply_hunks_to_files(hunks: &[Hunk]) -> anyhow::Result<AffectedPaths> {
    if hunks.is_empty() {
        anyhow::bail!("No files were modified.");
    }

    let mut added: Vec<PathBuf> = Vec::new();
    let mut modified: Vec<PathBuf> = Vec::new();
    let mut deleted: Vec<PathBuf> = Vec::new();
    for hunk in hunks {
        match hunk {
            Hunk::AddFile { path, contents } => {
                write_creating_parents(path, contents)?;
                added.push(path.clone());
            }
            Hunk::DeleteFile { path } => {
                std::fs::remove_file(path)
                    .with_context(|| format!("Failed to delete file {}", path.display()))?;
                deleted.push(path.clone());
            }
            Hunk::UpdateFile {
                path,
                move_path,
                chunks,
            } => {
                let AppliedPatch { new_contents, .. } =
                    derive_new_contents_from_chunks(path, chunks)?;
                if let Some(dest) = move_path {
                    write_creating_parents(dest, &new_contents)?;
                    std::fs::remove_file(path)
                        .with_context(|| format!("Failed to remove original {}", path.display()))?;
                    modified.push(dest.clone());
                } else {
                    std::fs::write(path, new_contents)
                        .with_context(|| format!("Failed to write file {}", path.display()))?;
                    modified.push(path.clone());
                }
            }
        }
    }
    Ok(AffectedPaths {
        added,
        modified,
        deleted,
    })
}

struct AppliedPatch {
    original_contents: String,
    new_contents: String,
}

/// Return *only* the new file contents (joined into a single `String`) after
/// applying the chunks to the file at `path`.
fn derive_new_contents_from_chunks(
    path: &Path,
    chunks: &[UpdateFileChunk],
) -> std::result::Result<AppliedPatch, ApplyPatchError> {
    let original_contents = std::fs::read_to_string(path).map_err(|err| IoError {
        context: format!("Failed to read file to update {}", path.display()),
        source: err,
    })?;

    let mut original_lines: Vec<String> = original_contents.split('\n').map(String::from).collect();

    // Drop the trailing empty element that results from the final newline so
    // that line counts match the behaviour of standard `diff`.
    if original_lines.last().is_some_and(String::is_empty) {
        original_lines.pop();
    }

    let replacements = compute_replacements(&original_lines, path, chunks)?;
    let mut new_lines = apply_replacements(original_lines, &replacements);
    if !new_lines.last().is_some_and(String::is_empty) {
        new_lines.push(String::new());
    }
    let new_contents = new_lines.join("\n");
    Ok(AppliedPatch {
        original_contents,
        new_contents,
    })
}

/// Compute a list of replacements needed to transform `original_lines` into the
/// new lines, given the patch `chunks`. Each replacement is returned as
/// `(start_index, old_len, new_lines)`.
fn compute_replacements(
    original_lines: &[String],
    path: &Path,
    chunks: &[UpdateFileChunk],
) -> std::result::Result<Vec<(usize, usize, Vec<String>)>, ApplyPatchError> {
    let mut replacements: Vec<(usize, usize, Vec<String>)> = Vec::new();
    let mut line_index: usize = 0;

    for chunk in chunks {
        // If a chunk has a `change_context`, we use seek_sequence to find it, then
        // adjust our `line_index` to continue from there.
        if let Some(ctx_line) = &chunk.change_context {
            match seek_sequence::seek_sequence(
                original_lines,
                std::slice::from_ref(ctx_line),
                line_index,
                false,
            ) {
                Some(idx) => line_index = idx + 1,
                None => {
                    return Err(ApplyPatchError::ComputeReplacements(format!(
                        "Failed to find context '{}' in {}",
                        ctx_line,
                        path.display()
                    )));
                }
            }
        }

        if chunk.old_lines.is_empty() {
            // Pure addition (no old lines). We'll add them at the end or just
            // before the final empty line if one exists.
            let insertion_idx = if original_lines.last().is_some_and(String::is_empty) {
                original_lines.len() - 1
            } else {
                original_lines.len()
            };
            replacements.push((insertion_idx, 0, chunk.new_lines.clone()));
            continue;
        }

        let mut pattern: &[String] = &chunk.old_lines;
        let mut new_slice: &[String] = &chunk.new_lines;
        let mut found =
            seek_sequence::seek_sequence(original_lines, pattern, line_index, chunk.is_end_of_file);

        // A trailing empty pattern line usually stands for the final newline
        // of the file, which is not a line of its own here.
        if found.is_none() && pattern.last().is_some_and(String::is_empty) {
            pattern = &pattern[..pattern.len() - 1];
            if new_slice.last().is_some_and(String::is_empty) {
                new_slice = &new_slice[..new_slice.len() - 1];
            }
            found = seek_sequence::seek_sequence(
                original_lines,
                pattern,
                line_index,
                chunk.is_end_of_file,
            );
        }

        match found {
            Some(start_idx) => {
                replacements.push((start_idx, pattern.len(), new_slice.to_vec()));
                line_index = start_idx + pattern.len();
            }
            None => {
                return Err(ApplyPatchError::ComputeReplacements(format!(
                    "Failed to find expected lines in {}:\n{}",
                    path.display(),
                    chunk.old_lines.join("\n"),
                )));
            }
        }
    }

    replacements.sort_by_key(|(start, _, _)| *start);
    Ok(replacements)
}

/// Apply the `(start_index, old_len, new_lines)` replacements to
/// `original_lines`, returning the modified file contents as a vector of lines.
fn apply_replacements(
    mut lines: Vec<String>,
    replacements: &[(usize, usize, Vec<String>)],
) -> Vec<String> {
    // Apply in reverse order so earlier replacements don't shift the
    // positions of later ones.
    for (start_idx, old_len, new_segment) in replacements.iter().rev() {
        let start_idx = *start_idx;
        let old_len = *old_len;
        let end = (start_idx + old_len).min(lines.len());
        lines.splice(start_idx..end, new_segment.iter().cloned());
    }
    lines
}

/// Intended result of a file update for apply_patch.
#[derive(Debug, Eq, PartialEq)]
pub struct ApplyPatchFileUpdate {
    unified_diff: String,
    content: String,
}

pub fn unified_diff_from_chunks(
    path: &Path,
    chunks: &[UpdateFileChunk],
) -> std::result::Result<ApplyPatchFileUpdate, ApplyPatchError> {
    unified_diff_from_chunks_with_context(path, chunks, 1)
}

pub fn unified_diff_from_chunks_with_context(
    path: &Path,
    chunks: &[UpdateFileChunk],
    context: usize,
) -> std::result::Result<ApplyPatchFileUpdate, ApplyPatchError> {
    let AppliedPatch {
        original_contents,
        new_contents,
    } = derive_new_contents_from_chunks(path, chunks)?;
    let text_diff = TextDiff::from_lines(&original_contents, &new_contents);
    let unified_diff = text_diff.unified_diff().context_radius(context).to_string();
    Ok(ApplyPatchFileUpdate {
        unified_diff,
        content: new_contents,
    })
}

/// Write a git-style summary of changes to the given writer.
pub fn print_summary(
    affected: &AffectedPaths,
    out: &mut impl std::io::Write,
) -> std::io::Result<()> {
    writeln!(out, "Success. Updated the following files:")?;
    for path in &affected.added {
        writeln!(out, "A {}", path.display())?;
    }
    for path in &affected.modified {
        writeln!(out, "M {}", path.display())?;
    }
    for path in &affected.deleted {
        writeln!(out, "D {}", path.display())?;
    }
    Ok(())
}
