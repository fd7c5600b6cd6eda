//! Aggregates the file edits of one turn into a single unified diff.
//!
//! The first time a patch touches a path, the tracker snapshots what was on
//! disk (or records that nothing was). The turn diff is always computed
//! against those baselines, so several patches to the same file collapse into
//! one hunk set and a file that ends the turn unchanged drops out.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use codex_apply_patch::ApplyPatchFileChange;
use similar::TextDiff;
use tracing::warn;

#[derive(Debug, Default)]
pub struct TurnDiffTracker {
    /// Content of each touched path before the turn first changed it.
    /// `None` means the path did not exist.
    baselines: BTreeMap<PathBuf, Option<String>>,
}

impl TurnDiffTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records baselines for every path a patch is about to touch,
    /// including rename destinations. Paths already seen keep their
    /// original baseline.
    pub fn on_patch_begin(&mut self, changes: &HashMap<PathBuf, ApplyPatchFileChange>) {
        for (path, change) in changes {
            self.snapshot(path);
            if let ApplyPatchFileChange::Update {
                move_path: Some(dest),
                ..
            } = change
            {
                self.snapshot(dest);
            }
        }
    }

    fn snapshot(&mut self, path: &Path) {
        if self.baselines.contains_key(path) {
            return;
        }
        let baseline = read_text(path);
        self.baselines.insert(path.to_path_buf(), baseline);
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    /// Unified diff of every touched path against its baseline, or `None`
    /// when the turn left the tree as it found it. Paths under `root` are
    /// shown relative to it.
    pub fn get_unified_diff(&self, root: &Path) -> Option<String> {
        let mut out = String::new();
        for (path, baseline) in &self.baselines {
            let current = read_text(path);
            if current == *baseline {
                continue;
            }
            let display = path.strip_prefix(root).unwrap_or(path).display().to_string();
            let old_header = match baseline {
                Some(_) => format!("a/{display}"),
                None => "/dev/null".to_string(),
            };
            let new_header = match current {
                Some(_) => format!("b/{display}"),
                None => "/dev/null".to_string(),
            };
            let old = baseline.as_deref().unwrap_or("");
            let new = current.as_deref().unwrap_or("");

            out.push_str(&format!("diff --git a/{display} b/{display}\n"));
            match (baseline, &current) {
                (None, Some(_)) => out.push_str("new file mode 100644\n"),
                (Some(_), None) => out.push_str("deleted file mode 100644\n"),
                _ => {}
            }
            let diff = TextDiff::from_lines(old, new);
            out.push_str(
                &diff
                    .unified_diff()
                    .context_radius(3)
                    .header(&old_header, &new_header)
                    .to_string(),
            );
        }
        if out.is_empty() { None } else { Some(out) }
    }
}

fn read_text(path: &Path) -> Option<String> {
    match std::fs::read(path) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            warn!("failed to snapshot {}: {err}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn update(path: &Path) -> HashMap<PathBuf, ApplyPatchFileChange> {
        HashMap::from([(
            path.to_path_buf(),
            ApplyPatchFileChange::Update {
                unified_diff: String::new(),
                move_path: None,
                new_content: String::new(),
            },
        )])
    }

    #[test]
    fn repeated_edits_diff_against_first_baseline() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "one\n").unwrap();

        let mut tracker = TurnDiffTracker::new();
        tracker.on_patch_begin(&update(&file));
        std::fs::write(&file, "two\n").unwrap();
        tracker.on_patch_begin(&update(&file));
        std::fs::write(&file, "three\n").unwrap();

        let diff = tracker.get_unified_diff(dir.path()).unwrap();
        assert_eq!(
            "diff --git a/a.txt b/a.txt\n--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-one\n+three\n",
            diff
        );
    }

    #[test]
    fn added_file_uses_dev_null_header() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("new.txt");
        let mut tracker = TurnDiffTracker::new();
        tracker.on_patch_begin(&HashMap::from([(
            file.clone(),
            ApplyPatchFileChange::Add {
                content: "hi\n".to_string(),
            },
        )]));
        std::fs::write(&file, "hi\n").unwrap();

        let diff = tracker.get_unified_diff(dir.path()).unwrap();
        assert!(diff.contains("new file mode 100644\n--- /dev/null\n+++ b/new.txt\n"));
        assert!(diff.ends_with("+hi\n"));
    }

    #[test]
    fn reverted_file_drops_out() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "same\n").unwrap();
        let mut tracker = TurnDiffTracker::new();
        tracker.on_patch_begin(&update(&file));
        std::fs::write(&file, "changed\n").unwrap();
        std::fs::write(&file, "same\n").unwrap();
        assert_eq!(None, tracker.get_unified_diff(dir.path()));
        assert!(!tracker.is_empty());
    }
}
