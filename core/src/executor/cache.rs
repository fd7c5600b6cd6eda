use std::collections::HashSet;

/// Fingerprints of actions the user approved during this session. Owned by
/// the session state; a new session starts empty.
#[derive(Clone, Debug, Default)]
pub(crate) struct ApprovalCache {
    approved: HashSet<String>,
}

impl ApprovalCache {
    pub(crate) fn insert(&mut self, fingerprint: String) {
        if fingerprint.is_empty() {
            return;
        }
        self.approved.insert(fingerprint);
    }

    pub(crate) fn contains(&self, fingerprint: &str) -> bool {
        self.approved.contains(fingerprint)
    }

    pub(crate) fn snapshot(&self) -> HashSet<String> {
        self.approved.clone()
    }
}
