//! Append-only JSONL log of a conversation, used to resume and fork it.

pub const SESSIONS_SUBDIR: &str = "sessions";

pub(crate) mod policy;
pub mod recorder;

pub use recorder::RolloutRecorder;
pub use recorder::RolloutRecorderParams;
