//! Root of the `codex-core` library: the turn engine behind every front-end.
//!
//! Callers talk to it through [`ConversationManager`] and the
//! submission/event queue of [`CodexConversation`].

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the event stream or `tracing`.
#![deny(clippy::print_stdout, clippy::print_stderr)]

mod apply_patch;
mod approval_fingerprint;
pub mod bash;
mod client_common;
pub mod codex;
mod codex_conversation;
pub mod command_safety;
mod compact;
pub mod config;
pub mod config_types;
mod conversation_history;
mod conversation_manager;
pub mod error;
pub mod exec;
pub mod exec_env;
mod executor;
mod function_tool;
pub mod landlock;
pub mod mcp_connection_manager;
mod plan_tool;
pub mod rollout;
pub mod safety;
pub mod seatbelt;
pub mod spawn;
mod state;
pub mod tools;
pub mod truncate;
mod turn_diff_tracker;
mod unified_exec;
mod util;

pub use approval_fingerprint::command_fingerprint;
pub use client_common::BASE_INSTRUCTIONS;
pub use client_common::ModelClient;
pub use client_common::Prompt;
pub use client_common::ResponseEvent;
pub use client_common::ResponseStream;
pub use codex_conversation::CodexConversation;
pub use conversation_manager::ConversationManager;
pub use conversation_manager::NewConversation;
pub use rollout::RolloutRecorder;
pub use rollout::SESSIONS_SUBDIR;

pub use codex_protocol::protocol;
// Re-export protocol config enums to ensure downstream crates can name them
// without depending on codex-protocol directly.
pub use codex_protocol::config_types as protocol_config_types;
pub use codex_protocol::mcp;
pub use codex_protocol::models;
