#![deny(unreachable_pub)]

pub mod config_types;
pub mod conversation_id;
pub mod mcp;
pub mod models;
pub mod plan_tool;
pub mod protocol;

pub use conversation_id::ConversationId;
