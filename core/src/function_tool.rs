use thiserror::Error;

/// Failure of a single tool call. `RespondToModel` is recovered locally and
/// fed back to the model as the call's output; `Fatal` ends the turn.
#[derive(Debug, Error, PartialEq)]
pub enum FunctionCallError {
    #[error("{0}")]
    RespondToModel(String),
    #[error("LocalShellCall without call_id or id")]
    MissingLocalShellCallId,
    #[error("Fatal error: {0}")]
    Fatal(String),
}
