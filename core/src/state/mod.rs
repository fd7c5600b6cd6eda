//! Mutable state owned by a session and by the turn it is running.

mod session;
mod turn;

pub(crate) use session::ActiveTurn;
pub(crate) use session::SessionState;
pub(crate) use turn::TurnCancellation;
pub(crate) use turn::TurnContext;
pub(crate) use turn::TurnState;
