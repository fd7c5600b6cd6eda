// Aggregates all former standalone integration tests as modules.
mod approvals;
mod compact;
mod exec_timeout;
mod external_tools;
mod patch;
mod resume_fork;
mod turn_lifecycle;
