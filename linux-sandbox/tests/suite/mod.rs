// Aggregates all former standalone integration tests as modules.
#[cfg(target_os = "linux")]
mod landlock;
#[cfg(target_os = "linux")]
mod session;
