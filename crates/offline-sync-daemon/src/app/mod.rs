//! Application wiring, lifecycle, and offline maintenance commands.

mod init;
mod lifecycle;
mod local;

pub use init::run_daemon;
pub use lifecycle::check_status;
pub use local::{list_conflicts, resolve_conflict, retry_failed};
