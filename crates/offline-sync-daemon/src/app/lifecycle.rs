//! Daemon status.

use crate::app::local::{open_local, running_daemon_pid};
use sync_config_and_utils::{Config, Paths};

/// Print queue and conflict counters from the durable store.
pub fn check_status(
    config: &Config,
    paths: &Paths,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let pid = running_daemon_pid(paths);

    if !paths.store_file().exists() {
        if json {
            println!("{}", serde_json::json!({ "running": pid.is_some(), "pid": pid }));
        } else {
            println!("No local state at {}", paths.base_dir().display());
        }
        return Ok(());
    }

    let local = open_local(config, paths)?;
    let messages = local.messages.stats();
    let sync = local.sync.stats();

    if json {
        let status = serde_json::json!({
            "running": pid.is_some(),
            "pid": pid,
            "message_queue": messages,
            "sync_queue": sync,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    match pid {
        Some(pid) => println!("Daemon is running (PID {})", pid),
        None => println!("Daemon is not running"),
    }
    println!("  Store:     {}", paths.store_file().display());
    println!("Message queue");
    println!("  Pending:   {}", messages.pending);
    println!("  Sent:      {}", messages.sent);
    println!("  Failed:    {}", messages.failed);
    println!("Sync queue");
    println!("  Pending:   {}", sync.pending);
    println!("  Failed:    {}", sync.failed);
    println!("  Conflicts: {} unresolved", sync.unresolved_conflicts);

    Ok(())
}
