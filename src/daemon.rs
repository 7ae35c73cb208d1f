//! Daemon mode — the long-running courier process.
//!
//! Wires the channel, worker runner, and dispatch loop together under a
//! `tokio::select!` lifecycle: transport batches flow into the message log,
//! the dispatch loop polls on its interval, and SIGTERM/SIGINT trigger a
//! deadline-bounded worker drain before exit.

use crate::agent::CliRunner;
use crate::channel::{Channel, InboundBatch, StdioChannel};
use crate::config::Config;
use crate::dispatch::Pipeline;
use crate::group::GroupRegistry;
use crate::store::CursorStore;
use color_eyre::eyre::{Result, WrapErr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// PID file helpers
// ---------------------------------------------------------------------------

fn pid_path(root: &Path) -> PathBuf {
    root.join(".courier").join("daemon.pid")
}

fn log_path(root: &Path) -> PathBuf {
    root.join(".courier").join("daemon.log")
}

fn write_pid(root: &Path) -> Result<()> {
    let path = pid_path(root);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, std::process::id().to_string())
        .wrap_err_with(|| format!("failed to write PID file {}", path.display()))
}

fn read_pid(root: &Path) -> Option<u32> {
    std::fs::read_to_string(pid_path(root))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn remove_pid(root: &Path) {
    let _ = std::fs::remove_file(pid_path(root));
}

fn is_process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

// ---------------------------------------------------------------------------
// Public API: start / stop / status
// ---------------------------------------------------------------------------

/// Start the daemon.
///
/// By default, spawns a detached child with output redirected to
/// `.courier/daemon.log` and returns immediately. With `foreground: true`,
/// runs the event loop inline.
pub async fn start(root: &Path, foreground: bool) -> Result<()> {
    if let Some(pid) = read_pid(root) {
        if is_process_alive(pid) {
            color_eyre::eyre::bail!("daemon already running (PID {pid})");
        }
        eprintln!("[daemon] Removing stale PID file (PID {pid} is not running)");
        remove_pid(root);
    }

    if !foreground {
        return spawn_background(root);
    }

    let config = Config::load(root)?;

    write_pid(root)?;
    eprintln!("[daemon] Started (PID {})", std::process::id());
    eprintln!("[daemon] Main group: {}", config.main_group);
    eprintln!("[daemon] Worker command: {}", config.worker.command);
    eprintln!(
        "[daemon] Poll {}s, idle timeout {}s",
        config.poll_interval_secs, config.idle_timeout_secs
    );

    let result = run(root, config).await;

    remove_pid(root);
    eprintln!("[daemon] PID file removed");
    result
}

/// Spawn `courier daemon start --foreground` as a detached background
/// process with output redirected to the daemon log.
fn spawn_background(root: &Path) -> Result<()> {
    let exe = std::env::current_exe().wrap_err("failed to find courier executable")?;
    let log = log_path(root);
    if let Some(parent) = log.parent() {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
    }

    let log_file = std::fs::File::create(&log)
        .wrap_err_with(|| format!("failed to create log file {}", log.display()))?;
    let stderr_file = log_file
        .try_clone()
        .wrap_err("failed to clone log file handle")?;

    let mut cmd = std::process::Command::new(exe);
    cmd.args(["daemon", "start", "--foreground"]);
    cmd.args(["-C", &root.display().to_string()]);
    cmd.stdout(log_file);
    cmd.stderr(stderr_file);
    cmd.stdin(std::process::Stdio::null());

    // Detach from our process group so it survives our exit.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd.spawn().wrap_err("failed to spawn daemon process")?;
    println!("daemon started (PID {})", child.id());
    println!("logs: {}", log.display());
    Ok(())
}

/// Stop the running daemon by PID file and SIGTERM, escalating to SIGKILL.
pub fn stop(root: &Path) -> Result<()> {
    let pid = match read_pid(root) {
        Some(pid) => pid,
        None => {
            eprintln!("daemon is not running (no PID file)");
            return Ok(());
        }
    };

    if !is_process_alive(pid) {
        eprintln!("daemon is not running (PID {pid} is stale), removing PID file");
        remove_pid(root);
        return Ok(());
    }

    let _ = std::process::Command::new("kill")
        .args([&pid.to_string()])
        .status();

    // Wait up to 15 seconds — shutdown waits for worker drain first.
    for _ in 0..150 {
        if !is_process_alive(pid) {
            remove_pid(root);
            eprintln!("daemon stopped (PID {pid})");
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    let _ = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status();
    remove_pid(root);
    eprintln!("daemon killed (PID {pid})");
    Ok(())
}

/// Print daemon and pipeline status for the CLI.
pub fn status(root: &Path) -> Result<()> {
    match read_pid(root) {
        Some(pid) if is_process_alive(pid) => println!("daemon: running (PID {pid})"),
        Some(pid) => println!("daemon: not running (stale PID file, PID {pid})"),
        None => println!("daemon: not running"),
    }

    let state_dir = Config::state_dir(root);
    let store = CursorStore::load(&state_dir);
    let groups = GroupRegistry::load(&state_dir);

    let global = store.global_timestamp();
    println!(
        "global cursor: {}",
        if global.is_empty() { "(none)" } else { global }
    );
    for group in groups.all() {
        let state = store.group_state(&group.group_id);
        println!(
            "group {} ({}): cursor {}, session {}",
            group.group_id,
            group.name,
            if state.last_agent_timestamp.is_empty() {
                "(none)"
            } else {
                &state.last_agent_timestamp
            },
            state.session_handle.as_deref().unwrap_or("(none)"),
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

async fn run(root: &Path, config: Config) -> Result<()> {
    let state_dir = Config::state_dir(root);
    let store = CursorStore::load(&state_dir);
    let groups = GroupRegistry::load(&state_dir);

    let channel: Arc<dyn Channel> = Arc::new(StdioChannel::new(config.main_group.clone()));
    let process = Arc::new(CliRunner::new(&config.worker, root.to_path_buf()));

    let pipeline = Arc::new(Pipeline::new(config, store, groups, channel.clone(), process));

    let cancel = CancellationToken::new();

    // SIGTERM/SIGINT handler.
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        eprintln!("\n[daemon] Shutdown signal received");
        shutdown_cancel.cancel();
    });

    // Transport receive loop feeding the message log.
    let (tx, mut rx) = mpsc::channel::<InboundBatch>(64);
    let channel_cancel = cancel.clone();
    let run_channel = channel.clone();
    tokio::spawn(async move {
        run_channel.run(tx, channel_cancel).await;
    });

    let intake_pipeline = pipeline.clone();
    let intake_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = intake_cancel.cancelled() => break,
                batch = rx.recv() => {
                    let Some(batch) = batch else { break };
                    intake_pipeline.on_new_messages(&batch.group_id, batch.messages);
                }
            }
        }
    });

    // Anything that arrived while we were down gets flagged for the first
    // tick; the tick itself decides whether workers are spawned.
    pipeline.recover_pending_messages();

    eprintln!("[daemon] Ready.");
    pipeline.run(cancel.clone()).await;

    // Drain workers before exiting; cursor writes are write-through so no
    // extra state save is needed here.
    pipeline.shutdown().await;
    eprintln!("[daemon] Goodbye.");
    Ok(())
}
