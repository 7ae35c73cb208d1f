//! Worker process runner.
//!
//! A worker is a black-box CLI: it receives a prompt (and any live-forwarded
//! follow-ups) on stdin and streams structured output events on stdout, one
//! JSON object per line: `{"text": ..., "session": ..., "status": "ok"}`.
//! Closing stdin tells it no further input is coming; it may still finish
//! naturally after that.
//!
//! [`ProcessRunner`] is the seam the pipeline is tested through;
//! [`CliRunner`] is the real implementation on `tokio::process`.

use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr};
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;

/// Everything a worker invocation needs to start.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub prompt: String,
    /// Continuation token from a previous invocation, if any.
    pub session_handle: Option<String>,
    pub group_folder: String,
    pub group_id: String,
}

/// A structured event streamed by a running worker.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Output(OutputEvent),
    /// Terminal event: the worker process exited.
    Exited { success: bool },
}

/// One output line from the worker.
#[derive(Debug, Clone, Default)]
pub struct OutputEvent {
    /// User-visible reply text, before internal-marker stripping.
    pub text: Option<String>,
    /// New continuation token, persisted as soon as it is seen.
    pub session: Option<String>,
    /// The worker reported an error for this event.
    pub error: bool,
}

/// Input commands for a running worker.
#[derive(Debug)]
pub enum AgentInput {
    /// Forward text into the worker's stdin.
    Text(String),
    /// Close stdin — no further input is coming.
    Close,
}

/// Live handles to a spawned worker.
///
/// A plain struct of channels rather than a trait object, so tests can hand
/// the runner a fully scripted worker without any process involved.
pub struct AgentHandle {
    pub events: mpsc::Receiver<AgentEvent>,
    pub input: mpsc::UnboundedSender<AgentInput>,
    /// Force-termination lever. Only shutdown pulls this.
    pub kill: CancellationToken,
}

/// Spawns worker invocations.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn spawn(&self, ctx: PromptContext) -> Result<AgentHandle>;
}

/// Wire shape of one stdout line from the worker.
#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    session: Option<String>,
    #[serde(default = "default_status")]
    status: String,
}

fn default_status() -> String {
    "ok".into()
}

/// Real worker runner: spawns the configured command with piped stdio.
pub struct CliRunner {
    command: String,
    args: Vec<String>,
    /// Root under which per-group working directories live.
    root: PathBuf,
}

impl CliRunner {
    pub fn new(config: &WorkerConfig, root: PathBuf) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            root,
        }
    }
}

#[async_trait]
impl ProcessRunner for CliRunner {
    async fn spawn(&self, ctx: PromptContext) -> Result<AgentHandle> {
        let workdir = self.root.join(&ctx.group_folder);
        std::fs::create_dir_all(&workdir)
            .wrap_err_with(|| format!("failed to create {}", workdir.display()))?;

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args);
        if let Some(handle) = &ctx.session_handle {
            cmd.args(["--resume", handle]);
        }
        cmd.args(["--group", &ctx.group_id]);
        cmd.current_dir(&workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .wrap_err_with(|| format!("failed to spawn worker `{}`", self.command))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| color_eyre::eyre::eyre!("worker has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| color_eyre::eyre::eyre!("worker has no stdout"))?;

        // Drain stderr to the daemon log.
        if let Some(stderr) = child.stderr.take() {
            let group_id = ctx.group_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    eprintln!("[worker:{group_id}] {line}");
                }
            });
        }

        // Input pump: prompt first, then live-forwarded text until Close.
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<AgentInput>();
        let prompt = ctx.prompt.clone();
        tokio::spawn(async move {
            if stdin.write_all(prompt.as_bytes()).await.is_err()
                || stdin.write_all(b"\n").await.is_err()
                || stdin.flush().await.is_err()
            {
                return;
            }
            while let Some(input) = input_rx.recv().await {
                match input {
                    AgentInput::Text(text) => {
                        if stdin.write_all(text.as_bytes()).await.is_err()
                            || stdin.write_all(b"\n").await.is_err()
                            || stdin.flush().await.is_err()
                        {
                            break;
                        }
                    }
                    AgentInput::Close => break,
                }
            }
            // Dropping stdin delivers EOF to the worker.
        });

        // Event pump: stdout lines → events, then the exit status.
        let (events_tx, events_rx) = mpsc::channel::<AgentEvent>(64);
        let kill = CancellationToken::new();
        let kill_watch = kill.clone();
        let group_id = ctx.group_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = kill_watch.cancelled() => {
                        eprintln!("[worker:{group_id}] force-terminating");
                        let _ = child.start_kill();
                        break;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<WireEvent>(line) {
                                Ok(wire) => {
                                    let event = AgentEvent::Output(OutputEvent {
                                        text: wire.text,
                                        session: wire.session,
                                        error: wire.status == "error",
                                    });
                                    if events_tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    eprintln!(
                                        "[worker:{group_id}] unparseable output line ({e}): {line}"
                                    );
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            eprintln!("[worker:{group_id}] stdout read error: {e}");
                            break;
                        }
                    }
                }
            }

            let success = match child.wait().await {
                Ok(status) => status.success(),
                Err(e) => {
                    eprintln!("[worker:{group_id}] wait failed: {e}");
                    false
                }
            };
            let _ = events_tx.send(AgentEvent::Exited { success }).await;
        });

        Ok(AgentHandle {
            events: events_rx,
            input: input_tx,
            kill,
        })
    }
}
