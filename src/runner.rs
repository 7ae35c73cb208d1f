//! Group runner — drives one worker invocation end to end.
//!
//! One call to [`run_invocation`] covers the whole
//! `Idle → Dispatched → Streaming → Completed | Failed` lifecycle: it builds
//! the prompt from the group's backlog, optimistically advances the agent
//! cursor, streams worker output to the channel under an idle timer, and on
//! failure decides whether the cursor rolls back.
//!
//! Rollback rule: a failed invocation that delivered no visible output rolls
//! the cursor back so the backlog is retried; once any output reached the
//! user the cursor holds, because retrying would duplicate the reply.

use crate::agent::{AgentEvent, ProcessRunner, PromptContext};
use crate::channel::Channel;
use crate::group::Group;
use crate::message::{Message, MessageLog};
use crate::queue::{InvocationHandle, TaskQueue};
use crate::store::CursorStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared collaborators handed to every invocation.
#[derive(Clone)]
pub struct RunnerContext {
    pub store: Arc<Mutex<CursorStore>>,
    pub log: Arc<MessageLog>,
    pub queue: Arc<TaskQueue>,
    pub channel: Arc<dyn Channel>,
    pub process: Arc<dyn ProcessRunner>,
    pub idle_timeout: Duration,
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Worker exited cleanly; cursor holds at the optimistic value.
    Completed,
    /// Worker failed; cursor rolled back unless output was delivered.
    Failed,
    /// Backlog was empty by dispatch time (consumed by a live-forward).
    NoOp,
}

/// Format a backlog into the worker prompt: one line per message.
pub fn format_batch(messages: &[Message]) -> String {
    let mut prompt = String::new();
    for m in messages {
        prompt.push_str(&format!("[{}] {}: {}\n", m.timestamp, m.sender, m.content));
    }
    prompt
}

/// Strip ```internal fenced blocks from worker output.
///
/// Workers annotate their replies with internal notes (tool traces, scratch
/// reasoning) in fenced blocks that must never reach the user.
pub fn strip_internal_markers(text: &str) -> String {
    let mut out = text.to_owned();
    while let Some(start) = out.find("```internal") {
        let after_fence = start + "```internal".len();
        match out[after_fence..].find("```") {
            Some(rel_end) => {
                let end = after_fence + rel_end + 3;
                out.replace_range(start..end, "");
            }
            None => {
                // Unterminated block — drop everything from the fence on.
                out.truncate(start);
                break;
            }
        }
    }
    out.trim().to_owned()
}

/// Run one worker invocation for a group.
///
/// The backlog is fetched here, not by the caller: between the dispatch
/// decision and this call a live-forward may have consumed the messages, in
/// which case the invocation is a no-op success.
pub async fn run_invocation(ctx: &RunnerContext, group: &Group) -> Outcome {
    let group_id = group.group_id.as_str();

    // Pre-dispatch cursor — the rollback target.
    let pre_dispatch = ctx
        .store
        .lock()
        .unwrap()
        .last_agent_timestamp(group_id);

    let backlog = ctx.log.fetch_group_after(group_id, &pre_dispatch);
    let Some(last) = backlog.last() else {
        return Outcome::NoOp;
    };
    let last_timestamp = last.timestamp.clone();

    // Optimistic advance, persisted before the worker produces anything, so
    // a worker that never replies does not replay the same backlog forever.
    {
        let mut store = ctx.store.lock().unwrap();
        if let Err(e) = store.set_last_agent_timestamp(group_id, &last_timestamp) {
            eprintln!("[runner:{group_id}] cursor advance failed, not dispatching: {e}");
            ctx.queue.enqueue_message_check(group_id);
            return Outcome::Failed;
        }
    }

    let session_handle = ctx.store.lock().unwrap().session_handle(group_id);
    let prompt = format_batch(&backlog);
    eprintln!(
        "[runner:{group_id}] dispatching worker for {} message(s) (through {last_timestamp})",
        backlog.len()
    );

    let handle = match ctx
        .process
        .spawn(PromptContext {
            prompt,
            session_handle,
            group_folder: group.folder.clone(),
            group_id: group.group_id.clone(),
        })
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("[runner:{group_id}] worker spawn failed: {e}");
            rollback(ctx, group_id, &pre_dispatch, &last_timestamp);
            return Outcome::Failed;
        }
    };

    let mut events = handle.events;
    let kill = handle.kill;
    let done = CancellationToken::new();

    if let Err(e) = ctx.queue.register(
        group_id,
        InvocationHandle {
            input: handle.input,
            kill: kill.clone(),
            done: done.clone(),
        },
    ) {
        // Another invocation won the race. Tear this worker down and put the
        // backlog back in play; the active invocation covers its own range.
        eprintln!("[runner:{group_id}] {e} — terminating duplicate worker");
        kill.cancel();
        rollback(ctx, group_id, &pre_dispatch, &last_timestamp);
        return Outcome::Failed;
    }

    ctx.channel.set_typing(group_id, true).await;

    let mut delivered = false;
    let mut worker_errored = false;
    let mut exit_success = false;
    let mut stdin_closed = false;

    let idle = tokio::time::sleep(ctx.idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(AgentEvent::Output(out)) => {
                    idle.as_mut()
                        .reset(tokio::time::Instant::now() + ctx.idle_timeout);

                    // Session handles are persisted as soon as they appear,
                    // independent of how this invocation ends — a later
                    // retry should reuse the continuity context.
                    if let Some(session) = &out.session {
                        let result = ctx
                            .store
                            .lock()
                            .unwrap()
                            .set_session_handle(group_id, session);
                        if let Err(e) = result {
                            eprintln!("[runner:{group_id}] failed to persist session handle: {e}");
                        }
                    }

                    if out.error {
                        worker_errored = true;
                        eprintln!("[runner:{group_id}] worker reported an error event");
                    }

                    if let Some(text) = &out.text {
                        let visible = strip_internal_markers(text);
                        if !visible.is_empty() {
                            match ctx.channel.send_message(group_id, &visible).await {
                                Ok(()) => delivered = true,
                                Err(e) => {
                                    eprintln!("[runner:{group_id}] channel send failed: {e}");
                                }
                            }
                        }
                    }
                }
                Some(AgentEvent::Exited { success }) => {
                    exit_success = success;
                    break;
                }
                None => {
                    // Event stream dropped without an exit event — treat as
                    // an abnormal termination.
                    eprintln!("[runner:{group_id}] worker event stream ended unexpectedly");
                    break;
                }
            },
            _ = &mut idle, if !stdin_closed => {
                eprintln!(
                    "[runner:{group_id}] no output for {:?} — closing worker input",
                    ctx.idle_timeout
                );
                stdin_closed = true;
                ctx.queue.close_stdin(group_id);
            }
        }
    }

    ctx.channel.set_typing(group_id, false).await;

    let outcome = if exit_success && !worker_errored {
        eprintln!("[runner:{group_id}] invocation completed");
        Outcome::Completed
    } else if delivered {
        // Partial output already reached the user; retrying would duplicate
        // it. Hold the cursor and log the failure server-side only.
        eprintln!("[runner:{group_id}] worker failed after delivering output — cursor holds");
        Outcome::Failed
    } else {
        eprintln!("[runner:{group_id}] worker failed with no output — rolling back for retry");
        rollback(ctx, group_id, &pre_dispatch, &last_timestamp);
        Outcome::Failed
    };

    // Removal resolves the done token that shutdown waits on, so every
    // cursor write above must land before it.
    ctx.queue.remove(group_id);
    outcome
}

/// Undo the optimistic advance and flag the group so the next tick retries
/// the backlog.
///
/// Compare-and-set: if the stored cursor no longer equals the value this
/// invocation advanced it to (a live-forward or a newer invocation moved
/// it), that owner's progress stands and nothing is undone here.
fn rollback(ctx: &RunnerContext, group_id: &str, pre_dispatch: &str, advanced_to: &str) {
    {
        let mut store = ctx.store.lock().unwrap();
        if store.last_agent_timestamp(group_id) != advanced_to {
            eprintln!("[runner:{group_id}] cursor moved since dispatch — skipping rollback");
            return;
        }
        if let Err(e) = store.set_last_agent_timestamp(group_id, pre_dispatch) {
            eprintln!("[runner:{group_id}] cursor rollback failed: {e}");
        }
    }
    ctx.queue.enqueue_message_check(group_id);
}
