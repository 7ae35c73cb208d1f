//! Group task queue — the active-invocation registry.
//!
//! Owns, for every group, at most one live worker invocation. Live-forward
//! (`try_send`) is a synchronous check-and-write against this registry, so
//! the dispatch loop can route text into a running worker without awaiting.
//! The queue also tracks groups flagged for re-evaluation on the next
//! dispatch tick and drains all workers on shutdown.

use crate::agent::AgentInput;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Registration failure. `register` is the single enforcement point for the
/// at-most-one-invocation-per-group invariant.
#[derive(Debug, PartialEq, Eq)]
pub enum RegisterError {
    DuplicateActiveInvocation,
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateActiveInvocation => {
                write!(f, "an active invocation already exists for this group")
            }
        }
    }
}

impl std::error::Error for RegisterError {}

/// What a group runner hands over when its worker starts.
pub struct InvocationHandle {
    /// Input side of the worker (live-forward target).
    pub input: UnboundedSender<AgentInput>,
    /// Force-termination lever.
    pub kill: CancellationToken,
    /// Cancelled by the runner once the invocation is fully resolved
    /// (worker gone, cursor persistence finished).
    pub done: CancellationToken,
}

struct ActiveInvocation {
    input: UnboundedSender<AgentInput>,
    stdin_open: bool,
    kill: CancellationToken,
    done: CancellationToken,
}

/// Registry of active invocations plus the pending-check set.
#[derive(Default)]
pub struct TaskQueue {
    active: Mutex<HashMap<String, ActiveInvocation>>,
    pending: Mutex<BTreeSet<String>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward `text` into the group's running worker, if one exists and its
    /// input stream is still open. Returns false with no side effects
    /// otherwise.
    pub fn try_send(&self, group_id: &str, text: &str) -> bool {
        let mut active = self.active.lock().unwrap();
        match active.get_mut(group_id) {
            Some(inv) if inv.stdin_open => {
                if inv.input.send(AgentInput::Text(text.to_owned())).is_ok() {
                    true
                } else {
                    // Input side already gone — the worker is exiting.
                    inv.stdin_open = false;
                    false
                }
            }
            _ => false,
        }
    }

    /// Install a new active invocation for a group.
    pub fn register(
        &self,
        group_id: &str,
        handle: InvocationHandle,
    ) -> Result<(), RegisterError> {
        let mut active = self.active.lock().unwrap();
        if active.contains_key(group_id) {
            return Err(RegisterError::DuplicateActiveInvocation);
        }
        active.insert(
            group_id.to_owned(),
            ActiveInvocation {
                input: handle.input,
                stdin_open: true,
                kill: handle.kill,
                done: handle.done,
            },
        );
        Ok(())
    }

    /// Close the invocation's input stream. Idempotent; no-op when the group
    /// has no active invocation.
    pub fn close_stdin(&self, group_id: &str) {
        let mut active = self.active.lock().unwrap();
        if let Some(inv) = active.get_mut(group_id) {
            if inv.stdin_open {
                inv.stdin_open = false;
                let _ = inv.input.send(AgentInput::Close);
            }
        }
    }

    /// Remove the group's invocation and mark it resolved. Called by the
    /// group runner when the worker terminates — the only 1→0 transition.
    pub fn remove(&self, group_id: &str) {
        let removed = self.active.lock().unwrap().remove(group_id);
        if let Some(inv) = removed {
            inv.done.cancel();
        }
    }

    pub fn is_active(&self, group_id: &str) -> bool {
        self.active.lock().unwrap().contains_key(group_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Flag a group as having unconsumed messages so the dispatch loop
    /// re-evaluates it on its next tick. Duplicate flags collapse.
    pub fn enqueue_message_check(&self, group_id: &str) {
        self.pending.lock().unwrap().insert(group_id.to_owned());
    }

    /// Drain the pending-check set.
    pub fn take_pending(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending.lock().unwrap())
            .into_iter()
            .collect()
    }

    /// Re-flag groups whose tick could not run (store failure).
    pub fn requeue_pending(&self, group_ids: &[String]) {
        let mut pending = self.pending.lock().unwrap();
        for id in group_ids {
            pending.insert(id.clone());
        }
    }

    /// Drain all active invocations: close every input stream, wait up to
    /// `deadline` for natural termination, force-terminate the rest, and
    /// return once every invocation has resolved. Resolution happens after
    /// the runner's final cursor persistence, so no write is in flight when
    /// this returns.
    pub async fn shutdown(&self, deadline: Duration) {
        let watch: Vec<(String, CancellationToken, CancellationToken)> = {
            let mut active = self.active.lock().unwrap();
            for inv in active.values_mut() {
                if inv.stdin_open {
                    inv.stdin_open = false;
                    let _ = inv.input.send(AgentInput::Close);
                }
            }
            active
                .iter()
                .map(|(id, inv)| (id.clone(), inv.done.clone(), inv.kill.clone()))
                .collect()
        };

        if watch.is_empty() {
            return;
        }
        eprintln!(
            "[queue] shutting down — waiting for {} worker(s)",
            watch.len()
        );

        let give_up_at = tokio::time::Instant::now() + deadline;
        for (_, done, _) in &watch {
            if tokio::time::timeout_at(give_up_at, done.cancelled())
                .await
                .is_err()
            {
                break;
            }
        }

        for (group_id, done, kill) in &watch {
            if !done.is_cancelled() {
                eprintln!("[queue] worker for {group_id} still running past deadline — terminating");
                kill.cancel();
            }
        }

        for (_, done, _) in &watch {
            done.cancelled().await;
        }
        eprintln!("[queue] all workers resolved");
    }
}
