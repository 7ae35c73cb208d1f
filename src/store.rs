//! Durable cursor store.
//!
//! Two cursors drive the pipeline: the global `lastSeenTimestamp` (intake
//! progress — how far the dispatch loop has fetched) and a per-group
//! `lastAgentTimestamp` (processing progress — what has been handed to a
//! worker). The per-group record also carries the worker session handle used
//! for conversational continuity.
//!
//! Every mutation persists immediately. There is no batching: a crash leaves
//! the file consistent with the last completed mutation. The on-disk field
//! names (`lastSeenTimestamp`, `lastAgentTimestamp`, `sessionHandle`) are a
//! stable contract.

use crate::state::{load_state, save_state};
use color_eyre::eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Per-group durable state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupState {
    /// Timestamp of the last message handed to a worker. Empty string means
    /// nothing has been dispatched yet.
    #[serde(default)]
    pub last_agent_timestamp: String,

    /// Continuation token from the last completed (or partially completed)
    /// worker invocation.
    #[serde(default)]
    pub session_handle: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreState {
    /// Global intake cursor across all groups.
    #[serde(default)]
    last_seen_timestamp: String,

    #[serde(default)]
    groups: HashMap<String, GroupState>,
}

/// Write-through cursor store backed by `.courier/state.json`.
pub struct CursorStore {
    path: PathBuf,
    state: StoreState,
}

impl CursorStore {
    /// Load or create the store under the given state directory. Corrupted
    /// files reset to empty defaults (logged by the state helpers).
    pub fn load(state_dir: &Path) -> Self {
        let path = state_dir.join("state.json");
        let state: StoreState = load_state(&path);
        Self { path, state }
    }

    fn persist(&self) -> Result<()> {
        save_state(&self.path, &self.state).wrap_err("cursor store persistence failed")
    }

    pub fn global_timestamp(&self) -> &str {
        &self.state.last_seen_timestamp
    }

    /// Advance the global intake cursor. Persists before returning; on
    /// failure the in-memory value is rolled back so memory never runs ahead
    /// of disk.
    pub fn set_global_timestamp(&mut self, ts: &str) -> Result<()> {
        let previous =
            std::mem::replace(&mut self.state.last_seen_timestamp, ts.to_owned());
        if let Err(e) = self.persist() {
            self.state.last_seen_timestamp = previous;
            return Err(e);
        }
        Ok(())
    }

    pub fn group_state(&self, group_id: &str) -> GroupState {
        self.state.groups.get(group_id).cloned().unwrap_or_default()
    }

    pub fn last_agent_timestamp(&self, group_id: &str) -> String {
        self.group_state(group_id).last_agent_timestamp
    }

    pub fn session_handle(&self, group_id: &str) -> Option<String> {
        self.group_state(group_id).session_handle
    }

    /// Set a group's agent cursor (both the optimistic advance and the
    /// explicit rollback go through here).
    pub fn set_last_agent_timestamp(&mut self, group_id: &str, ts: &str) -> Result<()> {
        let entry = self.state.groups.entry(group_id.to_owned()).or_default();
        let previous = std::mem::replace(&mut entry.last_agent_timestamp, ts.to_owned());
        if let Err(e) = self.persist() {
            if let Some(entry) = self.state.groups.get_mut(group_id) {
                entry.last_agent_timestamp = previous;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Persist a new session handle for a group.
    pub fn set_session_handle(&mut self, group_id: &str, handle: &str) -> Result<()> {
        let entry = self.state.groups.entry(group_id.to_owned()).or_default();
        let previous = entry.session_handle.replace(handle.to_owned());
        if let Err(e) = self.persist() {
            if let Some(entry) = self.state.groups.get_mut(group_id) {
                entry.session_handle = previous;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Drop all state for a group (group deletion).
    pub fn remove_group(&mut self, group_id: &str) -> Result<()> {
        if self.state.groups.remove(group_id).is_some() {
            self.persist()?;
        }
        Ok(())
    }
}
