//! Group registry — which conversations courier serves, and their trigger
//! policy.
//!
//! Groups are registered by the transport layer (or the CLI) and persisted
//! to `.courier/groups.json`. Metadata is immutable except via explicit
//! re-registration, which overwrites.

use crate::state::{load_state, save_state};
use chrono::{DateTime, Utc};
use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Metadata for one registered conversation group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub group_id: String,
    /// Namespace the group's worker runs in (working directory name).
    pub folder: String,
    pub name: String,
    /// Whether a trigger phrase is required before dispatching a worker.
    /// The main group ignores this — it never requires one.
    pub requires_trigger: bool,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryState {
    #[serde(default)]
    groups: HashMap<String, Group>,
}

/// Persistent registry of groups.
pub struct GroupRegistry {
    path: PathBuf,
    state: RegistryState,
}

impl GroupRegistry {
    /// Load or create the registry under the given state directory.
    pub fn load(state_dir: &Path) -> Self {
        let path = state_dir.join("groups.json");
        let state: RegistryState = load_state(&path);
        Self { path, state }
    }

    pub fn save(&self) -> Result<()> {
        save_state(&self.path, &self.state)
    }

    pub fn get(&self, group_id: &str) -> Option<&Group> {
        self.state.groups.get(group_id)
    }

    pub fn contains(&self, group_id: &str) -> bool {
        self.state.groups.contains_key(group_id)
    }

    pub fn all(&self) -> Vec<&Group> {
        let mut groups: Vec<&Group> = self.state.groups.values().collect();
        groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        groups
    }

    /// Register a group. Re-registration replaces the existing metadata.
    /// Returns true if this was a new registration.
    pub fn register(&mut self, group: Group) -> bool {
        self.state
            .groups
            .insert(group.group_id.clone(), group)
            .is_none()
    }

    /// Remove a group. Returns true if it existed.
    pub fn remove(&mut self, group_id: &str) -> bool {
        self.state.groups.remove(group_id).is_some()
    }

    /// Whether a batch of message texts satisfies the group's trigger policy.
    ///
    /// The main group never requires a trigger. Other groups require the
    /// trigger phrase (case-insensitive substring) in at least one message of
    /// the batch, unless registered with `requires_trigger: false`.
    pub fn trigger_satisfied<'a>(
        &self,
        group_id: &str,
        main_group: &str,
        trigger: &str,
        texts: impl IntoIterator<Item = &'a str>,
    ) -> bool {
        if group_id == main_group {
            return true;
        }
        match self.get(group_id) {
            Some(group) if !group.requires_trigger => true,
            Some(_) => {
                let needle = trigger.to_lowercase();
                texts
                    .into_iter()
                    .any(|t| t.to_lowercase().contains(&needle))
            }
            None => false,
        }
    }
}
