//! JSON state persistence helpers.
//!
//! All durable state in courier (cursors, group registry) goes through
//! these two functions. Writes go to a temp file first and are renamed into
//! place so a crash mid-write never leaves a half-written state file.

use color_eyre::eyre::{Result, WrapErr};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Load state from a JSON file.
///
/// A missing file returns the type's default. A file that exists but does
/// not parse is treated as corrupted: a warning is logged and the default is
/// returned, so startup never fails on bad persisted state.
pub fn load_state<T: DeserializeOwned + Default>(path: &Path) -> T {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            eprintln!("[state] failed to read {}: {e}", path.display());
            return T::default();
        }
    };

    match serde_json::from_str(&content) {
        Ok(state) => state,
        Err(e) => {
            eprintln!(
                "[state] corrupted state file {} ({e}) — resetting to defaults",
                path.display()
            );
            T::default()
        }
    }
}

/// Save state to a JSON file, creating parent directories as needed.
pub fn save_state<T: Serialize>(path: &Path, state: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(state).wrap_err("failed to serialize state")?;

    // Write-then-rename keeps the previous file intact on failure.
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)
        .wrap_err_with(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .wrap_err_with(|| format!("failed to replace {}", path.display()))?;

    Ok(())
}
