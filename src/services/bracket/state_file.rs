//! Crash-safe JSON persistence for bracket groups
//!
//! File layout:
//! ```json
//! { "groups": { "<gid>": { "entry_id": 1, "sl_id": 2, "tp_id": 3, "active": true, "entry_filled": 0.5 } } }
//! ```
//!
//! Writes go to `<path>.tmp` and are renamed over the target so a crash never
//! leaves a half-written file behind. Nothing here returns an error to the
//! caller: a broken or missing file means "no prior state".

use super::group::BracketGroup;
use crate::types::OrderId;
use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, error, info, warn};

#[derive(Serialize)]
struct StateDocument<'a> {
    groups: BTreeMap<&'a str, PersistedGroup>,
}

#[derive(Serialize)]
struct PersistedGroup {
    entry_id: Option<OrderId>,
    sl_id: Option<OrderId>,
    tp_id: Option<OrderId>,
    active: bool,
    #[serde(with = "rust_decimal::serde::float")]
    entry_filled: Decimal,
}

impl From<&BracketGroup> for PersistedGroup {
    fn from(group: &BracketGroup) -> Self {
        Self {
            entry_id: group.entry_id,
            sl_id: group.sl_id,
            tp_id: group.tp_id,
            active: group.active,
            entry_filled: group.entry_filled,
        }
    }
}

/// Location of the bracket state on disk
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling_path(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn tmp_path(&self) -> PathBuf {
        self.sibling_path(".tmp")
    }

    /// Claim exclusive write ownership of this state file.
    ///
    /// The lock is `<path>.lock` holding the owner's pid. A lock left behind by
    /// a process that no longer exists is taken over.
    pub fn lock(&self) -> Result<StateLock> {
        let lock_path = self.sibling_path(".lock");
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())
                        .with_context(|| format!("write {}", lock_path.display()))?;
                    debug!("[Bracket] Locked {}", self.path.display());
                    return Ok(StateLock { path: lock_path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let owner = fs::read_to_string(&lock_path)
                        .ok()
                        .and_then(|text| text.trim().parse::<u32>().ok());
                    match owner {
                        Some(pid) if process_alive(pid) => bail!(
                            "state file {} is owned by running process {} (lock {})",
                            self.path.display(),
                            pid,
                            lock_path.display()
                        ),
                        _ => {
                            warn!("[Bracket] Taking over stale lock {}", lock_path.display());
                            fs::remove_file(&lock_path)
                                .with_context(|| format!("remove stale {}", lock_path.display()))?;
                        }
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("create {}", lock_path.display()));
                }
            }
        }

        bail!("could not acquire {}", lock_path.display())
    }

    /// Read persisted groups. Inactive groups are not resurrected.
    pub fn load(&self) -> HashMap<String, BracketGroup> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("[Bracket] No state file at {}", self.path.display());
                return HashMap::new();
            }
            Err(e) => {
                warn!("[Bracket] Failed to read state file {}: {}", self.path.display(), e);
                return HashMap::new();
            }
        };

        let document: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!("[Bracket] Ignoring corrupt state file {}: {}", self.path.display(), e);
                return HashMap::new();
            }
        };

        let Some(entries) = document.get("groups").and_then(|g| g.as_object()) else {
            warn!(
                "[Bracket] Ignoring state file {}: expected an object with a \"groups\" object",
                self.path.display()
            );
            return HashMap::new();
        };

        let mut groups = HashMap::new();
        for (gid, raw) in entries {
            match decode_group(raw) {
                Some(group) if group.active => {
                    groups.insert(gid.clone(), group);
                }
                Some(_) => debug!("[Bracket] Dropping inactive group {} on load", gid),
                None => warn!("[Bracket] Skipping malformed group {} in state file", gid),
            }
        }

        info!(
            "[Bracket] Loaded {} active groups from {}",
            groups.len(),
            self.path.display()
        );
        groups
    }

    /// Write every group atomically. Returns false if the write failed.
    pub fn save(&self, groups: &HashMap<String, BracketGroup>) -> bool {
        match self.try_save(groups) {
            Ok(()) => true,
            Err(e) => {
                error!("[Bracket] Failed to persist state to {}: {:#}", self.path.display(), e);
                false
            }
        }
    }

    fn try_save(&self, groups: &HashMap<String, BracketGroup>) -> Result<()> {
        let document = StateDocument {
            groups: groups
                .iter()
                .map(|(gid, group)| (gid.as_str(), PersistedGroup::from(group)))
                .collect(),
        };
        let payload = serde_json::to_string_pretty(&document).context("encode state")?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }

        let tmp_path = self.tmp_path();
        fs::write(&tmp_path, payload)
            .with_context(|| format!("write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }

    /// Delete the state file. A missing file counts as removed.
    pub fn remove(&self) -> bool {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("[Bracket] Removed state file {}", self.path.display());
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!("[Bracket] Failed to remove state file {}: {}", self.path.display(), e);
                false
            }
        }
    }
}

/// Held while a process owns a state file; released on drop
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("[Bracket] Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Elsewhere every recorded owner counts as alive
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

fn decode_group(raw: &Value) -> Option<BracketGroup> {
    let fields = raw.as_object()?;

    Some(BracketGroup {
        entry_id: coerce_id(fields.get("entry_id")),
        sl_id: coerce_id(fields.get("sl_id")),
        tp_id: coerce_id(fields.get("tp_id")),
        active: fields.get("active").and_then(|v| v.as_bool()).unwrap_or(true),
        entry_filled: coerce_amount(fields.get("entry_filled")).max(Decimal::ZERO),
    })
}

/// Integer ids only; numeric strings and integral floats are accepted
fn coerce_id(value: Option<&Value>) -> Option<OrderId> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_amount(value: Option<&Value>) -> Decimal {
    match value {
        Some(Value::Number(n)) => n
            .as_f64()
            .and_then(|f| Decimal::try_from(f).ok())
            .unwrap_or_default(),
        Some(Value::String(s)) => Decimal::from_str(s.trim()).unwrap_or_default(),
        _ => Decimal::ZERO,
    }
}
