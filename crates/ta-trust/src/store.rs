// store.rs — Persistence for trust records, transitions, rules and tiers.
//
// Two implementations of `TrustStore`:
//
// - `MemoryTrustStore`: everything behind one mutex. Used by simulation and
//   tests.
// - `JsonFileTrustStore`: a directory layout
//
//     <root>/states/<digest>.json   one TrustStateRecord per key
//     <root>/transitions.jsonl      append-only TrustTransition log
//     <root>/tier_changes.jsonl     append-only TierChangeRecord log
//     <root>/rules.json             trajectory rule set
//
// Both stores re-validate a transition's state pair before writing it and
// refuse to change `current_state` outside `commit_transition`.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use ta_audit::hasher::short_digest;

use crate::error::TrustError;
use crate::rules::TrajectoryRule;
use crate::state::{TrustKey, TrustStateRecord, TrustTransition};
use crate::tier::TierChangeRecord;

/// Storage collaborator for the tier and trajectory engines.
pub trait TrustStore: Send + Sync {
    fn load_state(&self, key: &TrustKey) -> Result<Option<TrustStateRecord>, TrustError>;

    /// Persist counter updates. Rejects a change of `current_state`.
    fn save_state(&self, record: &TrustStateRecord) -> Result<(), TrustError>;

    /// Write the post-transition record and append the transition together.
    fn commit_transition(
        &self,
        record: &TrustStateRecord,
        transition: &TrustTransition,
    ) -> Result<(), TrustError>;

    /// Transitions for a key, oldest first.
    fn transitions(&self, key: &TrustKey) -> Result<Vec<TrustTransition>, TrustError>;

    /// The stored rule set; empty when none has been saved.
    fn load_rules(&self) -> Result<Vec<TrajectoryRule>, TrustError>;

    fn save_rules(&self, rules: &[TrajectoryRule]) -> Result<(), TrustError>;

    fn last_tier_change(&self, key: &TrustKey) -> Result<Option<TierChangeRecord>, TrustError>;

    fn append_tier_change(&self, record: &TierChangeRecord) -> Result<(), TrustError>;

    /// Tier changes for a key, oldest first.
    fn tier_changes(&self, key: &TrustKey) -> Result<Vec<TierChangeRecord>, TrustError>;
}

/// Checks shared by both stores before a transition is written.
fn check_commit(
    record: &TrustStateRecord,
    transition: &TrustTransition,
) -> Result<(), TrustError> {
    let edge = transition.validate()?;
    if record.current_state != edge.to()
        || record.capability_id != transition.capability_id
        || record.action_id != transition.action_id
    {
        return Err(TrustError::InvalidTransition {
            from: edge.from(),
            to: record.current_state,
        });
    }
    Ok(())
}

fn check_save(
    existing: Option<&TrustStateRecord>,
    record: &TrustStateRecord,
) -> Result<(), TrustError> {
    match existing {
        Some(old) if old.current_state != record.current_state => {
            Err(TrustError::InvalidTransition {
                from: old.current_state,
                to: record.current_state,
            })
        }
        _ => Ok(()),
    }
}

#[derive(Default)]
struct MemoryInner {
    states: HashMap<TrustKey, TrustStateRecord>,
    transitions: Vec<TrustTransition>,
    tier_changes: Vec<TierChangeRecord>,
    rules: Vec<TrajectoryRule>,
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryTrustStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-loaded with a rule set.
    pub fn with_rules(rules: Vec<TrajectoryRule>) -> Self {
        let store = Self::default();
        if let Ok(mut inner) = store.inner.lock() {
            inner.rules = rules;
        }
        store
    }
}

impl TrustStore for MemoryTrustStore {
    fn load_state(&self, key: &TrustKey) -> Result<Option<TrustStateRecord>, TrustError> {
        Ok(self.inner.lock()?.states.get(key).cloned())
    }

    fn save_state(&self, record: &TrustStateRecord) -> Result<(), TrustError> {
        let mut inner = self.inner.lock()?;
        let key = record.key();
        check_save(inner.states.get(&key), record)?;
        inner.states.insert(key, record.clone());
        Ok(())
    }

    fn commit_transition(
        &self,
        record: &TrustStateRecord,
        transition: &TrustTransition,
    ) -> Result<(), TrustError> {
        check_commit(record, transition)?;
        let mut inner = self.inner.lock()?;
        inner.states.insert(record.key(), record.clone());
        inner.transitions.push(transition.clone());
        Ok(())
    }

    fn transitions(&self, key: &TrustKey) -> Result<Vec<TrustTransition>, TrustError> {
        Ok(self
            .inner
            .lock()?
            .transitions
            .iter()
            .filter(|t| t.capability_id == key.capability_id && t.action_id == key.action_id)
            .cloned()
            .collect())
    }

    fn load_rules(&self) -> Result<Vec<TrajectoryRule>, TrustError> {
        Ok(self.inner.lock()?.rules.clone())
    }

    fn save_rules(&self, rules: &[TrajectoryRule]) -> Result<(), TrustError> {
        self.inner.lock()?.rules = rules.to_vec();
        Ok(())
    }

    fn last_tier_change(&self, key: &TrustKey) -> Result<Option<TierChangeRecord>, TrustError> {
        Ok(self
            .inner
            .lock()?
            .tier_changes
            .iter()
            .rev()
            .find(|r| r.capability_id == key.capability_id && r.action_id == key.action_id)
            .cloned())
    }

    fn append_tier_change(&self, record: &TierChangeRecord) -> Result<(), TrustError> {
        self.inner.lock()?.tier_changes.push(record.clone());
        Ok(())
    }

    fn tier_changes(&self, key: &TrustKey) -> Result<Vec<TierChangeRecord>, TrustError> {
        Ok(self
            .inner
            .lock()?
            .tier_changes
            .iter()
            .filter(|r| r.capability_id == key.capability_id && r.action_id == key.action_id)
            .cloned()
            .collect())
    }
}

/// File-backed store rooted at a directory (conventionally `.ta/trust/`).
pub struct JsonFileTrustStore {
    root: PathBuf,
    // Serializes writers within this process; appends are line-sized.
    write_lock: Mutex<()>,
}

impl JsonFileTrustStore {
    /// Open (and create if needed) a store at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, TrustError> {
        let root = root.as_ref().to_path_buf();
        let states = root.join("states");
        fs::create_dir_all(&states).map_err(|source| TrustError::Io {
            path: states.display().to_string(),
            source,
        })?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_file(&self, key: &TrustKey) -> PathBuf {
        let digest = short_digest(&format!("{}\u{0}{}", key.capability_id, key.action_id), 32);
        self.root.join("states").join(format!("{}.json", digest))
    }

    fn transitions_file(&self) -> PathBuf {
        self.root.join("transitions.jsonl")
    }

    fn tier_changes_file(&self) -> PathBuf {
        self.root.join("tier_changes.jsonl")
    }

    fn rules_file(&self) -> PathBuf {
        self.root.join("rules.json")
    }

    fn read_state(&self, key: &TrustKey) -> Result<Option<TrustStateRecord>, TrustError> {
        let path = self.state_file(key);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path).map_err(|source| TrustError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Write the state through a temp file and rename, so readers never see
    /// a half-written record. Returns the temp path still to be renamed.
    fn stage_state(&self, record: &TrustStateRecord) -> Result<(PathBuf, PathBuf), TrustError> {
        let path = self.state_file(&record.key());
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&tmp, json).map_err(|source| TrustError::Io {
            path: tmp.display().to_string(),
            source,
        })?;
        Ok((tmp, path))
    }

    fn publish(tmp: &Path, path: &Path) -> Result<(), TrustError> {
        fs::rename(tmp, path).map_err(|source| TrustError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<(), TrustError> {
    let line = serde_json::to_string(value)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| TrustError::Io {
            path: path.display().to_string(),
            source,
        })?;
    writeln!(file, "{}", line).map_err(|source| TrustError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, TrustError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path).map_err(|source| TrustError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| TrustError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

impl TrustStore for JsonFileTrustStore {
    fn load_state(&self, key: &TrustKey) -> Result<Option<TrustStateRecord>, TrustError> {
        self.read_state(key)
    }

    fn save_state(&self, record: &TrustStateRecord) -> Result<(), TrustError> {
        let _guard = self.write_lock.lock()?;
        let existing = self.read_state(&record.key())?;
        check_save(existing.as_ref(), record)?;
        let (tmp, path) = self.stage_state(record)?;
        Self::publish(&tmp, &path)
    }

    fn commit_transition(
        &self,
        record: &TrustStateRecord,
        transition: &TrustTransition,
    ) -> Result<(), TrustError> {
        check_commit(record, transition)?;
        let _guard = self.write_lock.lock()?;
        let (tmp, path) = self.stage_state(record)?;
        if let Err(e) = append_line(&self.transitions_file(), transition) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Self::publish(&tmp, &path)
    }

    fn transitions(&self, key: &TrustKey) -> Result<Vec<TrustTransition>, TrustError> {
        let all: Vec<TrustTransition> = read_lines(&self.transitions_file())?;
        Ok(all
            .into_iter()
            .filter(|t| t.capability_id == key.capability_id && t.action_id == key.action_id)
            .collect())
    }

    fn load_rules(&self) -> Result<Vec<TrajectoryRule>, TrustError> {
        let path = self.rules_file();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let json = fs::read_to_string(&path).map_err(|source| TrustError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    fn save_rules(&self, rules: &[TrajectoryRule]) -> Result<(), TrustError> {
        let _guard = self.write_lock.lock()?;
        let path = self.rules_file();
        let json = serde_json::to_string_pretty(rules)?;
        fs::write(&path, json).map_err(|source| TrustError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    fn last_tier_change(&self, key: &TrustKey) -> Result<Option<TierChangeRecord>, TrustError> {
        Ok(self.tier_changes(key)?.pop())
    }

    fn append_tier_change(&self, record: &TierChangeRecord) -> Result<(), TrustError> {
        let _guard = self.write_lock.lock()?;
        append_line(&self.tier_changes_file(), record)
    }

    fn tier_changes(&self, key: &TrustKey) -> Result<Vec<TierChangeRecord>, TrustError> {
        let all: Vec<TierChangeRecord> = read_lines(&self.tier_changes_file())?;
        Ok(all
            .into_iter()
            .filter(|r| r.capability_id == key.capability_id && r.action_id == key.action_id)
            .collect())
    }
}
