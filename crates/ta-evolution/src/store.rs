// store.rs — Persistence for evolution decisions.
//
// Decisions are append-only: `insert` refuses an existing id and
// `update_review` touches only the review fields, so evidence and
// explanation can never be rewritten after the fact. `update_review` is a
// compare-and-set on the status: of two concurrent reviews only one lands.
//
// JsonFileDecisionStore keeps one file per decision:
// `<root>/<decision_id>.json`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use uuid::Uuid;

use crate::decision::{DecisionStatus, EvolutionDecision, ReviewRecord};
use crate::error::EvolutionError;

/// The mutable part of a stored decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewUpdate {
    pub status: DecisionStatus,
    /// Replaces the stored review when set.
    pub review: Option<ReviewRecord>,
    /// Replaces the stored review handle when set.
    pub review_id: Option<String>,
}

impl ReviewUpdate {
    pub fn status(status: DecisionStatus) -> Self {
        Self {
            status,
            review: None,
            review_id: None,
        }
    }

    /// Apply to `decision` if it still has the `expected` status.
    fn apply_if(
        self,
        decision: &mut EvolutionDecision,
        expected: DecisionStatus,
    ) -> Result<(), EvolutionError> {
        if decision.status != expected {
            return Err(EvolutionError::InvalidStatus {
                decision_id: decision.decision_id,
                status: decision.status,
                expected,
            });
        }
        self.apply(decision);
        Ok(())
    }

    fn apply(self, decision: &mut EvolutionDecision) {
        decision.status = self.status;
        if let Some(review) = self.review {
            decision.review = Some(review);
        }
        if let Some(review_id) = self.review_id {
            decision.review_id = Some(review_id);
        }
    }
}

pub trait DecisionStore: Send + Sync {
    /// Store a new decision. Fails with `Duplicate` if the id exists.
    fn insert(&self, decision: &EvolutionDecision) -> Result<(), EvolutionError>;

    fn get(&self, decision_id: Uuid) -> Result<Option<EvolutionDecision>, EvolutionError>;

    /// Apply a review update and return the stored decision. Fails with
    /// `InvalidStatus`, leaving the decision untouched, unless its status is
    /// still `expected`.
    fn update_review(
        &self,
        decision_id: Uuid,
        expected: DecisionStatus,
        update: ReviewUpdate,
    ) -> Result<EvolutionDecision, EvolutionError>;

    /// Every decision, newest first.
    fn list(&self) -> Result<Vec<EvolutionDecision>, EvolutionError>;

    fn list_by_status(
        &self,
        status: DecisionStatus,
    ) -> Result<Vec<EvolutionDecision>, EvolutionError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|d| d.status == status)
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryDecisionStore {
    decisions: Mutex<HashMap<Uuid, EvolutionDecision>>,
}

impl MemoryDecisionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DecisionStore for MemoryDecisionStore {
    fn insert(&self, decision: &EvolutionDecision) -> Result<(), EvolutionError> {
        let mut decisions = self.decisions.lock()?;
        if decisions.contains_key(&decision.decision_id) {
            return Err(EvolutionError::Duplicate(decision.decision_id));
        }
        decisions.insert(decision.decision_id, decision.clone());
        Ok(())
    }

    fn get(&self, decision_id: Uuid) -> Result<Option<EvolutionDecision>, EvolutionError> {
        Ok(self.decisions.lock()?.get(&decision_id).cloned())
    }

    fn update_review(
        &self,
        decision_id: Uuid,
        expected: DecisionStatus,
        update: ReviewUpdate,
    ) -> Result<EvolutionDecision, EvolutionError> {
        let mut decisions = self.decisions.lock()?;
        let decision = decisions
            .get_mut(&decision_id)
            .ok_or(EvolutionError::NotFound(decision_id))?;
        update.apply_if(decision, expected)?;
        Ok(decision.clone())
    }

    fn list(&self) -> Result<Vec<EvolutionDecision>, EvolutionError> {
        let mut all: Vec<_> = self.decisions.lock()?.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }
}

/// One pretty-printed JSON file per decision.
pub struct JsonFileDecisionStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileDecisionStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, EvolutionError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| EvolutionError::Io {
            path: root.display().to_string(),
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

    fn decision_file(&self, decision_id: Uuid) -> PathBuf {
        self.root.join(format!("{}.json", decision_id))
    }

    fn read(&self, path: &Path) -> Result<EvolutionDecision, EvolutionError> {
        let json = fs::read_to_string(path).map_err(|source| EvolutionError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    fn write(&self, decision: &EvolutionDecision) -> Result<(), EvolutionError> {
        let path = self.decision_file(decision.decision_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(decision)?;
        fs::write(&tmp, json).map_err(|source| EvolutionError::Io {
            path: tmp.display().to_string(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| EvolutionError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

impl DecisionStore for JsonFileDecisionStore {
    fn insert(&self, decision: &EvolutionDecision) -> Result<(), EvolutionError> {
        let _guard = self.write_lock.lock()?;
        if self.decision_file(decision.decision_id).exists() {
            return Err(EvolutionError::Duplicate(decision.decision_id));
        }
        self.write(decision)
    }

    fn get(&self, decision_id: Uuid) -> Result<Option<EvolutionDecision>, EvolutionError> {
        let path = self.decision_file(decision_id);
        if !path.exists() {
            return Ok(None);
        }
        self.read(&path).map(Some)
    }

    fn update_review(
        &self,
        decision_id: Uuid,
        expected: DecisionStatus,
        update: ReviewUpdate,
    ) -> Result<EvolutionDecision, EvolutionError> {
        let _guard = self.write_lock.lock()?;
        let mut decision = self
            .get(decision_id)?
            .ok_or(EvolutionError::NotFound(decision_id))?;
        update.apply_if(&mut decision, expected)?;
        self.write(&decision)?;
        Ok(decision)
    }

    fn list(&self) -> Result<Vec<EvolutionDecision>, EvolutionError> {
        let entries = fs::read_dir(&self.root).map_err(|source| EvolutionError::Io {
            path: self.root.display().to_string(),
            source,
        })?;

        let mut all = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| EvolutionError::Io {
                path: self.root.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                all.push(self.read(&path)?);
            }
        }
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }
}
