//! In-memory entry index shared by the storage backends.
//!
//! Commits happen in two steps: [`EntryIndex::prepare`] resolves a batch
//! into a [`CommitRecord`] without mutating anything, and
//! [`EntryIndex::apply`] installs a record. The persistent backend logs the
//! record between the two, so replay installs exactly what was committed.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::entry::{Entry, EntryId, PartitionKey, Sequence};
use crate::storage::traits::{
    CommitOutcome, Committed, KeyFilter, StateWrite, StorageError, StoredState, WriteBatch,
};

/// One resolved append: the entry as stored plus its index updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ResolvedAppend {
    pub entry: Entry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_key: Option<PartitionKey>,
}

/// A resolved state write. `state == None` clears.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ResolvedState {
    pub trigger: String,
    pub key: PartitionKey,
    pub state: Option<StoredState>,
}

/// Everything one commit changes, fully resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct CommitRecord {
    pub appends: Vec<ResolvedAppend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ResolvedState>,
}

impl CommitRecord {
    pub fn is_empty(&self) -> bool {
        self.appends.is_empty() && self.state.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RelationLog {
    /// `entries[i].sequence == i + 1`.
    entries: Vec<Entry>,
    dedup: HashMap<String, Sequence>,
    latest: HashMap<PartitionKey, Sequence>,
}

impl RelationLog {
    fn last_sequence(&self) -> Sequence {
        self.entries.len() as Sequence
    }

    fn at(&self, sequence: Sequence) -> Option<&Entry> {
        let idx = usize::try_from(sequence).ok()?.checked_sub(1)?;
        self.entries.get(idx)
    }
}

/// Relations, entries and trigger state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct EntryIndex {
    relations: HashMap<String, RelationLog>,
    states: HashMap<String, HashMap<PartitionKey, StoredState>>,
    #[serde(skip)]
    by_id: HashMap<EntryId, (String, Sequence)>,
}

impl EntryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds derived lookups after deserialization.
    pub fn rebuild_ids(&mut self) {
        self.by_id.clear();
        for (name, log) in &self.relations {
            for entry in &log.entries {
                self.by_id.insert(entry.id, (name.clone(), entry.sequence));
            }
        }
    }

    pub fn entry_count(&self) -> usize {
        self.by_id.len()
    }

    fn dedup_hit(&self, relation: &str, key: &str) -> Option<&Entry> {
        let log = self.relations.get(relation)?;
        let seq = *log.dedup.get(key)?;
        log.at(seq)
    }

    /// Resolves a batch against the current contents without mutating them.
    pub fn prepare(&self, batch: WriteBatch) -> Result<(CommitRecord, CommitOutcome), StorageError> {
        let now = Utc::now();
        let mut record = CommitRecord::default();
        let mut outcome = CommitOutcome::default();
        let mut next: HashMap<String, Sequence> = HashMap::new();
        let mut batch_dedup: HashMap<(String, String), usize> = HashMap::new();

        for req in batch.appends {
            if let Some(key) = req.dedup_key.as_deref() {
                if let Some(existing) = self.dedup_hit(&req.relation, key) {
                    outcome.appended.push(Committed {
                        entry: existing.clone(),
                        deduplicated: true,
                    });
                    continue;
                }
                if let Some(&pos) = batch_dedup.get(&(req.relation.clone(), key.to_string())) {
                    outcome.appended.push(Committed {
                        entry: record.appends[pos].entry.clone(),
                        deduplicated: true,
                    });
                    continue;
                }
            }

            let seq = next
                .entry(req.relation.clone())
                .or_insert_with(|| self.last_sequence(&req.relation));
            *seq = seq
                .checked_add(1)
                .ok_or_else(|| StorageError::BackendError("sequence overflow".to_string()))?;

            let id = match req.id {
                Some(id) if self.by_id.contains_key(&id) => {
                    return Err(StorageError::BackendError(format!("entry id {id} already exists")));
                }
                Some(id) => id,
                None => EntryId::new(),
            };
            let (caused_by, root) = match req.provenance {
                Some(p) => (Some(p.caused_by), p.root),
                None => (None, id),
            };
            let entry = Entry {
                id,
                relation: req.relation.clone(),
                sequence: *seq,
                fields: req.fields,
                caused_by,
                root,
                written_at: now,
            };

            if let Some(key) = req.dedup_key.clone() {
                batch_dedup.insert((req.relation, key), record.appends.len());
            }
            outcome.appended.push(Committed {
                entry: entry.clone(),
                deduplicated: false,
            });
            record.appends.push(ResolvedAppend {
                entry,
                dedup_key: req.dedup_key,
                latest_key: req.latest_key,
            });
        }

        if let Some(write) = batch.state {
            let resolved = self.resolve_state(write)?;
            outcome.state_version = resolved.state.as_ref().map(|s| s.version);
            record.state = Some(resolved);
        }

        Ok((record, outcome))
    }

    fn resolve_state(&self, write: StateWrite) -> Result<ResolvedState, StorageError> {
        let current = self.get_state(&write.trigger, &write.key).map(|s| s.version);
        if !write.guard.admits(current) {
            return Err(StorageError::StateVersionConflict {
                trigger: write.trigger,
                key: write.key,
                expected: write.guard,
                actual: current,
            });
        }
        let state = match write.value {
            Some(value) => {
                let version = current
                    .unwrap_or(0)
                    .checked_add(1)
                    .ok_or_else(|| StorageError::BackendError("state version overflow".to_string()))?;
                Some(StoredState { version, value })
            }
            None => None,
        };
        Ok(ResolvedState {
            trigger: write.trigger,
            key: write.key,
            state,
        })
    }

    /// Installs a prepared record.
    ///
    /// Fails without partial effects if an append does not continue its
    /// relation's sequence space.
    pub fn apply(&mut self, record: CommitRecord) -> Result<(), StorageError> {
        let mut expected: HashMap<&str, Sequence> = HashMap::new();
        for append in &record.appends {
            let next = expected
                .entry(append.entry.relation.as_str())
                .or_insert_with(|| self.last_sequence(&append.entry.relation));
            *next += 1;
            if append.entry.sequence != *next {
                return Err(StorageError::BackendError(format!(
                    "sequence gap in '{}': expected {} got {}",
                    append.entry.relation, next, append.entry.sequence
                )));
            }
        }

        for append in record.appends {
            let relation = append.entry.relation.clone();
            let seq = append.entry.sequence;
            let log = self.relations.entry(relation.clone()).or_default();
            if let Some(key) = append.dedup_key {
                log.dedup.insert(key, seq);
            }
            if let Some(key) = append.latest_key {
                log.latest.insert(key, seq);
            }
            self.by_id.insert(append.entry.id, (relation, seq));
            log.entries.push(append.entry);
        }

        if let Some(resolved) = record.state {
            match resolved.state {
                Some(state) => {
                    self.states
                        .entry(resolved.trigger)
                        .or_default()
                        .insert(resolved.key, state);
                }
                None => {
                    if let Some(by_key) = self.states.get_mut(&resolved.trigger) {
                        by_key.remove(&resolved.key);
                        if by_key.is_empty() {
                            self.states.remove(&resolved.trigger);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Prepare and apply in one step.
    pub fn commit(&mut self, batch: WriteBatch) -> Result<CommitOutcome, StorageError> {
        let (record, outcome) = self.prepare(batch)?;
        self.apply(record)?;
        Ok(outcome)
    }

    pub fn read_after(
        &self,
        relation: &str,
        after: Sequence,
        filter: Option<&KeyFilter>,
        limit: usize,
    ) -> Vec<Entry> {
        let Some(log) = self.relations.get(relation) else {
            return Vec::new();
        };
        let start = usize::try_from(after).unwrap_or(usize::MAX).min(log.entries.len());
        log.entries[start..]
            .iter()
            .filter(|e| match filter {
                Some(f) => e.partition_key(&f.field).as_ref() == Some(&f.key),
                None => true,
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: EntryId) -> Option<Entry> {
        let (relation, seq) = self.by_id.get(&id)?;
        self.relations.get(relation)?.at(*seq).cloned()
    }

    pub fn latest(&self, relation: &str, key: &PartitionKey) -> Option<Entry> {
        let log = self.relations.get(relation)?;
        log.at(*log.latest.get(key)?).cloned()
    }

    pub fn last_sequence(&self, relation: &str) -> Sequence {
        self.relations
            .get(relation)
            .map_or(0, RelationLog::last_sequence)
    }

    pub fn get_state(&self, trigger: &str, key: &PartitionKey) -> Option<&StoredState> {
        self.states.get(trigger)?.get(key)
    }
}
