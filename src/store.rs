//! Per-key working set. All engine state is partitioned by
//! (trixel, sensor type): one [`KeyCell`] holds the pending window, the
//! consumed readings awaiting retention purge, the estimator state and the
//! last cycle outcome. The delegated-trixel set is the only coarse shared
//! state; replacing it tears down every key that falls out of coverage in
//! one pass.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::privatizer::EstimatorState;
use crate::types::{RawMeasurement, SensorKey, SensorType, TrixelId};

/// One delegation grant as pulled from the lookup service. An `exclude`
/// grant carves its subtree out of an enclosing grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrixelDelegation {
    pub trixel: TrixelId,
    #[serde(default)]
    pub exclude: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DelegationSet {
    included: HashSet<TrixelId>,
    excluded: HashSet<TrixelId>,
}

impl DelegationSet {
    pub fn from_grants<I>(grants: I) -> DelegationSet
    where
        I: IntoIterator<Item = TrixelDelegation>,
    {
        let mut set = DelegationSet::default();
        for grant in grants {
            if grant.exclude {
                set.excluded.insert(grant.trixel);
            } else {
                set.included.insert(grant.trixel);
            }
        }
        set
    }

    /// Nearest grant on the ancestor chain decides; no grant means no
    /// coverage.
    pub fn covers(&self, trixel: TrixelId) -> bool {
        let mut current = Some(trixel);
        while let Some(t) = current {
            if self.excluded.contains(&t) {
                return false;
            }
            if self.included.contains(&t) {
                return true;
            }
            current = t.parent();
        }
        false
    }

    pub fn roots(&self) -> impl Iterator<Item = TrixelId> + '_ {
        self.included.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }

    pub fn len(&self) -> usize {
        self.included.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalPhase {
    Idle,
    Collecting,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    NoEstimate,
    BelowContributorMinimum,
    BelowQualityThreshold,
    StrategyFault,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum EvalOutcome {
    Published {
        value: f64,
        quality: f64,
        contributors: u32,
    },
    Suppressed {
        reason: SuppressReason,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: EvalOutcome,
}

#[derive(Debug, Default)]
pub struct KeyCell {
    pending: Vec<RawMeasurement>,
    consumed: Vec<RawMeasurement>,
    pub estimator: Option<EstimatorState>,
    pub last_outcome: Option<CycleOutcome>,
}

impl KeyCell {
    pub fn append(&mut self, reading: RawMeasurement) {
        self.pending.push(reading);
    }

    /// Take the pending window; the readings stay around in the consumed
    /// list until the purger ages them out.
    pub fn drain_pending(&mut self) -> Vec<RawMeasurement> {
        let window = std::mem::take(&mut self.pending);
        self.consumed.extend(window.iter().cloned());
        window
    }

    pub fn snapshot_pending(&self) -> Vec<RawMeasurement> {
        self.pending.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn retained_len(&self) -> usize {
        self.pending.len() + self.consumed.len()
    }

    pub fn prune_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.retained_len();
        self.pending.retain(|r| r.timestamp >= cutoff);
        self.consumed.retain(|r| r.timestamp >= cutoff);
        before - self.retained_len()
    }

    pub fn phase(&self) -> EvalPhase {
        if self.pending.is_empty()
            && self.consumed.is_empty()
            && self.estimator.is_none()
            && self.last_outcome.is_none()
        {
            EvalPhase::Idle
        } else {
            EvalPhase::Collecting
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DelegationDiff {
    pub granted: Vec<TrixelId>,
    pub revoked: Vec<TrixelId>,
    pub keys_removed: usize,
}

impl DelegationDiff {
    pub fn is_noop(&self) -> bool {
        self.granted.is_empty() && self.revoked.is_empty() && self.keys_removed == 0
    }
}

#[derive(Default)]
pub struct TrixelStore {
    delegation: RwLock<DelegationSet>,
    cells: DashMap<SensorKey, Arc<Mutex<KeyCell>>>,
}

impl TrixelStore {
    pub fn new() -> TrixelStore {
        TrixelStore::default()
    }

    pub fn is_covered(&self, trixel: TrixelId) -> bool {
        self.delegation.read().covers(trixel)
    }

    pub fn delegation(&self) -> DelegationSet {
        self.delegation.read().clone()
    }

    /// Store one reading. A revocation racing this append can only detach
    /// the cell, which matches revocation semantics (buffered readings for a
    /// revoked trixel are discarded).
    pub fn append(&self, reading: RawMeasurement) -> Result<(), IngestError> {
        if !self.is_covered(reading.trixel) {
            return Err(IngestError::NotDelegated(reading.trixel));
        }
        let key = SensorKey::new(reading.trixel, reading.sensor_type);
        let cell = self.cell(key);
        cell.lock().append(reading);
        Ok(())
    }

    pub fn cell(&self, key: SensorKey) -> Arc<Mutex<KeyCell>> {
        self.cells
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(KeyCell::default())))
            .clone()
    }

    pub fn existing_cell(&self, key: SensorKey) -> Option<Arc<Mutex<KeyCell>>> {
        self.cells.get(&key).map(|entry| entry.clone())
    }

    pub fn keys(&self) -> Vec<SensorKey> {
        self.cells.iter().map(|entry| *entry.key()).collect()
    }

    pub fn key_count(&self) -> usize {
        self.cells.len()
    }

    /// Replace the delegation set and tear down every key no longer covered.
    /// The write lock is held across the teardown so ingestion and sync
    /// never observe a half-applied set; the caller must not invoke this
    /// while holding any cell lock.
    pub fn apply_delegation(&self, new: DelegationSet) -> DelegationDiff {
        let mut guard = self.delegation.write();
        let granted: Vec<TrixelId> = new
            .included
            .difference(&guard.included)
            .copied()
            .collect();
        let revoked: Vec<TrixelId> = guard
            .included
            .difference(&new.included)
            .copied()
            .collect();

        let before = self.cells.len();
        self.cells.retain(|key, _| new.covers(key.trixel));
        let keys_removed = before - self.cells.len();

        *guard = new;
        DelegationDiff {
            granted,
            revoked,
            keys_removed,
        }
    }

    /// Drop readings older than the cutoff across every key, delegated or
    /// not. Returns the number of deleted readings.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        // Never lock a cell while holding a map shard; collect first.
        let cells: Vec<Arc<Mutex<KeyCell>>> =
            self.cells.iter().map(|entry| entry.value().clone()).collect();
        let mut removed = 0;
        for cell in cells {
            removed += cell.lock().prune_older_than(cutoff);
        }
        removed
    }

    pub fn key_statuses(&self) -> Vec<KeyStatus> {
        let snapshot: Vec<(SensorKey, Arc<Mutex<KeyCell>>)> = self
            .cells
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        let mut out = Vec::with_capacity(snapshot.len());
        for (key, cell) in snapshot {
            let cell = cell.lock();
            out.push(KeyStatus {
                trixel: key.trixel,
                sensor_type: key.sensor_type,
                phase: cell.phase(),
                pending: cell.pending_len(),
                retained: cell.retained_len(),
                last_outcome: cell.last_outcome,
            });
        }
        out.sort_by_key(|status| (status.trixel, status.sensor_type));
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct KeyStatus {
    pub trixel: TrixelId,
    pub sensor_type: SensorType,
    pub phase: EvalPhase,
    pub pending: usize,
    pub retained: usize,
    pub last_outcome: Option<CycleOutcome>,
}
