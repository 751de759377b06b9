//! Key lifecycle engine: drives the approval state machine.
//!
//! Every mutation runs inside one [`KeyTxn`]: the exclusivity checks, the
//! status flips and the inserts commit together or not at all. The value
//! cache is touched only after a successful commit and only on a
//! best-effort basis; a failed cache write is reported in the outcome and
//! logged, never surfaced as a failed approval.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use keyflag_core::path::validate_prefix;
use keyflag_core::{epoch_secs, Decision, KeyPath, KeyRecord, KeyStatus, RecordId, UserId};
use keyflag_state::{
    DeploymentRegistry, KeyTxn, MemoryCache, StateStore, StoreRegistry, ValueCache,
};

use crate::error::{EngineError, EngineResult};

/// Result of an approval decision.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalOutcome {
    pub decision: Decision,
    /// The new serving record on accept, the rejected proposal on reject.
    pub record: KeyRecord,
    /// Whether the cache reflects the committed change. A rejection never
    /// touches the cache and reports `true`.
    pub cache_synced: bool,
}

/// Result of an administrative retire.
#[derive(Debug, Clone, Serialize)]
pub struct RetireOutcome {
    pub record: KeyRecord,
    pub cache_synced: bool,
}

/// The lifecycle engine. Cheap to clone and safe to share across request
/// threads; it holds no per-key state of its own.
#[derive(Clone)]
pub struct KeyLifecycle {
    pub(crate) store: StateStore,
    pub(crate) cache: Arc<dyn ValueCache>,
    pub(crate) registry: Arc<dyn DeploymentRegistry>,
}

impl KeyLifecycle {
    pub fn new(
        store: StateStore,
        cache: Arc<dyn ValueCache>,
        registry: Arc<dyn DeploymentRegistry>,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
        }
    }

    /// Engine with an in-process cache and the store-backed registry.
    pub fn with_defaults(store: StateStore) -> Self {
        let registry = StoreRegistry::new(store.clone());
        Self::new(store, Arc::new(MemoryCache::new()), Arc::new(registry))
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Proposals ──────────────────────────────────────────────────

    /// Propose a new value for `key`. The record starts as `PendingUpdate`.
    pub fn propose_update(
        &self,
        key: &str,
        value: &str,
        value_type: &str,
        user: UserId,
    ) -> EngineResult<KeyRecord> {
        self.propose(key, value, value_type, user, KeyStatus::PendingUpdate)
    }

    /// Propose deleting `key`. The record starts as `PendingDelete`.
    pub fn propose_delete(
        &self,
        key: &str,
        value: &str,
        value_type: &str,
        user: UserId,
    ) -> EngineResult<KeyRecord> {
        self.propose(key, value, value_type, user, KeyStatus::PendingDelete)
    }

    fn propose(
        &self,
        key: &str,
        value: &str,
        value_type: &str,
        user: UserId,
        status: KeyStatus,
    ) -> EngineResult<KeyRecord> {
        let path = KeyPath::parse(key)?;
        let txn = self.store.begin_write()?;

        if let Some(open) = txn
            .records_for_key(path.as_str(), None)?
            .into_iter()
            .find(|r| r.status.is_proposal())
        {
            return Err(blocked_by(&open, status));
        }

        let record = txn.insert_record(KeyRecord::new(
            path.as_str(),
            value,
            value_type,
            user,
            status,
        ))?;
        // Unique per key path; a concurrent writer that got here first
        // surfaces as a conflict.
        txn.claim_proposal(path.as_str(), record.id)?;
        txn.commit()?;

        info!(key = %path, record_id = record.id, status = %status, user, "proposal placed");
        Ok(record)
    }

    // ── Approvals ──────────────────────────────────────────────────

    /// Decide on the pending update of `key`, or on its canary if the
    /// proposal was already promoted to one.
    pub fn approve(
        &self,
        key: &str,
        approver: UserId,
        decision: Decision,
    ) -> EngineResult<ApprovalOutcome> {
        let path = KeyPath::parse(key)?;
        let txn = self.store.begin_write()?;

        let proposal = match single(
            txn.records_for_key(path.as_str(), Some(KeyStatus::PendingUpdate))?,
            &path,
            "ambiguous pending state",
        )? {
            Some(placed) => placed,
            None => single(
                txn.records_for_key(path.as_str(), Some(KeyStatus::Canary))?,
                &path,
                "more than one canary record",
            )?
            .ok_or_else(|| no_pending(&path))?,
        };

        let record = settle(&txn, proposal, approver, decision, KeyStatus::Active)?;
        txn.commit()?;
        Ok(self.finish_approval(decision, record, approver))
    }

    /// Decide on the pending delete of `key`. Accepting writes a tombstone.
    pub fn approve_delete(
        &self,
        key: &str,
        approver: UserId,
        decision: Decision,
    ) -> EngineResult<ApprovalOutcome> {
        let path = KeyPath::parse(key)?;
        let txn = self.store.begin_write()?;

        let proposal = single(
            txn.records_for_key(path.as_str(), Some(KeyStatus::PendingDelete))?,
            &path,
            "ambiguous pending delete state",
        )?
        .ok_or_else(|| no_pending(&path))?;

        let record = settle(&txn, proposal, approver, decision, KeyStatus::Deleted)?;
        txn.commit()?;
        Ok(self.finish_approval(decision, record, approver))
    }

    fn finish_approval(
        &self,
        decision: Decision,
        record: KeyRecord,
        approver: UserId,
    ) -> ApprovalOutcome {
        info!(
            key = %record.key,
            record_id = record.id,
            status = %record.status,
            approver,
            %decision,
            "proposal settled"
        );
        let cache_synced = match decision {
            Decision::Accept => self.publish(&record),
            Decision::Reject => true,
        };
        ApprovalOutcome {
            decision,
            record,
            cache_synced,
        }
    }

    /// Write a committed serving record to the cache.
    pub(crate) fn publish(&self, record: &KeyRecord) -> bool {
        match self.cache.set(record) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    key = %record.key,
                    record_id = record.id,
                    error = %err,
                    "cache write failed after commit, next read falls back to storage"
                );
                false
            }
        }
    }

    /// Cache a record read outside any write transaction, then check it
    /// against the serving pointer. When the key moved on in between, the
    /// current serving record is cached instead, or the entry is dropped if
    /// the key no longer has one.
    fn write_back(&self, record: &KeyRecord) -> bool {
        if !self.publish(record) {
            return false;
        }
        match self.store.canonical_record(&record.key) {
            Ok(Some(current)) if current.id == record.id => true,
            Ok(Some(current)) => {
                debug!(
                    key = %record.key,
                    record_id = record.id,
                    current_id = current.id,
                    "serving record changed during cache write"
                );
                self.publish(&current)
            }
            Ok(None) => match self.cache.invalidate(&record.key) {
                Ok(()) => true,
                Err(err) => {
                    warn!(key = %record.key, error = %err, "cache invalidation failed");
                    false
                }
            },
            Err(err) => {
                warn!(key = %record.key, error = %err, "serving record reload failed");
                false
            }
        }
    }

    fn republish(&self, key: &str) -> bool {
        match self.store.canonical_record(key) {
            Ok(Some(current)) => self.write_back(&current),
            Ok(None) => true,
            Err(err) => {
                warn!(%key, error = %err, "serving record reload failed after retire");
                false
            }
        }
    }

    // ── Retire ─────────────────────────────────────────────────────

    /// Administrative override: expire `record_id` immediately, without a
    /// proposal, and drop its key from the cache. When the retired record
    /// was not the key's serving record, the serving record is cached again.
    pub fn retire_key(&self, record_id: RecordId, user: UserId) -> EngineResult<RetireOutcome> {
        let txn = self.store.begin_write()?;
        let mut record = txn
            .record(record_id)?
            .ok_or_else(|| EngineError::NotFound(format!("record {record_id}")))?;

        if record.status == KeyStatus::Canary {
            txn.disable_canary_targets(record.id)?;
        }
        let released = txn.release_proposal(&record.key, record.id)?;
        let was_serving = txn.clear_canonical(&record.key, record.id)?;

        record.status = KeyStatus::ExpiredActive;
        record.updated_at = epoch_secs();
        txn.update_record(&record)?;
        txn.commit()?;

        info!(
            key = %record.key,
            record_id,
            user,
            released,
            was_serving,
            "record retired"
        );

        let cache_synced = match self.cache.invalidate(&record.key) {
            Ok(()) if was_serving => true,
            // The key still has a serving record; put it back.
            Ok(()) => self.republish(&record.key),
            Err(err) => {
                warn!(key = %record.key, error = %err, "cache invalidation failed after retire");
                false
            }
        };
        Ok(RetireOutcome {
            record,
            cache_synced,
        })
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// The value currently served for `key`.
    ///
    /// Served from the cache when present. On a miss the `Active` record is
    /// read from storage and written back to the cache. A tombstone counts
    /// as not found.
    pub fn get_active_value(&self, key: &str) -> EngineResult<KeyRecord> {
        let path = KeyPath::parse(key)?;

        match self.cache.get(path.as_str()) {
            Ok(Some(record)) if record.is_tombstone() => {
                return Err(EngineError::NotFound(format!("{path}: key is deleted")));
            }
            Ok(Some(record)) => return Ok(record),
            Ok(None) => debug!(key = %path, "cache miss"),
            Err(err) => warn!(key = %path, error = %err, "cache read failed, reading storage"),
        }

        let record = single(
            self.store
                .records_for_key(path.as_str(), Some(KeyStatus::Active))?,
            &path,
            "more than one active key",
        )?
        .ok_or_else(|| EngineError::NotFound(format!("{path}: no key found")))?;

        self.write_back(&record);
        Ok(record)
    }

    /// Every served value under `prefix`. With a non-empty `host`, values in
    /// canary for that host replace the general value of their key.
    ///
    /// The serving pointers in storage decide which keys are listed. A cached
    /// record is used only when it matches its key's pointer; any other key
    /// is read from storage and written back.
    pub fn get_active_values(&self, prefix: &str, host: &str) -> EngineResult<Vec<KeyRecord>> {
        validate_prefix(prefix)?;

        let mut cached: HashMap<String, KeyRecord> = match self.cache.get_prefix(prefix) {
            Ok(records) => records.into_iter().map(|r| (r.key.clone(), r)).collect(),
            Err(err) => {
                warn!(%prefix, error = %err, "cache prefix read failed, reading storage");
                HashMap::new()
            }
        };

        let mut values = Vec::new();
        for (key, id) in self.store.active_pointers(prefix)? {
            let record = match cached.remove(&key) {
                Some(record) if record.id == id => record,
                _ => {
                    let record = self.store.record(id)?.ok_or_else(|| {
                        EngineError::ConsistencyViolation(format!(
                            "{key}: serving record {id} is missing"
                        ))
                    })?;
                    debug!(%key, record_id = id, "bulk read refilled from storage");
                    self.write_back(&record);
                    record
                }
            };
            if !record.is_tombstone() {
                values.push(record);
            }
        }

        if !host.is_empty() {
            let overrides = self.store.canary_records_for_host(host)?;
            for value in values.iter_mut() {
                if let Some(canary) = overrides.iter().find(|c| c.key == value.key) {
                    debug!(key = %value.key, %host, record_id = canary.id, "canary override");
                    *value = canary.clone();
                }
            }
        }
        Ok(values)
    }

    /// Pending updates under `prefix`; pending deletes only if there are none.
    pub fn list_pending_approvals(&self, prefix: &str) -> EngineResult<Vec<KeyRecord>> {
        validate_prefix(prefix)?;
        let placed = self
            .store
            .records_by_prefix(prefix, Some(KeyStatus::PendingUpdate))?;
        if !placed.is_empty() {
            return Ok(placed);
        }
        Ok(self
            .store
            .records_by_prefix(prefix, Some(KeyStatus::PendingDelete))?)
    }

    /// Pending updates and pending deletes under `prefix`, ordered by key.
    pub fn list_all_pending_approvals(&self, prefix: &str) -> EngineResult<Vec<KeyRecord>> {
        validate_prefix(prefix)?;
        let mut pending = self
            .store
            .records_by_prefix(prefix, Some(KeyStatus::PendingUpdate))?;
        pending.extend(
            self.store
                .records_by_prefix(prefix, Some(KeyStatus::PendingDelete))?,
        );
        pending.sort_by(|a, b| a.key.cmp(&b.key).then(a.id.cmp(&b.id)));
        Ok(pending)
    }

    /// Records of a key (or every key under a prefix), newest first.
    pub fn history(
        &self,
        key: &str,
        is_prefix: bool,
        limit: Option<usize>,
    ) -> EngineResult<Vec<KeyRecord>> {
        validate_prefix(key)?;
        Ok(self.store.history(key, is_prefix, limit)?)
    }

    /// Key paths under `prefix`, without values.
    pub fn browse_keys(&self, prefix: &str) -> EngineResult<Vec<String>> {
        validate_prefix(prefix)?;
        Ok(self.store.key_paths(prefix)?)
    }

    pub fn record(&self, record_id: RecordId) -> EngineResult<KeyRecord> {
        self.store
            .record(record_id)?
            .ok_or_else(|| EngineError::NotFound(format!("record {record_id}")))
    }

    /// Load every canonical serving record into the cache.
    pub fn warm_cache(&self) -> EngineResult<usize> {
        let records = self.store.active_records("")?;
        for record in &records {
            self.cache.set(record)?;
        }
        info!(count = records.len(), "cache warmed");
        Ok(records.len())
    }
}

/// Apply `decision` to an open proposal inside `txn`.
///
/// Returns the rejected proposal, or the new serving record in state
/// `serving` (`Active` for updates, `Deleted` for deletes). Does not commit.
pub(crate) fn settle(
    txn: &KeyTxn,
    mut proposal: KeyRecord,
    approver: UserId,
    decision: Decision,
    serving: KeyStatus,
) -> EngineResult<KeyRecord> {
    if proposal.status == KeyStatus::Canary {
        txn.disable_canary_targets(proposal.id)?;
    }
    txn.release_proposal(&proposal.key, proposal.id)?;

    proposal.approved_by = Some(approver);
    proposal.updated_at = epoch_secs();

    if decision == Decision::Reject {
        proposal.status = KeyStatus::Rejected;
        txn.update_record(&proposal)?;
        return Ok(proposal);
    }

    proposal.status = KeyStatus::Approved;
    txn.update_record(&proposal)?;

    txn.expire_active(&proposal.key)?;
    let record = txn.insert_record(proposal.promoted(serving, approver))?;
    txn.set_canonical(&record.key, record.id)?;
    Ok(record)
}

/// At most one row expected; more is a consistency violation.
fn single(
    mut rows: Vec<KeyRecord>,
    path: &KeyPath,
    what: &str,
) -> EngineResult<Option<KeyRecord>> {
    match rows.len() {
        0 => Ok(None),
        1 => Ok(rows.pop()),
        n => Err(EngineError::ConsistencyViolation(format!(
            "{path}: {what} ({n} rows)"
        ))),
    }
}

fn no_pending(path: &KeyPath) -> EngineError {
    EngineError::NotFound(format!("{path}: no key pending approval"))
}

fn blocked_by(open: &KeyRecord, wanted: KeyStatus) -> EngineError {
    let reason = match (open.status, wanted) {
        (KeyStatus::Canary, KeyStatus::PendingDelete) => "value is under canary, cannot delete",
        (KeyStatus::Canary, _) => "value is under canary, cannot change",
        _ => "pending approval exists",
    };
    EngineError::Conflict(format!("{}: {reason} (record {})", open.key, open.id))
}
