//! KeyTxn: the mutating half of the key store.
//!
//! Wraps a redb write transaction. Reads issued through a `KeyTxn` see the
//! transaction's own uncommitted writes, and because redb serializes
//! writers, a check followed by a write in the same `KeyTxn` cannot race
//! with another writer. Dropping the value without [`KeyTxn::commit`]
//! rolls everything back.

use redb::{ReadableTable, WriteTransaction};
use tracing::debug;

use keyflag_core::{
    epoch_secs, CanaryTarget, KeyRecord, KeyStatus, Permission, RecordId, Role, User, UserId,
};

use crate::error::{StateError, StateResult};
use crate::query;
use crate::tables::*;

/// An open write transaction over the key store.
pub struct KeyTxn {
    txn: WriteTransaction,
}

fn encode<T: serde::Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

impl KeyTxn {
    pub(crate) fn new(txn: WriteTransaction) -> Self {
        Self { txn }
    }

    pub fn commit(self) -> StateResult<()> {
        self.txn.commit().map_err(map_err!(Transaction))
    }

    /// Discard every write made through this transaction.
    pub fn abort(self) -> StateResult<()> {
        self.txn.abort().map_err(map_err!(Transaction))
    }

    fn next_seq(&self, name: &str) -> StateResult<u64> {
        let mut meta = self.txn.open_table(META).map_err(map_err!(Table))?;
        let next = meta
            .get(name)
            .map_err(map_err!(Read))?
            .map_or(1, |guard| guard.value());
        meta.insert(name, next + 1).map_err(map_err!(Write))?;
        Ok(next)
    }

    // ── Records ────────────────────────────────────────────────────

    pub fn record(&self, id: RecordId) -> StateResult<Option<KeyRecord>> {
        let records = self.txn.open_table(RECORDS).map_err(map_err!(Table))?;
        query::load_record(&records, id)
    }

    /// Records for exactly `path`, optionally filtered by state.
    pub fn records_for_key(
        &self,
        path: &str,
        status: Option<KeyStatus>,
    ) -> StateResult<Vec<KeyRecord>> {
        let records = self.txn.open_table(RECORDS).map_err(map_err!(Table))?;
        let index = self.txn.open_table(RECORD_INDEX).map_err(map_err!(Table))?;
        query::records_for_key(&records, &index, path, status)
    }

    /// Persist a new record. The id on the argument is ignored and a fresh
    /// one is assigned; the stored record is returned.
    pub fn insert_record(&self, mut record: KeyRecord) -> StateResult<KeyRecord> {
        record.id = self.next_seq(SEQ_RECORD)?;
        let value = encode(&record)?;
        let index_entry = index_key(&record.key, record.id);
        {
            let mut records = self.txn.open_table(RECORDS).map_err(map_err!(Table))?;
            records
                .insert(record.id, value.as_slice())
                .map_err(map_err!(Write))?;
            let mut index = self.txn.open_table(RECORD_INDEX).map_err(map_err!(Table))?;
            index
                .insert(index_entry.as_str(), record.id)
                .map_err(map_err!(Write))?;
        }
        debug!(key = %record.key, record_id = record.id, status = %record.status, "record inserted");
        Ok(record)
    }

    /// Overwrite the mutable fields of an existing record.
    pub fn update_record(&self, record: &KeyRecord) -> StateResult<()> {
        let mut records = self.txn.open_table(RECORDS).map_err(map_err!(Table))?;
        let stored = query::require_record(&records, record.id)?;
        if stored.key != record.key {
            return Err(StateError::Write(format!(
                "record {} belongs to {}, not {}",
                record.id, stored.key, record.key
            )));
        }
        let value = encode(record)?;
        records
            .insert(record.id, value.as_slice())
            .map_err(map_err!(Write))?;
        debug!(key = %record.key, record_id = record.id, status = %record.status, "record updated");
        Ok(())
    }

    /// Flip every `Active` record of `path` to `ExpiredActive`.
    ///
    /// Drops the canonical pointer if it referenced one of them. Returns the
    /// ids that were expired.
    pub fn expire_active(&self, path: &str) -> StateResult<Vec<RecordId>> {
        let now = epoch_secs();
        let mut expired = Vec::new();
        {
            let mut records = self.txn.open_table(RECORDS).map_err(map_err!(Table))?;
            let index = self.txn.open_table(RECORD_INDEX).map_err(map_err!(Table))?;
            let active =
                query::records_for_key(&records, &index, path, Some(KeyStatus::Active))?;
            for mut record in active {
                record.status = KeyStatus::ExpiredActive;
                record.updated_at = now;
                let value = encode(&record)?;
                records
                    .insert(record.id, value.as_slice())
                    .map_err(map_err!(Write))?;
                expired.push(record.id);
            }
        }
        if !expired.is_empty() {
            let mut pointers = self.txn.open_table(ACTIVE).map_err(map_err!(Table))?;
            let current = pointers
                .get(path)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value());
            if current.is_some_and(|id| expired.contains(&id)) {
                pointers.remove(path).map_err(map_err!(Write))?;
            }
            debug!(key = %path, count = expired.len(), "active records expired");
        }
        Ok(expired)
    }

    // ── Proposal slot ──────────────────────────────────────────────

    /// Take `path`'s proposal slot for `id`.
    ///
    /// Fails with [`StateError::ProposalConflict`] if another record holds it.
    pub fn claim_proposal(&self, path: &str, id: RecordId) -> StateResult<()> {
        let mut proposals = self.txn.open_table(PROPOSALS).map_err(map_err!(Table))?;
        let holder = proposals
            .get(path)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value());
        match holder {
            Some(holder) if holder != id => Err(StateError::ProposalConflict {
                key: path.to_string(),
                holder,
            }),
            Some(_) => Ok(()),
            None => {
                proposals.insert(path, id).map_err(map_err!(Write))?;
                Ok(())
            }
        }
    }

    /// Free `path`'s proposal slot if `id` holds it. Returns whether it did.
    pub fn release_proposal(&self, path: &str, id: RecordId) -> StateResult<bool> {
        let mut proposals = self.txn.open_table(PROPOSALS).map_err(map_err!(Table))?;
        let holder = proposals
            .get(path)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value());
        if holder == Some(id) {
            proposals.remove(path).map_err(map_err!(Write))?;
            return Ok(true);
        }
        Ok(false)
    }

    // ── Canonical pointer ──────────────────────────────────────────

    /// Point `path` at the serving record `id`.
    pub fn set_canonical(&self, path: &str, id: RecordId) -> StateResult<()> {
        let mut pointers = self.txn.open_table(ACTIVE).map_err(map_err!(Table))?;
        pointers.insert(path, id).map_err(map_err!(Write))?;
        Ok(())
    }

    /// Drop `path`'s pointer if it references `id`. Returns whether it did.
    pub fn clear_canonical(&self, path: &str, id: RecordId) -> StateResult<bool> {
        let mut pointers = self.txn.open_table(ACTIVE).map_err(map_err!(Table))?;
        let current = pointers
            .get(path)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value());
        if current == Some(id) {
            pointers.remove(path).map_err(map_err!(Write))?;
            return Ok(true);
        }
        Ok(false)
    }

    // ── Canary targets ─────────────────────────────────────────────

    /// Enable `host` for `record_id`. Returns false if it was already enabled.
    pub fn insert_canary_target(&self, record_id: RecordId, host: &str) -> StateResult<bool> {
        let key = target_key(record_id, host);
        let now = epoch_secs();
        let mut targets = self.txn.open_table(CANARY_TARGETS).map_err(map_err!(Table))?;
        let existing: Option<CanaryTarget> = match targets.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Some(query::decode(guard.value())?),
            None => None,
        };
        let target = match existing {
            Some(target) if target.enabled => return Ok(false),
            Some(target) => CanaryTarget {
                enabled: true,
                updated_at: now,
                ..target
            },
            None => CanaryTarget {
                record_id,
                host: host.to_string(),
                enabled: true,
                created_at: now,
                updated_at: now,
            },
        };
        let value = encode(&target)?;
        targets
            .insert(key.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        let mut hosts = self.txn.open_table(CANARY_HOSTS).map_err(map_err!(Table))?;
        hosts
            .insert(host_key(host, record_id).as_str(), record_id)
            .map_err(map_err!(Write))?;
        debug!(record_id, %host, "canary target enabled");
        Ok(true)
    }

    /// Soft-disable every enabled target of `record_id`. Returns the count.
    pub fn disable_canary_targets(&self, record_id: RecordId) -> StateResult<u32> {
        let now = epoch_secs();
        let mut targets = self.txn.open_table(CANARY_TARGETS).map_err(map_err!(Table))?;
        let rows = query::canary_targets(&targets, record_id)?;
        let mut count = 0;
        for mut target in rows.into_iter().filter(|t| t.enabled) {
            target.enabled = false;
            target.updated_at = now;
            let value = encode(&target)?;
            targets
                .insert(target_key(record_id, &target.host).as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            count += 1;
        }
        debug!(record_id, count, "canary targets disabled");
        Ok(count)
    }

    // ── Accounts ───────────────────────────────────────────────────

    pub fn user_by_name(&self, username: &str) -> StateResult<Option<User>> {
        let names = self.txn.open_table(USERNAMES).map_err(map_err!(Table))?;
        let id = names
            .get(username)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value());
        let Some(id) = id else {
            return Ok(None);
        };
        let users = self.txn.open_table(USERS).map_err(map_err!(Table))?;
        match users.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(query::decode(guard.value())?)),
            None => Err(StateError::NotFound(format!("user {id}"))),
        }
    }

    /// Create an account, or return the existing one with that username.
    pub fn create_user(&self, username: &str, email: &str) -> StateResult<User> {
        if let Some(existing) = self.user_by_name(username)? {
            return Ok(existing);
        }
        let user = User {
            id: self.next_seq(SEQ_USER)?,
            username: username.to_string(),
            email: email.to_string(),
        };
        let value = encode(&user)?;
        let mut users = self.txn.open_table(USERS).map_err(map_err!(Table))?;
        users
            .insert(user.id, value.as_slice())
            .map_err(map_err!(Write))?;
        let mut names = self.txn.open_table(USERNAMES).map_err(map_err!(Table))?;
        names
            .insert(username, user.id)
            .map_err(map_err!(Write))?;
        debug!(user_id = user.id, %username, "user created");
        Ok(user)
    }

    /// Create a role grant over `prefix`.
    pub fn create_role(
        &self,
        prefix: &str,
        permission: Permission,
        created_by: UserId,
    ) -> StateResult<Role> {
        let role = Role {
            id: self.next_seq(SEQ_ROLE)?,
            prefix: prefix.to_string(),
            permission,
            created_by,
        };
        let value = encode(&role)?;
        let mut roles = self.txn.open_table(ROLES).map_err(map_err!(Table))?;
        roles
            .insert(role.id, value.as_slice())
            .map_err(map_err!(Write))?;
        debug!(role_id = role.id, %prefix, permission = permission.as_str(), "role created");
        Ok(role)
    }

    /// Grant `role_ids` to `user_id`.
    pub fn map_user_roles(&self, user_id: UserId, role_ids: &[u64]) -> StateResult<()> {
        let mut mapping = self.txn.open_table(USER_ROLES).map_err(map_err!(Table))?;
        for role_id in role_ids {
            mapping
                .insert(user_role_key(user_id, *role_id).as_str(), *role_id)
                .map_err(map_err!(Write))?;
        }
        Ok(())
    }
}
