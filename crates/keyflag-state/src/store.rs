//! StateStore: redb-backed key store for keyflag.
//!
//! Snapshot reads over key records, canary targets, registry host sets
//! and accounts. Mutations go through [`KeyTxn`], obtained from
//! [`StateStore::begin_write`]. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable};
use tracing::debug;

use keyflag_core::{CanaryTarget, KeyRecord, KeyStatus, RecordId, Role, User};

use crate::error::{StateError, StateResult};
use crate::query;
use crate::tables::*;
use crate::txn::KeyTxn;

/// Thread-safe key store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent key store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "key store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory key store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory key store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(RECORDS).map_err(map_err!(Table))?;
        txn.open_table(RECORD_INDEX).map_err(map_err!(Table))?;
        txn.open_table(PROPOSALS).map_err(map_err!(Table))?;
        txn.open_table(ACTIVE).map_err(map_err!(Table))?;
        txn.open_table(CANARY_TARGETS).map_err(map_err!(Table))?;
        txn.open_table(CANARY_HOSTS).map_err(map_err!(Table))?;
        txn.open_table(REGISTRY).map_err(map_err!(Table))?;
        txn.open_table(USERS).map_err(map_err!(Table))?;
        txn.open_table(USERNAMES).map_err(map_err!(Table))?;
        txn.open_table(ROLES).map_err(map_err!(Table))?;
        txn.open_table(USER_ROLES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Begin a write transaction. Blocks while another writer is active.
    pub fn begin_write(&self) -> StateResult<KeyTxn> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        Ok(KeyTxn::new(txn))
    }

    fn begin_read(&self) -> StateResult<ReadTransaction> {
        self.db.begin_read().map_err(map_err!(Transaction))
    }

    // ── Records ────────────────────────────────────────────────────

    /// Get a record by id.
    pub fn record(&self, id: RecordId) -> StateResult<Option<KeyRecord>> {
        let txn = self.begin_read()?;
        let records = txn.open_table(RECORDS).map_err(map_err!(Table))?;
        query::load_record(&records, id)
    }

    /// Records for exactly `path`, oldest first, optionally filtered by state.
    pub fn records_for_key(
        &self,
        path: &str,
        status: Option<KeyStatus>,
    ) -> StateResult<Vec<KeyRecord>> {
        let txn = self.begin_read()?;
        let records = txn.open_table(RECORDS).map_err(map_err!(Table))?;
        let index = txn.open_table(RECORD_INDEX).map_err(map_err!(Table))?;
        query::records_for_key(&records, &index, path, status)
    }

    /// Records whose path starts with `prefix`, optionally filtered by state.
    pub fn records_by_prefix(
        &self,
        prefix: &str,
        status: Option<KeyStatus>,
    ) -> StateResult<Vec<KeyRecord>> {
        let txn = self.begin_read()?;
        let records = txn.open_table(RECORDS).map_err(map_err!(Table))?;
        let index = txn.open_table(RECORD_INDEX).map_err(map_err!(Table))?;
        query::records_by_prefix(&records, &index, prefix, status)
    }

    /// Every record of a key (or of every key under a prefix), newest first.
    pub fn history(
        &self,
        key: &str,
        is_prefix: bool,
        limit: Option<usize>,
    ) -> StateResult<Vec<KeyRecord>> {
        let mut records = if is_prefix {
            self.records_by_prefix(key, None)?
        } else {
            self.records_for_key(key, None)?
        };
        records.sort_by(|a, b| b.id.cmp(&a.id));
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Distinct key paths under `prefix`, without values.
    pub fn key_paths(&self, prefix: &str) -> StateResult<Vec<String>> {
        let txn = self.begin_read()?;
        let index = txn.open_table(RECORD_INDEX).map_err(map_err!(Table))?;
        let mut paths: Vec<String> = query::scan_entries(&index, prefix)?
            .into_iter()
            .map(|(key, _)| path_of_index_key(&key).to_string())
            .collect();
        paths.dedup();
        Ok(paths)
    }

    /// Whether any record exists for exactly `path`.
    pub fn key_exists(&self, path: &str) -> StateResult<bool> {
        let txn = self.begin_read()?;
        let index = txn.open_table(RECORD_INDEX).map_err(map_err!(Table))?;
        let prefix = path_scan(path);
        let mut range = index.range(prefix.as_str()..).map_err(map_err!(Read))?;
        match range.next() {
            Some(entry) => {
                let (key, _) = entry.map_err(map_err!(Read))?;
                Ok(key.value().starts_with(&prefix))
            }
            None => Ok(false),
        }
    }

    // ── Serving state ──────────────────────────────────────────────

    /// The canonical serving record (active or tombstone) for `path`.
    pub fn canonical_record(&self, path: &str) -> StateResult<Option<KeyRecord>> {
        let txn = self.begin_read()?;
        let records = txn.open_table(RECORDS).map_err(map_err!(Table))?;
        let pointers = txn.open_table(ACTIVE).map_err(map_err!(Table))?;
        query::canonical(&records, &pointers, path)
    }

    /// Canonical serving records for every path under `prefix`.
    pub fn active_records(&self, prefix: &str) -> StateResult<Vec<KeyRecord>> {
        let txn = self.begin_read()?;
        let records = txn.open_table(RECORDS).map_err(map_err!(Table))?;
        let pointers = txn.open_table(ACTIVE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for id in query::scan_ids(&pointers, prefix)? {
            results.push(query::require_record(&records, id)?);
        }
        Ok(results)
    }

    /// `(path, record id)` of every serving pointer under `prefix`.
    pub fn active_pointers(&self, prefix: &str) -> StateResult<Vec<(String, RecordId)>> {
        let txn = self.begin_read()?;
        let pointers = txn.open_table(ACTIVE).map_err(map_err!(Table))?;
        query::scan_entries(&pointers, prefix)
    }

    /// Id of the open proposal holding `path`'s slot.
    pub fn open_proposal(&self, path: &str) -> StateResult<Option<RecordId>> {
        let txn = self.begin_read()?;
        let proposals = txn.open_table(PROPOSALS).map_err(map_err!(Table))?;
        Ok(proposals
            .get(path)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value()))
    }

    // ── Canary targets ─────────────────────────────────────────────

    /// Every target row (enabled or not) bound to `record_id`.
    pub fn canary_targets(&self, record_id: RecordId) -> StateResult<Vec<CanaryTarget>> {
        let txn = self.begin_read()?;
        let targets = txn.open_table(CANARY_TARGETS).map_err(map_err!(Table))?;
        query::canary_targets(&targets, record_id)
    }

    /// Records currently in canary with an enabled target for `host`.
    pub fn canary_records_for_host(&self, host: &str) -> StateResult<Vec<KeyRecord>> {
        let txn = self.begin_read()?;
        let records = txn.open_table(RECORDS).map_err(map_err!(Table))?;
        let targets = txn.open_table(CANARY_TARGETS).map_err(map_err!(Table))?;
        let hosts = txn.open_table(CANARY_HOSTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for record_id in query::scan_ids(&hosts, &host_scan(host))? {
            let enabled = match targets
                .get(target_key(record_id, host).as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => query::decode::<CanaryTarget>(guard.value())?.enabled,
                None => false,
            };
            if !enabled {
                continue;
            }
            let record = query::require_record(&records, record_id)?;
            if record.status == KeyStatus::Canary {
                results.push(record);
            }
        }
        Ok(results)
    }

    // ── Registry ───────────────────────────────────────────────────

    /// Replace the recommended canary hosts of a service.
    pub fn put_registry_hosts(&self, service: &str, hosts: &[String]) -> StateResult<()> {
        let value = serde_json::to_vec(hosts).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REGISTRY).map_err(map_err!(Table))?;
            table
                .insert(service, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%service, count = hosts.len(), "registry hosts stored");
        Ok(())
    }

    pub fn registry_hosts(&self, service: &str) -> StateResult<Option<Vec<String>>> {
        let txn = self.begin_read()?;
        let table = txn.open_table(REGISTRY).map_err(map_err!(Table))?;
        match table.get(service).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(query::decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Delete a service's host set. Returns true if it existed.
    pub fn delete_registry_hosts(&self, service: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(REGISTRY).map_err(map_err!(Table))?;
            existed = table.remove(service).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%service, existed, "registry hosts deleted");
        Ok(existed)
    }

    // ── Accounts ───────────────────────────────────────────────────

    /// Create an account in its own transaction (idempotent by username).
    pub fn create_user(&self, username: &str, email: &str) -> StateResult<User> {
        let txn = self.begin_write()?;
        let user = txn.create_user(username, email)?;
        txn.commit()?;
        Ok(user)
    }

    pub fn user_by_name(&self, username: &str) -> StateResult<Option<User>> {
        let txn = self.begin_read()?;
        let names = txn.open_table(USERNAMES).map_err(map_err!(Table))?;
        let id = names
            .get(username)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value());
        let Some(id) = id else {
            return Ok(None);
        };
        let users = txn.open_table(USERS).map_err(map_err!(Table))?;
        match users.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(query::decode(guard.value())?)),
            None => Err(StateError::NotFound(format!("user {id}"))),
        }
    }

    /// Role grants mapped to a user.
    pub fn roles_for_user(&self, user_id: u64) -> StateResult<Vec<Role>> {
        let txn = self.begin_read()?;
        let mapping = txn.open_table(USER_ROLES).map_err(map_err!(Table))?;
        let roles = txn.open_table(ROLES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for role_id in query::scan_ids(&mapping, &format!("{user_id:020}\0"))? {
            match roles.get(role_id).map_err(map_err!(Read))? {
                Some(guard) => results.push(query::decode(guard.value())?),
                None => return Err(StateError::NotFound(format!("role {role_id}"))),
            }
        }
        Ok(results)
    }
}
