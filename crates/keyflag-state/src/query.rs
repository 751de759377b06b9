//! Table lookups shared by read transactions and [`KeyTxn`](crate::KeyTxn).
//!
//! Everything here is generic over `ReadableTable`, so the same scan runs
//! against a snapshot or inside a write transaction.

use redb::ReadableTable;
use serde::de::DeserializeOwned;

use keyflag_core::{CanaryTarget, KeyRecord, KeyStatus, RecordId};

use crate::error::{StateError, StateResult};
use crate::tables::{path_scan, target_scan};

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

pub(crate) fn load_record(
    records: &impl ReadableTable<u64, &'static [u8]>,
    id: RecordId,
) -> StateResult<Option<KeyRecord>> {
    match records.get(id).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Like [`load_record`], but a dangling id is a storage fault.
pub(crate) fn require_record(
    records: &impl ReadableTable<u64, &'static [u8]>,
    id: RecordId,
) -> StateResult<KeyRecord> {
    load_record(records, id)?.ok_or_else(|| StateError::NotFound(format!("record {id}")))
}

/// Values of every `&str → u64` entry whose key starts with `prefix`.
pub(crate) fn scan_ids(
    index: &impl ReadableTable<&'static str, u64>,
    prefix: &str,
) -> StateResult<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in index.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        ids.push(value.value());
    }
    Ok(ids)
}

/// `(key, value)` pairs of every `&str → u64` entry under `prefix`.
pub(crate) fn scan_entries(
    index: &impl ReadableTable<&'static str, u64>,
    prefix: &str,
) -> StateResult<Vec<(String, u64)>> {
    let mut entries = Vec::new();
    for entry in index.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        entries.push((key.value().to_string(), value.value()));
    }
    Ok(entries)
}

/// Records stored under exactly `path`, oldest first.
pub(crate) fn records_for_key(
    records: &impl ReadableTable<u64, &'static [u8]>,
    index: &impl ReadableTable<&'static str, u64>,
    path: &str,
    status: Option<KeyStatus>,
) -> StateResult<Vec<KeyRecord>> {
    collect_records(records, scan_ids(index, &path_scan(path))?, status)
}

/// Records whose key path starts with `prefix`, ordered by path then id.
pub(crate) fn records_by_prefix(
    records: &impl ReadableTable<u64, &'static [u8]>,
    index: &impl ReadableTable<&'static str, u64>,
    prefix: &str,
    status: Option<KeyStatus>,
) -> StateResult<Vec<KeyRecord>> {
    collect_records(records, scan_ids(index, prefix)?, status)
}

fn collect_records(
    records: &impl ReadableTable<u64, &'static [u8]>,
    ids: Vec<u64>,
    status: Option<KeyStatus>,
) -> StateResult<Vec<KeyRecord>> {
    let mut results = Vec::with_capacity(ids.len());
    for id in ids {
        let record = require_record(records, id)?;
        if status.is_none_or(|s| s == record.status) {
            results.push(record);
        }
    }
    Ok(results)
}

/// Canonical serving record for `path`, if any.
pub(crate) fn canonical(
    records: &impl ReadableTable<u64, &'static [u8]>,
    active: &impl ReadableTable<&'static str, u64>,
    path: &str,
) -> StateResult<Option<KeyRecord>> {
    match active.get(path).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(require_record(records, guard.value())?)),
        None => Ok(None),
    }
}

/// Every canary target row (enabled or not) bound to `record_id`.
pub(crate) fn canary_targets(
    targets: &impl ReadableTable<&'static str, &'static [u8]>,
    record_id: RecordId,
) -> StateResult<Vec<CanaryTarget>> {
    let prefix = target_scan(record_id);
    let mut results = Vec::new();
    for entry in targets.range(prefix.as_str()..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(&prefix) {
            break;
        }
        results.push(decode(value.value())?);
    }
    Ok(results)
}
