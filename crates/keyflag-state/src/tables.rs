//! redb table definitions for the keyflag key store.
//!
//! Record-like tables use `u64` ids and `&[u8]` values (JSON-serialized
//! domain types). Index tables map a composite `&str` key to an id;
//! components are joined with `\0`, which never appears in a valid key
//! path or host, and ids are zero-padded so lexical order is numeric order.

use redb::TableDefinition;

/// Key records keyed by record id.
pub const RECORDS: TableDefinition<u64, &[u8]> = TableDefinition::new("records");

/// `{key_path}\0{record_id}` → record id, for exact-path and prefix scans.
pub const RECORD_INDEX: TableDefinition<&str, u64> = TableDefinition::new("record_index");

/// `{key_path}` → id of the single open proposal (placed, canary or placed delete).
pub const PROPOSALS: TableDefinition<&str, u64> = TableDefinition::new("proposals");

/// `{key_path}` → id of the canonical serving record (active or tombstone).
pub const ACTIVE: TableDefinition<&str, u64> = TableDefinition::new("active");

/// `{record_id}\0{host}` → canary target.
pub const CANARY_TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("canary_targets");

/// `{host}\0{record_id}` → record id.
pub const CANARY_HOSTS: TableDefinition<&str, u64> = TableDefinition::new("canary_hosts");

/// Recommended canary hosts keyed by service name.
pub const REGISTRY: TableDefinition<&str, &[u8]> = TableDefinition::new("registry");

/// Accounts keyed by user id.
pub const USERS: TableDefinition<u64, &[u8]> = TableDefinition::new("users");

/// `{username}` → user id.
pub const USERNAMES: TableDefinition<&str, u64> = TableDefinition::new("usernames");

/// Role grants keyed by role id.
pub const ROLES: TableDefinition<u64, &[u8]> = TableDefinition::new("roles");

/// `{user_id}\0{role_id}` → role id.
pub const USER_ROLES: TableDefinition<&str, u64> = TableDefinition::new("user_roles");

/// Id sequences.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub(crate) const SEQ_RECORD: &str = "next_record_id";
pub(crate) const SEQ_USER: &str = "next_user_id";
pub(crate) const SEQ_ROLE: &str = "next_role_id";

pub(crate) fn index_key(path: &str, id: u64) -> String {
    format!("{path}\0{id:020}")
}

pub(crate) fn path_scan(path: &str) -> String {
    format!("{path}\0")
}

pub(crate) fn target_key(record_id: u64, host: &str) -> String {
    format!("{record_id:020}\0{host}")
}

pub(crate) fn target_scan(record_id: u64) -> String {
    format!("{record_id:020}\0")
}

pub(crate) fn host_key(host: &str, record_id: u64) -> String {
    format!("{host}\0{record_id:020}")
}

pub(crate) fn host_scan(host: &str) -> String {
    format!("{host}\0")
}

pub(crate) fn user_role_key(user_id: u64, role_id: u64) -> String {
    format!("{user_id:020}\0{role_id:020}")
}

/// Key path component of a `RECORD_INDEX` key.
pub(crate) fn path_of_index_key(key: &str) -> &str {
    key.split_once('\0').map_or(key, |(path, _)| path)
}
