//! Shared types used across keyflag crates.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identifier of a key record, assigned by the store on insert.
pub type RecordId = u64;

/// Identifier of an operator account.
pub type UserId = u64;

// ── Lifecycle ─────────────────────────────────────────────────────

/// Lifecycle state of a key record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Was the serving value, superseded or retired.
    ExpiredActive,
    /// Audit row: this proposal was accepted.
    Approved,
    /// The value currently served for the key.
    Active,
    /// Proposed value waiting for approval.
    PendingUpdate,
    /// Proposal turned down. Terminal.
    Rejected,
    /// Proposed value exposed to a restricted set of hosts.
    Canary,
    /// Proposed deletion waiting for approval.
    PendingDelete,
    /// Tombstone: the key's value was deleted through approval.
    Deleted,
}

impl KeyStatus {
    /// Human-readable label shown to operators.
    pub fn label(&self) -> &'static str {
        match self {
            KeyStatus::ExpiredActive => "expired",
            KeyStatus::Approved => "approved",
            KeyStatus::Active => "active",
            KeyStatus::PendingUpdate => "placed",
            KeyStatus::Rejected => "rejected",
            KeyStatus::Canary => "canary",
            KeyStatus::PendingDelete => "placed delete",
            KeyStatus::Deleted => "deleted",
        }
    }

    /// States holding the per-key proposal slot.
    pub fn is_proposal(&self) -> bool {
        matches!(
            self,
            KeyStatus::PendingUpdate | KeyStatus::Canary | KeyStatus::PendingDelete
        )
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome chosen by an approver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Reject,
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accept" | "approve" => Ok(Decision::Accept),
            "reject" | "disapprove" => Ok(Decision::Reject),
            other => Err(format!("unknown decision: {other} (expected accept or reject)")),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Accept => f.write_str("accept"),
            Decision::Reject => f.write_str("reject"),
        }
    }
}

// ── Records ───────────────────────────────────────────────────────

/// One lifecycle event for a configuration key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyRecord {
    /// Zero until the store assigns an id on insert.
    pub id: RecordId,
    pub key: String,
    pub value: String,
    /// Declared type tag of `value` (e.g. "bool", "string", "json").
    pub value_type: String,
    pub status: KeyStatus,
    pub created_by: UserId,
    pub approved_by: Option<UserId>,
    /// Proposal this record was promoted from (serving rows only).
    #[serde(default)]
    pub source_id: Option<RecordId>,
    /// Unix timestamp (seconds) of creation.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
}

impl KeyRecord {
    /// A fresh, not yet persisted record in the given state.
    pub fn new(
        key: &str,
        value: &str,
        value_type: &str,
        created_by: UserId,
        status: KeyStatus,
    ) -> Self {
        let now = epoch_secs();
        Self {
            id: 0,
            key: key.to_string(),
            value: value.to_string(),
            value_type: value_type.to_string(),
            status,
            created_by,
            approved_by: None,
            source_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The serving row produced by accepting this proposal.
    pub fn promoted(&self, status: KeyStatus, approver: UserId) -> Self {
        let now = epoch_secs();
        Self {
            id: 0,
            status,
            approved_by: Some(approver),
            source_id: Some(self.id),
            created_at: now,
            updated_at: now,
            ..self.clone()
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.status == KeyStatus::Deleted
    }
}

/// A host that sees a canary value for a key record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanaryTarget {
    pub record_id: RecordId,
    pub host: String,
    /// Disabled rows are kept as history.
    pub enabled: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Accounts ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
}

/// Kind of grant a role gives over a key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Lead,
    User,
    SuperUser,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Lead => "lead",
            Permission::User => "user",
            Permission::SuperUser => "superuser",
        }
    }
}

/// A permission granted over every key under `prefix`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Role {
    pub id: u64,
    pub prefix: String,
    pub permission: Permission,
    pub created_by: UserId,
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
