//! Canary rollout: expose a proposed value to a few hosts first.
//!
//! A canary is seeded from the key's pending update. The record flips to
//! `Canary` and keeps the key's proposal slot; each call adds hosts to it.
//! Canary values are never written to the value cache. Readers see them
//! only through the host-scoped overlay in
//! [`KeyLifecycle::get_active_values`]. The canary ends through
//! [`KeyLifecycle::approve`] (promote or abort) or a retire.

use serde::Serialize;
use tracing::{info, warn};

use keyflag_core::{epoch_secs, Decision, KeyPath, KeyRecord, KeyStatus, RecordId, UserId};

use crate::engine::KeyLifecycle;
use crate::error::{EngineError, EngineResult};

/// Result of [`KeyLifecycle::start_or_extend_canary`].
#[derive(Debug, Clone, Serialize)]
pub struct CanaryOutcome {
    /// The canary record, or the rejected record when the canary was aborted.
    pub record: KeyRecord,
    /// Hosts that were newly enabled by this call.
    pub added_hosts: Vec<String>,
    /// Whether this call moved the record into canary.
    pub first_time: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanaryStatus {
    pub record_id: RecordId,
    pub key: String,
    pub enabled_hosts: Vec<String>,
    /// Hosts the deployment registry suggests for the key's service.
    pub recommended_hosts: Vec<String>,
}

impl KeyLifecycle {
    /// Start a canary for `key`'s pending update, or add hosts to the
    /// running one. Hosts from earlier calls stay enabled.
    ///
    /// A `Reject` decision aborts: it is handled exactly like
    /// [`approve`](KeyLifecycle::approve) with `Reject`.
    pub fn start_or_extend_canary(
        &self,
        key: &str,
        approver: UserId,
        decision: Decision,
        hosts: &[String],
    ) -> EngineResult<CanaryOutcome> {
        if decision == Decision::Reject {
            let outcome = self.approve(key, approver, decision)?;
            return Ok(CanaryOutcome {
                record: outcome.record,
                added_hosts: Vec::new(),
                first_time: false,
            });
        }

        let path = KeyPath::parse(key)?;
        validate_hosts(hosts)?;

        let txn = self.store.begin_write()?;
        let mut running = txn.records_for_key(path.as_str(), Some(KeyStatus::Canary))?;
        let (mut record, first_time) = match running.pop() {
            Some(record) if running.is_empty() => (record, false),
            Some(_) => {
                return Err(EngineError::ConsistencyViolation(format!(
                    "{path}: more than one canary record"
                )));
            }
            None => {
                let mut seeds =
                    txn.records_for_key(path.as_str(), Some(KeyStatus::PendingUpdate))?;
                match (seeds.pop(), seeds.is_empty()) {
                    (Some(seed), true) => (seed, true),
                    (Some(_), false) => {
                        return Err(EngineError::ConsistencyViolation(format!(
                            "{path}: ambiguous pending state"
                        )));
                    }
                    (None, _) => {
                        return Err(EngineError::NotFound(format!(
                            "{path}: no key pending approval"
                        )));
                    }
                }
            }
        };

        let mut added_hosts = Vec::new();
        for host in hosts {
            if txn.insert_canary_target(record.id, host)? {
                added_hosts.push(host.clone());
            }
        }

        if first_time {
            record.status = KeyStatus::Canary;
            record.approved_by = Some(approver);
            record.updated_at = epoch_secs();
            txn.update_record(&record)?;
        }
        txn.commit()?;

        info!(
            key = %path,
            record_id = record.id,
            first_time,
            added = added_hosts.len(),
            approver,
            "canary hosts enabled"
        );
        Ok(CanaryOutcome {
            record,
            added_hosts,
            first_time,
        })
    }

    /// Enabled hosts of a canary record plus the registry's recommendation
    /// for its service. A registry failure leaves the recommendation empty.
    pub fn canary_status(&self, record_id: RecordId) -> EngineResult<CanaryStatus> {
        let record = self.record(record_id)?;
        let enabled_hosts = self
            .store
            .canary_targets(record_id)?
            .into_iter()
            .filter(|t| t.enabled)
            .map(|t| t.host)
            .collect();

        let path = KeyPath::parse(&record.key)?;
        let recommended_hosts = match path.service_name() {
            Some(service) => match self.registry.recommended_hosts(service) {
                Ok(hosts) => hosts,
                Err(err) => {
                    warn!(%service, record_id, error = %err, "registry lookup failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        Ok(CanaryStatus {
            record_id,
            key: record.key,
            enabled_hosts,
            recommended_hosts,
        })
    }

    /// Record the hosts that received the newest build of `service`.
    pub fn register_canary_deployment(&self, service: &str, hosts: &[String]) -> EngineResult<()> {
        validate_hosts(hosts)?;
        self.registry.register(service, hosts)?;
        info!(%service, count = hosts.len(), "canary deployment registered");
        Ok(())
    }

    pub fn release_canary_hosts(&self, service: &str) -> EngineResult<()> {
        self.registry.release(service)?;
        info!(%service, "canary hosts released");
        Ok(())
    }
}

fn validate_hosts(hosts: &[String]) -> EngineResult<()> {
    if hosts.is_empty() {
        return Err(EngineError::InvalidInput("no canary hosts given".to_string()));
    }
    if let Some(bad) = hosts
        .iter()
        .find(|h| h.is_empty() || h.chars().any(char::is_whitespace))
    {
        return Err(EngineError::InvalidInput(format!(
            "invalid host address: {bad:?}"
        )));
    }
    Ok(())
}
