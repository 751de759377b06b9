//! Service onboarding.
//!
//! Creates the `service/<tribe>/<service>/default` flag, the role grants
//! on the service prefix and the caller's lead grant in one transaction.

use serde::Serialize;
use tracing::info;

use keyflag_core::{Decision, KeyPath, KeyRecord, KeyStatus, Permission, Role, User};

use crate::engine::{settle, KeyLifecycle};
use crate::error::{EngineError, EngineResult};

const DEFAULT_VALUE: &str = "false";
const DEFAULT_TYPE: &str = "bool";

#[derive(Debug, Clone, Serialize)]
pub struct ServiceBootstrap {
    pub user: User,
    /// Serving record of the service's `default` key.
    pub record: KeyRecord,
    pub roles: Vec<Role>,
    pub cache_synced: bool,
}

impl KeyLifecycle {
    /// Onboard `service` of `tribe`, owned by `username`.
    ///
    /// The `default` key is proposed and accepted by the owner inside the
    /// same transaction, so it is served as soon as this returns.
    pub fn bootstrap_service(
        &self,
        username: &str,
        tribe: &str,
        service: &str,
    ) -> EngineResult<ServiceBootstrap> {
        let default_key = KeyPath::service_default(tribe, service)?;
        let prefix = KeyPath::service_prefix(tribe, service)?;

        let txn = self.store.begin_write()?;
        let user = txn
            .user_by_name(username)?
            .ok_or_else(|| EngineError::NotFound(format!("user {username}")))?;

        if !txn.records_for_key(default_key.as_str(), None)?.is_empty() {
            return Err(EngineError::Conflict(format!(
                "{tribe}/{service}: service already exists"
            )));
        }

        let proposal = txn.insert_record(KeyRecord::new(
            default_key.as_str(),
            DEFAULT_VALUE,
            DEFAULT_TYPE,
            user.id,
            KeyStatus::PendingUpdate,
        ))?;
        txn.claim_proposal(default_key.as_str(), proposal.id)?;
        let record = settle(&txn, proposal, user.id, Decision::Accept, KeyStatus::Active)?;

        let mut roles = Vec::new();
        for permission in [Permission::SuperUser, Permission::User, Permission::Lead] {
            roles.push(txn.create_role(prefix.as_str(), permission, user.id)?);
        }
        let lead: Vec<u64> = roles
            .iter()
            .filter(|r| r.permission == Permission::Lead)
            .map(|r| r.id)
            .collect();
        txn.map_user_roles(user.id, &lead)?;
        txn.commit()?;

        info!(%tribe, %service, user = %user.username, record_id = record.id, "service bootstrapped");
        let cache_synced = self.publish(&record);
        Ok(ServiceBootstrap {
            user,
            record,
            roles,
            cache_synced,
        })
    }

    /// Create an account, or return the existing one with that username.
    pub fn create_user(&self, username: &str, email: &str) -> EngineResult<User> {
        if username.is_empty() || username.chars().any(char::is_whitespace) {
            return Err(EngineError::InvalidInput(format!(
                "invalid username: {username:?}"
            )));
        }
        Ok(self.store.create_user(username, email)?)
    }

    pub fn user_by_name(&self, username: &str) -> EngineResult<User> {
        self.store
            .user_by_name(username)?
            .ok_or_else(|| EngineError::NotFound(format!("user {username}")))
    }
}
