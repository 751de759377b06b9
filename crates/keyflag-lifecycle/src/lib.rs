//! keyflag key lifecycle: governed changes with staged canary exposure.
//!
//! Configuration keys are never written directly. A change is proposed,
//! then approved or rejected by a privileged caller; optionally it is
//! first exposed to a handful of hosts as a canary. The engine keeps these
//! invariants per key path:
//!
//! - at most one open proposal (placed, canary or placed delete),
//! - at most one `Active` record, superseded atomically on promotion,
//! - the value cache never runs ahead of committed storage.
//!
//! # Components
//!
//! - **`engine`**: proposals, approvals, retire, reads
//! - **`canary`**: host-scoped canary targets and their status
//! - **`bootstrap`**: one-shot service onboarding

pub mod bootstrap;
pub mod canary;
pub mod engine;
pub mod error;

pub use bootstrap::ServiceBootstrap;
pub use canary::{CanaryOutcome, CanaryStatus};
pub use engine::{ApprovalOutcome, KeyLifecycle, RetireOutcome};
pub use error::{EngineError, EngineResult};
