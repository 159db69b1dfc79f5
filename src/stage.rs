//! The staged apply / check-ready / advance state machine
//!
//! Every derived resource moves through the same two-stage lifecycle: first
//! it is applied (created, or its spec replaced if it already exists), then
//! it is observed until ready. Both facts are recorded in the owner's
//! condition ledger, so a repeated reconcile skips work that is already done
//! and a crashed reconcile resumes exactly where it left off.
//!
//! The machine is parameterized over a resource kind via [`ChildResource`];
//! each controller implements it once per derived kind (deployment, service,
//! gateway CR, ingress, plugin CR) and drives it with [`advance`].

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Requeue delay while waiting on plugin- and ingress-level resources
pub const REQUEUE_SLOW: Duration = Duration::from_secs(10);

/// Requeue delay while waiting on service-level resources
pub const REQUEUE_FAST: Duration = Duration::from_secs(5);

/// The condition recorded when a stage completes
#[derive(Clone, Debug)]
pub struct ConditionSeed {
    /// Condition type to record
    pub type_: String,
    /// Machine-readable reason
    pub reason: &'static str,
    /// Human-readable message
    pub message: String,
}

/// The pair of conditions a child resource moves through
#[derive(Clone, Debug)]
pub struct StageConditions {
    /// Recorded once the child has been created or its spec replaced
    pub applied: ConditionSeed,
    /// Recorded once the child has been observed ready
    pub ready: ConditionSeed,
}

/// One derived resource kind, as seen by the state machine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChildResource: Send + Sync {
    /// Short label for logging
    fn describe(&self) -> &'static str;

    /// The applied/ready condition pair recorded on the owner
    fn conditions(&self) -> StageConditions;

    /// Delay before re-checking readiness
    fn requeue_delay(&self) -> Duration {
        REQUEUE_SLOW
    }

    /// Bring the child to its desired state
    ///
    /// Builds the desired object from the owner's spec, looks up any existing
    /// object by its deterministic name, creates it if absent or replaces its
    /// spec and updates it otherwise. The desired state is authoritative; no
    /// merge is attempted.
    async fn apply(&self) -> Result<()>;

    /// Probe the child's actual readiness
    async fn is_ready(&self) -> Result<bool>;
}

/// The owner's view of the condition ledger during one stage
///
/// Implemented per controller: reads consult the in-memory object, writes
/// update it and persist the status subresource.
#[async_trait]
pub trait StageLedger: Send + Sync {
    /// Whether a condition is satisfied at the owner's current generation
    fn is_satisfied(&self, type_: &str) -> bool;

    /// Record a True condition and persist the owner's status
    async fn record(&mut self, seed: &ConditionSeed);
}

/// What the state machine decided for one child on this pass
#[derive(Debug, PartialEq, Eq)]
pub enum StageOutcome {
    /// Both stages are satisfied; the caller may move to the next child
    Converged,
    /// The child is applied but not ready; re-reconcile after the delay
    Retry(Duration),
}

/// Drive one child resource forward by at most one stage
///
/// Apply errors propagate to the caller without recording anything; the
/// calling framework retries the whole reconcile, which is safe because the
/// apply is idempotent. A not-ready probe is not an error - it yields a
/// timed retry and no condition is recorded for the probe itself.
pub async fn advance(
    child: &dyn ChildResource,
    ledger: &mut dyn StageLedger,
) -> Result<StageOutcome> {
    let conditions = child.conditions();

    if !ledger.is_satisfied(&conditions.applied.type_) {
        child.apply().await?;
        ledger.record(&conditions.applied).await;
        debug!(child = child.describe(), "applied");
    }

    if ledger.is_satisfied(&conditions.ready.type_) {
        return Ok(StageOutcome::Converged);
    }

    if child.is_ready().await? {
        ledger.record(&conditions.ready).await;
        debug!(child = child.describe(), "ready");
        Ok(StageOutcome::Converged)
    } else {
        debug!(child = child.describe(), "not ready yet");
        Ok(StageOutcome::Retry(child.requeue_delay()))
    }
}
