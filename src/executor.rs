use crate::cluster::SearchClusterStatus;
use crate::config::OperatorConfig;
use crate::errors::*;
use crate::membership::Membership;
use crate::safety::ClusterSafety;
use crate::search::SearchAdmin;
use crate::state::Phase;
use crate::store::StatusStore;
use crate::workload::WorkloadStore;
use async_trait::async_trait;
use log::{info, trace, warn};
use std::sync::atomic::{AtomicU32, Ordering};

/// Everything an operation touches during one reconciliation pass.
pub struct OperationContext<'a> {
    pub admin: &'a dyn SearchAdmin,
    pub membership: &'a dyn Membership,
    pub workloads: &'a dyn WorkloadStore,
    pub store: &'a dyn StatusStore,
    pub config: &'a OperatorConfig,
    skipped: AtomicU32,
}

impl<'a> OperationContext<'a> {
    pub fn new(
        admin: &'a dyn SearchAdmin,
        membership: &'a dyn Membership,
        workloads: &'a dyn WorkloadStore,
        store: &'a dyn StatusStore,
        config: &'a OperatorConfig,
    ) -> Self {
        OperationContext {
            admin,
            membership,
            workloads,
            store,
            config,
            skipped: AtomicU32::new(0),
        }
    }

    pub fn safety(&self) -> ClusterSafety<'_> {
        ClusterSafety {
            admin: self.admin,
            membership: self.membership,
            acceptable: &self.config.acceptable_health,
        }
    }

    /// Notes a best-effort safety step that did not happen.
    pub fn skipped_safety_step(&self, what: &str) {
        warn!("continuing without {}", what);
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn skipped_safety_steps(&self) -> u32 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// A five phase operation whose progress lives in the cluster status.
#[async_trait]
pub trait Phased: Send + Sync {
    fn describe(&self) -> String;

    /// Whether `phase` is due, judged only from persisted `status`.
    fn guard(&self, phase: Phase, status: &SearchClusterStatus) -> bool;

    /// Does the work of `phase`. Must be safe to repeat.
    async fn act(&self, phase: Phase, ctx: &OperationContext<'_>) -> Result<()>;

    /// Records `phase` as done.
    fn transition(&self, phase: Phase, status: &mut SearchClusterStatus);
}

#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    /// Status as persisted after the last transition of the pass.
    pub status: SearchClusterStatus,
    pub phases_run: Vec<Phase>,
    pub skipped_safety_steps: u32,
}

/// Runs every due phase in order. A failing action ends the pass with its
/// error and leaves the persisted state as it was; a successful one is
/// persisted before the next guard is evaluated, so phases cascade within a
/// pass once their predecessor is done.
pub async fn execute<P: Phased + ?Sized>(op: &P, ctx: &OperationContext<'_>) -> Result<Outcome> {
    let before = ctx.skipped_safety_steps();
    let mut status = ctx.store.read().await?;
    let mut phases_run = Vec::new();

    for phase in Phase::ALL {
        if !op.guard(phase, &status) {
            trace!("{}: {} not due", op.describe(), phase);
            continue;
        }
        info!("{}: running {}", op.describe(), phase);
        op.act(phase, ctx).await?;
        status = ctx
            .store
            .update(&|s: &mut SearchClusterStatus| op.transition(phase, s))
            .await?;
        info!("{}: {} done", op.describe(), phase);
        phases_run.push(phase);
    }

    Ok(Outcome {
        status,
        phases_run,
        skipped_safety_steps: ctx.skipped_safety_steps() - before,
    })
}
