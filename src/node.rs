use crate::errors::*;
use crate::fingerprint::{Fingerprints, CERT_HASH, CONFIG_HASH, TEMPLATE_HASH};
use crate::membership::Membership;
use crate::resources;
use crate::workload::{Workload, WorkloadKind, WorkloadStore};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::ResourceExt;
use log::{debug, info};
use rand::Rng;
use std::time::{Duration, Instant};

/// Replica count a stateless node had before it was scaled to zero.
pub const PREVIOUS_REPLICAS: &str = "pikach.us/previous-replicas";
/// Set when a node is scaled back up, cleared once its fingerprints are
/// refreshed. A node carrying it has been restarted and only needs waiting for.
pub const AWAITING_REJOIN: &str = "pikach.us/awaiting-rejoin";

/// Adds up to a tenth of `d` so parallel reconcilers do not poll in lockstep.
pub fn jittered(d: Duration) -> Duration {
    let max = (d.as_millis() / 10) as u64;
    if max == 0 {
        return d;
    }
    d + Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}

/// What a node should look like once its pending changes are applied.
#[derive(Clone, Debug, PartialEq)]
pub struct Desired {
    pub template: PodTemplateSpec,
    pub fingerprints: Fingerprints,
    /// Replica count of a stateless node when running.
    pub replicas: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatefulNode {
    pub name: String,
    pub record: StatefulSet,
    pub desired: Desired,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatelessNode {
    pub name: String,
    pub record: Deployment,
    pub desired: Desired,
}

/// One cluster member and the workload backing it, as seen at the start of a pass.
///
/// Every mutation re-reads the record from the store first, so calling any of
/// them twice is the same as calling it once.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeHandle {
    /// Single replica, data bearing, stable identity.
    Stateful(StatefulNode),
    /// Interchangeable replicas of a role without data.
    Stateless(StatelessNode),
}

impl NodeHandle {
    /// Pairs a listed workload with what it should look like; `None` if the
    /// workload carries no node label.
    pub fn new(record: Workload, desired: Desired) -> Option<Self> {
        let name = record.node_name()?.to_string();
        Some(match record {
            Workload::StatefulSet(record) => NodeHandle::Stateful(StatefulNode {
                name,
                record,
                desired,
            }),
            Workload::Deployment(record) => NodeHandle::Stateless(StatelessNode {
                name,
                record,
                desired,
            }),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            NodeHandle::Stateful(n) => &n.name,
            NodeHandle::Stateless(n) => &n.name,
        }
    }

    pub fn desired(&self) -> &Desired {
        match self {
            NodeHandle::Stateful(n) => &n.desired,
            NodeHandle::Stateless(n) => &n.desired,
        }
    }

    /// The record as listed at the start of the pass.
    pub fn record(&self) -> Workload {
        match self {
            NodeHandle::Stateful(n) => Workload::StatefulSet(n.record.clone()),
            NodeHandle::Stateless(n) => Workload::Deployment(n.record.clone()),
        }
    }

    fn kind(&self) -> WorkloadKind {
        match self {
            NodeHandle::Stateful(_) => WorkloadKind::StatefulSet,
            NodeHandle::Stateless(_) => WorkloadKind::Deployment,
        }
    }

    fn record_name(&self) -> String {
        match self {
            NodeHandle::Stateful(n) => n.record.name_any(),
            NodeHandle::Stateless(n) => n.record.name_any(),
        }
    }

    /// Replica count the node should run with.
    pub fn desired_replicas(&self) -> i32 {
        match self {
            NodeHandle::Stateful(_) => 1,
            NodeHandle::Stateless(n) => n.desired.replicas,
        }
    }

    async fn current(&self, store: &dyn WorkloadStore) -> Result<Workload> {
        let name = self.record_name();
        match store.get(self.kind(), &name).await? {
            Some(w) => Ok(w),
            None => bail!(ErrorKind::WorkloadMissing(name)),
        }
    }

    pub async fn scale_down(&self, store: &dyn WorkloadStore) -> Result<()> {
        let mut current = self.current(store).await?;
        let replicas = current.replicas();
        if replicas == 0 {
            debug!("{} already scaled down", self.name());
            return Ok(());
        }
        if let NodeHandle::Stateless(_) = self {
            current
                .annotations_mut()
                .insert(PREVIOUS_REPLICAS.to_string(), replicas.to_string());
        }
        current.set_replicas(0);
        store.replace(&current).await?;
        info!("scaled {} down from {} replicas", self.name(), replicas);
        Ok(())
    }

    pub async fn scale_up(&self, store: &dyn WorkloadStore) -> Result<()> {
        let mut current = self.current(store).await?;
        let target = match self {
            NodeHandle::Stateful(_) => 1,
            NodeHandle::Stateless(n) => current
                .annotation(PREVIOUS_REPLICAS)
                .and_then(|r| r.parse().ok())
                .unwrap_or(n.desired.replicas),
        };
        if current.replicas() == target {
            debug!("{} already at {} replicas", self.name(), target);
            return Ok(());
        }
        current.set_replicas(target);
        let annotations = current.annotations_mut();
        annotations.remove(PREVIOUS_REPLICAS);
        annotations.insert(AWAITING_REJOIN.to_string(), "true".to_string());
        store.replace(&current).await?;
        info!("scaled {} up to {} replicas", self.name(), target);
        Ok(())
    }

    /// Polls until the node has left the membership view. `Ok(true)` means the
    /// timeout ran out first; the caller decides whether that matters.
    pub async fn wait_for_leave(
        &self,
        membership: &dyn Membership,
        poll: Duration,
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if !membership.snapshot().await?.is_member(self.name()) {
                debug!("{} left the cluster", self.name());
                return Ok(false);
            }
            if Instant::now() >= deadline {
                return Ok(true);
            }
            tokio::time::sleep(jittered(poll)).await;
        }
    }

    /// Polls until the node is back and ready. Gives up with a retryable error
    /// after `budget`; the next pass polls again.
    pub async fn wait_for_rejoin(
        &self,
        membership: &dyn Membership,
        poll: Duration,
        budget: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + budget;
        loop {
            if membership.snapshot().await?.is_ready(self.name()) {
                debug!("{} rejoined the cluster", self.name());
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(ErrorKind::NodesNotRejoined(vec![self.name().to_string()]));
            }
            tokio::time::sleep(jittered(poll)).await;
        }
    }

    /// Whether the record still lags the desired template.
    pub fn has_pending_changes(&self) -> bool {
        let template = self.desired().fingerprints.template.as_str();
        self.record().annotation(TEMPLATE_HASH) != Some(template)
    }

    /// Whether config or template changed since the node was last brought in line.
    pub fn needs_upgrade(&self) -> bool {
        let config = self.desired().fingerprints.config.as_str();
        self.has_pending_changes() || self.record().annotation(CONFIG_HASH) != Some(config)
    }

    pub fn needs_cert_redeploy(&self) -> bool {
        self.record().annotation(CERT_HASH) != Some(self.desired().fingerprints.certs.as_str())
    }

    /// Whether an earlier pass scaled the node back up and it has not been
    /// seen rejoining since.
    pub async fn awaiting_rejoin(&self, store: &dyn WorkloadStore) -> Result<bool> {
        let current = self.current(store).await?;
        Ok(current.replicas() > 0 && current.annotation(AWAITING_REJOIN).is_some())
    }

    /// Whether the node is running and was last restarted with the desired
    /// template and config.
    pub async fn is_up_to_date(&self, store: &dyn WorkloadStore) -> Result<bool> {
        let current = self.current(store).await?;
        let fp = &self.desired().fingerprints;
        Ok(current.replicas() > 0
            && current.annotation(AWAITING_REJOIN).is_none()
            && current.annotation(TEMPLATE_HASH) == Some(fp.template.as_str())
            && current.annotation(CONFIG_HASH) == Some(fp.config.as_str()))
    }

    /// Writes the desired pod template to the record. No-op once applied.
    pub async fn apply_pending_changes(&self, store: &dyn WorkloadStore) -> Result<()> {
        let mut current = self.current(store).await?;
        let desired = self.desired();
        if current.annotation(TEMPLATE_HASH) == Some(desired.fingerprints.template.as_str()) {
            debug!("{} already runs the desired template", self.name());
            return Ok(());
        }
        current.set_template(desired.template.clone());
        current
            .annotations_mut()
            .insert(TEMPLATE_HASH.to_string(), desired.fingerprints.template.clone());
        store.replace(&current).await?;
        info!("applied pending changes to {}", self.name());
        Ok(())
    }

    /// Records the config and cert hashes the node now runs with.
    pub async fn refresh_fingerprints(&self, store: &dyn WorkloadStore) -> Result<()> {
        let mut current = self.current(store).await?;
        let fp = &self.desired().fingerprints;
        if current.annotation(CONFIG_HASH) == Some(fp.config.as_str())
            && current.annotation(CERT_HASH) == Some(fp.certs.as_str())
            && current.annotation(AWAITING_REJOIN).is_none()
        {
            return Ok(());
        }
        let template_hash = current.annotation(TEMPLATE_HASH).map(str::to_string);
        resources::stamp(&mut current, fp);
        let annotations = current.annotations_mut();
        annotations.remove(AWAITING_REJOIN);
        // the template hash only moves with apply_pending_changes
        match template_hash {
            Some(t) => annotations.insert(TEMPLATE_HASH.to_string(), t),
            None => annotations.remove(TEMPLATE_HASH),
        };
        store.replace(&current).await?;
        debug!("refreshed fingerprints of {}", self.name());
        Ok(())
    }
}
