use crate::errors::*;
use crate::membership::Membership;
use crate::search::{quorum, AllocationMode, HealthStatus, SearchAdmin};
use log::{debug, info, warn};
use std::time::{Duration, Instant};

/// Cluster-scoped checks and settings changes that bracket a disruptive step.
pub struct ClusterSafety<'a> {
    pub admin: &'a dyn SearchAdmin,
    pub membership: &'a dyn Membership,
    pub acceptable: &'a [HealthStatus],
}

impl<'a> ClusterSafety<'a> {
    pub async fn health_status_acceptable(&self) -> Result<()> {
        let observed = self.admin.health_status().await?;
        if !self.acceptable.contains(&observed) {
            bail!(ErrorKind::UnacceptableHealth(observed, self.acceptable.to_vec()));
        }
        debug!("cluster health {} is acceptable", observed);
        Ok(())
    }

    pub async fn set_shard_allocation(&self, mode: AllocationMode) -> Result<()> {
        if !self.admin.set_shard_allocation(mode).await? {
            bail!(ErrorKind::AllocationNotAcknowledged(Some(mode)));
        }
        info!("shard allocation set to {}", mode.as_str());
        Ok(())
    }

    pub async fn clear_shard_allocation(&self) -> Result<()> {
        if !self.admin.clear_shard_allocation().await? {
            bail!(ErrorKind::AllocationNotAcknowledged(None));
        }
        info!("transient shard allocation override cleared");
        Ok(())
    }

    /// Best effort: a failed flush only makes the later recovery slower.
    pub async fn synchronized_flush(&self) -> bool {
        match self.admin.synchronized_flush().await {
            Ok(true) => {
                debug!("synced flush succeeded");
                true
            }
            Ok(false) => {
                warn!("synced flush did not complete on every shard");
                false
            }
            Err(e) => {
                warn!("synced flush failed: {}", e);
                false
            }
        }
    }

    pub async fn any_node_serving(&self) -> Result<bool> {
        Ok(self.membership.snapshot().await?.any_ready())
    }

    pub async fn nodes_not_serving(&self, nodes: &[String]) -> Result<Vec<String>> {
        let snapshot = self.membership.snapshot().await?;
        Ok(snapshot.not_ready(nodes.iter().map(String::as_str)))
    }

    pub async fn all_nodes_serving(&self, nodes: &[String]) -> Result<bool> {
        Ok(self.nodes_not_serving(nodes).await?.is_empty())
    }

    /// A pod turns ready before the cluster has admitted it. Fails until the
    /// cluster counts at least every ready pod of `nodes`.
    pub async fn confirm_joined(&self, nodes: &[String]) -> Result<()> {
        let snapshot = self.membership.snapshot().await?;
        let expected = snapshot.ready_members(nodes.iter().map(String::as_str)) as i32;
        let seen = self.admin.node_count().await?;
        if seen < expected {
            bail!(ErrorKind::NodesNotJoined(expected, seen));
        }
        debug!("cluster counts {} nodes, {} expected", seen, expected);
        Ok(())
    }

    /// Polls until no member is serving. Returns the nodes still serving when
    /// `timeout` ran out, empty otherwise.
    pub async fn wait_for_none_serving(
        &self,
        poll: Duration,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let serving = self.membership.snapshot().await?.ready_nodes();
            if serving.is_empty() {
                return Ok(serving);
            }
            if Instant::now() >= deadline {
                return Ok(serving);
            }
            debug!("waiting for {:?} to stop serving", serving);
            tokio::time::sleep(crate::node::jittered(poll)).await;
        }
    }

    /// Lines minimum master nodes up with the master-eligible count; best effort.
    pub async fn ensure_quorum(&self, master_nodes: i32) -> bool {
        if master_nodes == 0 {
            return true;
        }
        let want = quorum(master_nodes);
        let current = match self.admin.min_master_nodes().await {
            Ok(n) => n,
            Err(e) => {
                warn!("reading minimum master nodes failed: {}", e);
                return false;
            }
        };
        if current == want {
            return true;
        }
        match self.admin.set_min_master_nodes(want).await {
            Ok(true) => {
                info!("minimum master nodes changed from {} to {}", current, want);
                true
            }
            Ok(false) => {
                warn!("minimum master nodes change to {} not acknowledged", want);
                false
            }
            Err(e) => {
                warn!("setting minimum master nodes to {} failed: {}", want, e);
                false
            }
        }
    }
}
