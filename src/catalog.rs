//! The fixed set of operations the orchestrator knows how to carry out.
//!
//! | operation       | precheck | prep                  | main                                |
//! |-----------------|----------|-----------------------|-------------------------------------|
//! | config push     | health   | flush + prim., strict | update each changed node in turn    |
//! | cert restart    | -        | -                     | all down, wait none serving, all up |
//! | version restart | health   | flush + prim., lax    | all down, wait, apply, all up       |
//! | node restart    | health   | flush + prim., lax    | down, wait leave, up, wait rejoin   |
//! | node update     | health   | flush + prim., strict | down, wait leave, apply, up, rejoin |
//!
//! Data pods are only ever replaced by scaling, so pushing a spec means
//! restarting the node with it. Post waits for every node to serve, checks
//! the cluster counts them all and re-enables allocation; recovery waits for
//! acceptable health and drops any transient allocation override. Rolling
//! operations run a node operation per node, one after the other.

use crate::cluster::{ClusterOperationKind, NodeOperationKind, SearchClusterStatus};
use crate::errors::*;
use crate::executor::{execute, OperationContext, Outcome, Phased};
use crate::node::NodeHandle;
use crate::search::AllocationMode;
use crate::state::{Phase, Scope};
use async_trait::async_trait;
use log::{debug, info, warn};

/// Whether failing to protect in-flight writes before `main` aborts the pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Strictness {
    Required,
    Optional,
}

#[derive(Clone, Debug)]
pub struct ClusterOperation {
    kind: ClusterOperationKind,
    cluster: String,
    nodes: Vec<NodeHandle>,
    masters: i32,
    scope: Scope,
}

#[derive(Clone, Debug)]
pub struct NodeOperation {
    kind: NodeOperationKind,
    cluster: String,
    node: NodeHandle,
    /// Every member of the cluster, target included.
    members: Vec<String>,
    /// Master-eligible member count, for the quorum setting.
    masters: i32,
    scope: Scope,
}

#[derive(Clone, Debug)]
pub enum Operation {
    Cluster(ClusterOperation),
    Node(NodeOperation),
}

/// Builds operations, checking that each has everything its phases need.
#[derive(Clone, Debug, Default)]
pub struct OperationBuilder {
    cluster: String,
    nodes: Vec<NodeHandle>,
    masters: Vec<String>,
}

impl OperationBuilder {
    pub fn new(cluster: impl Into<String>) -> Self {
        OperationBuilder {
            cluster: cluster.into(),
            ..OperationBuilder::default()
        }
    }

    /// Every member of the cluster.
    pub fn nodes(mut self, nodes: Vec<NodeHandle>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Names of the master-eligible members.
    pub fn masters(mut self, masters: Vec<String>) -> Self {
        self.masters = masters;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.cluster.is_empty() {
            bail!(ErrorKind::InvalidOperation("cluster name is empty".to_string()));
        }
        if self.nodes.is_empty() {
            bail!(ErrorKind::InvalidOperation(format!("{} has no nodes", self.cluster)));
        }
        let mut names: Vec<&str> = self.nodes.iter().map(NodeHandle::name).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            bail!(ErrorKind::InvalidOperation(format!("{} lists a node twice", self.cluster)));
        }
        if let Some(m) = self.masters.iter().find(|m| !names.contains(&m.as_str())) {
            bail!(ErrorKind::InvalidOperation(format!(
                "master {} is not a node of {}",
                m, self.cluster
            )));
        }
        Ok(())
    }

    fn member_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name().to_string()).collect()
    }

    pub fn cluster_operation(self, kind: ClusterOperationKind) -> Result<Operation> {
        self.validate()?;
        let scope = Scope::Cluster {
            kind,
            nodes: self.member_names(),
        };
        Ok(Operation::Cluster(ClusterOperation {
            kind,
            masters: self.masters.len() as i32,
            cluster: self.cluster,
            nodes: self.nodes,
            scope,
        }))
    }

    pub fn node_operation(self, kind: NodeOperationKind, node: &str) -> Result<Operation> {
        self.validate()?;
        let target = match self.nodes.iter().find(|n| n.name() == node) {
            Some(n) => n.clone(),
            None => bail!(ErrorKind::InvalidOperation(format!(
                "{} is not a node of {}",
                node, self.cluster
            ))),
        };
        Ok(Operation::Node(NodeOperation {
            kind,
            members: self.member_names(),
            masters: self.masters.len() as i32,
            scope: Scope::Node {
                kind,
                node: node.to_string(),
            },
            cluster: self.cluster,
            node: target,
        }))
    }

    /// One node operation per target, run in the given order.
    pub fn rolling(self, kind: NodeOperationKind, targets: &[String]) -> Result<RollingOperation> {
        if targets.is_empty() {
            bail!(ErrorKind::InvalidOperation(format!(
                "rolling {:?} of {} has no targets",
                kind, self.cluster
            )));
        }
        let steps = targets
            .iter()
            .map(|t| self.clone().node_operation(kind, t))
            .collect::<Result<Vec<_>>>()?;
        Ok(RollingOperation { kind, steps })
    }
}

impl Operation {
    pub fn scope(&self) -> &Scope {
        match self {
            Operation::Cluster(op) => &op.scope,
            Operation::Node(op) => &op.scope,
        }
    }

    /// Runs whatever phases are due, see `executor::execute`.
    pub async fn execute(&self, ctx: &OperationContext<'_>) -> Result<Outcome> {
        execute(self, ctx).await
    }

    async fn precheck(&self, ctx: &OperationContext<'_>) -> Result<()> {
        match self {
            Operation::Cluster(op) if op.kind == ClusterOperationKind::CertRestart => {
                // certificates are read from disk at start; health does not matter
                Ok(())
            }
            _ => ctx.safety().health_status_acceptable().await,
        }
    }

    async fn prep(&self, ctx: &OperationContext<'_>) -> Result<()> {
        let strictness = match self {
            Operation::Cluster(op) => match op.kind {
                ClusterOperationKind::CertRestart => return Ok(()),
                ClusterOperationKind::ConfigPush => Strictness::Required,
                ClusterOperationKind::VersionRestart => Strictness::Optional,
            },
            Operation::Node(op) => match op.kind {
                NodeOperationKind::Restart => Strictness::Optional,
                NodeOperationKind::Update => Strictness::Required,
            },
        };
        protect_writes(ctx, strictness).await
    }

    async fn main(&self, ctx: &OperationContext<'_>) -> Result<()> {
        match self {
            Operation::Cluster(op) => match op.kind {
                ClusterOperationKind::ConfigPush => {
                    for node in &op.nodes {
                        update_node(ctx, node).await?;
                    }
                    Ok(())
                }
                ClusterOperationKind::CertRestart => full_restart(ctx, &op.nodes, false).await,
                ClusterOperationKind::VersionRestart => full_restart(ctx, &op.nodes, true).await,
            },
            Operation::Node(op) => match op.kind {
                NodeOperationKind::Restart => restart_node(ctx, &op.node, false).await,
                NodeOperationKind::Update => update_node(ctx, &op.node).await,
            },
        }
    }

    async fn post(&self, ctx: &OperationContext<'_>) -> Result<()> {
        let (members, masters) = match self {
            Operation::Cluster(op) => (
                op.nodes.iter().map(|n| n.name().to_string()).collect(),
                op.masters,
            ),
            Operation::Node(op) => (op.members.clone(), op.masters),
        };
        let safety = ctx.safety();
        if !safety.all_nodes_serving(&members).await? {
            bail!(ErrorKind::NodesNotRejoined(safety.nodes_not_serving(&members).await?));
        }
        safety.confirm_joined(&members).await?;
        safety.set_shard_allocation(AllocationMode::All).await?;
        if !safety.ensure_quorum(masters).await {
            ctx.skipped_safety_step("the minimum master nodes update");
        }
        Ok(())
    }

    async fn recovery(&self, ctx: &OperationContext<'_>) -> Result<()> {
        let safety = ctx.safety();
        safety.health_status_acceptable().await?;
        if let Err(e) = safety.clear_shard_allocation().await {
            warn!("clearing the transient allocation override failed: {}", e);
            ctx.skipped_safety_step("clearing the transient allocation override");
        }
        Ok(())
    }
}

#[async_trait]
impl Phased for Operation {
    fn describe(&self) -> String {
        match self {
            Operation::Cluster(op) => format!("{:?} of {}", op.kind, op.cluster),
            Operation::Node(op) => format!("{:?} of {}/{}", op.kind, op.cluster, op.node.name()),
        }
    }

    fn guard(&self, phase: Phase, status: &SearchClusterStatus) -> bool {
        self.scope().guard(phase, status)
    }

    async fn act(&self, phase: Phase, ctx: &OperationContext<'_>) -> Result<()> {
        match phase {
            Phase::Precheck => self.precheck(ctx).await,
            Phase::Prep => self.prep(ctx).await,
            Phase::Main => self.main(ctx).await,
            Phase::Post => self.post(ctx).await,
            Phase::Recovery => self.recovery(ctx).await,
        }
    }

    fn transition(&self, phase: Phase, status: &mut SearchClusterStatus) {
        self.scope().transition(phase, status)
    }
}

/// Flush and restrict allocation to primaries ahead of a disruption.
async fn protect_writes(ctx: &OperationContext<'_>, strictness: Strictness) -> Result<()> {
    let safety = ctx.safety();
    if !safety.any_node_serving().await? {
        // nothing would take the setting; changing it would only hide the outage
        ctx.skipped_safety_step("shard allocation changes while no node is serving");
        return Ok(());
    }
    if !safety.synchronized_flush().await {
        ctx.skipped_safety_step("a synced flush");
    }
    match safety.set_shard_allocation(AllocationMode::Primaries).await {
        Ok(()) => Ok(()),
        Err(e) if strictness == Strictness::Optional => {
            warn!("restricting allocation to primaries failed: {}", e);
            ctx.skipped_safety_step("primaries-only allocation");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn full_restart(
    ctx: &OperationContext<'_>,
    nodes: &[NodeHandle],
    apply: bool,
) -> Result<()> {
    for node in nodes {
        node.scale_down(ctx.workloads).await?;
    }
    let still = ctx
        .safety()
        .wait_for_none_serving(ctx.config.poll_interval(), ctx.config.drain_timeout())
        .await?;
    if !still.is_empty() {
        bail!(ErrorKind::NodesStillServing(still));
    }
    info!("no node is serving, bringing {} nodes back", nodes.len());
    for node in nodes {
        if apply {
            node.apply_pending_changes(ctx.workloads).await?;
        }
        node.scale_up(ctx.workloads).await?;
        node.refresh_fingerprints(ctx.workloads).await?;
    }
    Ok(())
}

/// Takes one node out and brings it back, writing its pending changes while
/// it is down when `apply` is set. A node an earlier pass already brought
/// back is only waited for; scaling it down again would restart it forever.
async fn restart_node(ctx: &OperationContext<'_>, node: &NodeHandle, apply: bool) -> Result<()> {
    let config = ctx.config;
    if node.awaiting_rejoin(ctx.workloads).await? {
        info!("{} is already back up, waiting for it to rejoin", node.name());
    } else {
        node.scale_down(ctx.workloads).await?;
        let timed_out = node
            .wait_for_leave(ctx.membership, config.poll_interval(), config.leave_timeout())
            .await?;
        if timed_out {
            if ctx.safety().any_node_serving().await? {
                bail!(ErrorKind::NodeStillMember(node.name().to_string()));
            }
            // the whole cluster is down, the node will never be seen leaving
            warn!("{} did not leave but no node is serving, continuing", node.name());
        }
        if apply {
            node.apply_pending_changes(ctx.workloads).await?;
        }
        node.scale_up(ctx.workloads).await?;
    }
    node.wait_for_rejoin(ctx.membership, config.poll_interval(), config.rejoin_timeout())
        .await?;
    node.refresh_fingerprints(ctx.workloads).await
}

/// Restarts the node with its desired spec unless it already runs it.
async fn update_node(ctx: &OperationContext<'_>, node: &NodeHandle) -> Result<()> {
    if node.is_up_to_date(ctx.workloads).await? {
        debug!("{} already runs the desired spec", node.name());
        return Ok(());
    }
    restart_node(ctx, node, true).await
}

/// A node operation applied to each target in turn, stopping at the first error.
#[derive(Clone, Debug)]
pub struct RollingOperation {
    kind: NodeOperationKind,
    steps: Vec<Operation>,
}

impl RollingOperation {
    pub fn kind(&self) -> NodeOperationKind {
        self.kind
    }

    /// Runs the steps sequentially. Never runs two nodes concurrently: taking
    /// down more data nodes than the replication allows loses shards.
    pub async fn execute(&self, ctx: &OperationContext<'_>) -> Result<Vec<Outcome>> {
        let mut outcomes = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            outcomes.push(step.execute(ctx).await?);
        }
        Ok(outcomes)
    }
}
