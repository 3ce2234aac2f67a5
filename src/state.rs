//! Checkpoints of in-flight operations, as stored in `SearchClusterStatus`.
//!
//! Guards look only at persisted fields, never at anything the running
//! process remembers, so an operation rebuilt after a restart picks up at the
//! same phase the previous process had reached.

use crate::cluster::{
    ClusterCondition, ClusterOperationKind, ConditionStatus, ConditionType, NodeOperationKind,
    NodeStatus, NodeUpgradeStatus, SearchClusterStatus, UpgradePhase,
};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Precheck,
    Prep,
    Main,
    Post,
    Recovery,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Precheck,
        Phase::Prep,
        Phase::Main,
        Phase::Post,
        Phase::Recovery,
    ];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Precheck => "precheck",
            Phase::Prep => "prep",
            Phase::Main => "main",
            Phase::Post => "post",
            Phase::Recovery => "recovery",
        })
    }
}

/// Where a cluster-wide operation stands, read off the three conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Nothing in flight; a new operation starts with its precheck.
    Idle,
    Prep,
    Main,
    Post,
    Recovery,
    /// A combination no transition produces.
    Invalid,
}

impl ClusterPhase {
    // (Restarting, UpdatingSettings, Recovering)
    fn flags(self) -> Option<(bool, bool, bool)> {
        match self {
            ClusterPhase::Idle => Some((false, false, false)),
            ClusterPhase::Prep => Some((false, true, false)),
            ClusterPhase::Main => Some((true, false, false)),
            ClusterPhase::Post => Some((true, true, false)),
            ClusterPhase::Recovery => Some((false, false, true)),
            ClusterPhase::Invalid => None,
        }
    }

    fn from_flags(flags: (bool, bool, bool)) -> Self {
        match flags {
            (false, false, false) => ClusterPhase::Idle,
            (false, true, false) => ClusterPhase::Prep,
            (true, false, false) => ClusterPhase::Main,
            (true, true, false) => ClusterPhase::Post,
            (false, false, true) => ClusterPhase::Recovery,
            _ => ClusterPhase::Invalid,
        }
    }
}

impl SearchClusterStatus {
    pub fn condition(&self, type_: ConditionType) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == ConditionStatus::True)
    }

    fn set_condition(&mut self, type_: ConditionType, value: bool, reason: &str) {
        let status = ConditionStatus::from(value);
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(c) if c.status == status => {}
            Some(c) => {
                c.status = status;
                c.last_transition_time = chrono::Utc::now().to_rfc3339();
                c.reason = Some(reason.to_string());
            }
            None => self.conditions.push(ClusterCondition {
                type_,
                status,
                last_transition_time: chrono::Utc::now().to_rfc3339(),
                reason: Some(reason.to_string()),
                message: None,
            }),
        }
    }

    pub fn cluster_phase(&self) -> ClusterPhase {
        ClusterPhase::from_flags((
            self.condition(ConditionType::Restarting),
            self.condition(ConditionType::UpdatingSettings),
            self.condition(ConditionType::Recovering),
        ))
    }

    /// Writes all three conditions at once, so only table rows are ever stored.
    pub fn enter_cluster_phase(&mut self, phase: ClusterPhase, reason: &str) {
        if let Some((restarting, updating, recovering)) = phase.flags() {
            self.set_condition(ConditionType::Restarting, restarting, reason);
            self.set_condition(ConditionType::UpdatingSettings, updating, reason);
            self.set_condition(ConditionType::Recovering, recovering, reason);
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeUpgradeStatus> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .map(|n| &n.upgrade_status)
    }

    pub fn node_mut(&mut self, name: &str) -> &mut NodeUpgradeStatus {
        let idx = match self.nodes.iter().position(|n| n.name == name) {
            Some(idx) => idx,
            None => {
                self.nodes.push(NodeStatus {
                    name: name.to_string(),
                    upgrade_status: NodeUpgradeStatus::default(),
                });
                self.nodes.len() - 1
            }
        };
        &mut self.nodes[idx].upgrade_status
    }

    pub fn any_node_under_upgrade(&self) -> bool {
        self.nodes.iter().any(|n| n.upgrade_status.under_upgrade)
    }

    /// Node under upgrade, if any, and the operation holding it.
    pub fn node_in_flight(&self) -> Option<(&str, Option<NodeOperationKind>)> {
        self.nodes
            .iter()
            .find(|n| n.upgrade_status.under_upgrade)
            .map(|n| (n.name.as_str(), n.upgrade_status.operation))
    }
}

/// What an operation's checkpoints are attached to.
#[derive(Clone, Debug, PartialEq)]
pub enum Scope {
    /// The cluster conditions; `nodes` get their schedule flag cleared on completion.
    Cluster {
        kind: ClusterOperationKind,
        nodes: Vec<String>,
    },
    /// The upgrade status of one node.
    Node {
        kind: NodeOperationKind,
        node: String,
    },
}

impl Scope {
    pub fn guard(&self, phase: Phase, status: &SearchClusterStatus) -> bool {
        match self {
            Scope::Cluster { kind, nodes } => cluster_guard(*kind, nodes, phase, status),
            Scope::Node { kind, node } => node_guard(*kind, node, phase, status),
        }
    }

    pub fn transition(&self, phase: Phase, status: &mut SearchClusterStatus) {
        match self {
            Scope::Cluster { kind, nodes } => cluster_transition(*kind, nodes, phase, status),
            Scope::Node { kind, node } => node_transition(*kind, node, phase, status),
        }
    }
}

// node flag a cluster operation works off
fn cluster_flag(kind: ClusterOperationKind, upgrade: &NodeUpgradeStatus) -> bool {
    match kind {
        ClusterOperationKind::CertRestart => upgrade.scheduled_for_cert_redeploy,
        ClusterOperationKind::ConfigPush | ClusterOperationKind::VersionRestart => {
            upgrade.scheduled_for_upgrade
        }
    }
}

fn cluster_guard(
    kind: ClusterOperationKind,
    nodes: &[String],
    phase: Phase,
    status: &SearchClusterStatus,
) -> bool {
    let current = status.cluster_phase();
    match phase {
        Phase::Precheck => {
            current == ClusterPhase::Idle
                && !status.any_node_under_upgrade()
                && status.operation.map_or(true, |k| k == kind)
                && nodes
                    .iter()
                    .filter_map(|n| status.node(n))
                    .any(|u| cluster_flag(kind, u))
        }
        Phase::Prep => current == ClusterPhase::Prep && status.operation == Some(kind),
        Phase::Main => current == ClusterPhase::Main && status.operation == Some(kind),
        Phase::Post => current == ClusterPhase::Post && status.operation == Some(kind),
        Phase::Recovery => current == ClusterPhase::Recovery && status.operation == Some(kind),
    }
}

fn cluster_transition(
    kind: ClusterOperationKind,
    nodes: &[String],
    phase: Phase,
    status: &mut SearchClusterStatus,
) {
    let reason = format!("{:?}", kind);
    match phase {
        Phase::Precheck => {
            status.operation = Some(kind);
            status.enter_cluster_phase(ClusterPhase::Prep, &reason);
        }
        Phase::Prep => status.enter_cluster_phase(ClusterPhase::Main, &reason),
        Phase::Main => status.enter_cluster_phase(ClusterPhase::Post, &reason),
        Phase::Post => status.enter_cluster_phase(ClusterPhase::Recovery, &reason),
        Phase::Recovery => {
            status.enter_cluster_phase(ClusterPhase::Idle, &reason);
            status.operation = None;
            for node in nodes {
                let upgrade = status.node_mut(node);
                match kind {
                    ClusterOperationKind::CertRestart => {
                        upgrade.scheduled_for_cert_redeploy = false
                    }
                    ClusterOperationKind::ConfigPush | ClusterOperationKind::VersionRestart => {
                        upgrade.scheduled_for_upgrade = false
                    }
                }
            }
        }
    }
}

fn node_guard(
    kind: NodeOperationKind,
    node: &str,
    phase: Phase,
    status: &SearchClusterStatus,
) -> bool {
    let upgrade = match status.node(node) {
        Some(u) => u,
        None => return false,
    };
    let held = upgrade.under_upgrade && upgrade.operation == Some(kind);
    match phase {
        Phase::Precheck => {
            !upgrade.under_upgrade
                && upgrade.is_scheduled_for(kind)
                && !status.any_node_under_upgrade()
                && status.cluster_phase() == ClusterPhase::Idle
        }
        Phase::Prep => {
            held && matches!(
                upgrade.upgrade_phase,
                UpgradePhase::Unset | UpgradePhase::ControllerUpdated
            )
        }
        Phase::Main => held && upgrade.upgrade_phase == UpgradePhase::PreparationComplete,
        Phase::Post => held && upgrade.upgrade_phase == UpgradePhase::NodeRestarting,
        Phase::Recovery => held && upgrade.upgrade_phase == UpgradePhase::RecoveringData,
    }
}

fn node_transition(
    kind: NodeOperationKind,
    node: &str,
    phase: Phase,
    status: &mut SearchClusterStatus,
) {
    let upgrade = status.node_mut(node);
    match phase {
        Phase::Precheck => {
            upgrade.under_upgrade = true;
            upgrade.operation = Some(kind);
        }
        Phase::Prep => upgrade.upgrade_phase = UpgradePhase::PreparationComplete,
        Phase::Main => upgrade.upgrade_phase = UpgradePhase::NodeRestarting,
        Phase::Post => upgrade.upgrade_phase = UpgradePhase::RecoveringData,
        Phase::Recovery => {
            upgrade.upgrade_phase = UpgradePhase::ControllerUpdated;
            upgrade.under_upgrade = false;
            upgrade.operation = None;
            match kind {
                NodeOperationKind::Restart => upgrade.scheduled_for_cert_redeploy = false,
                NodeOperationKind::Update => upgrade.scheduled_for_upgrade = false,
            }
        }
    }
}
