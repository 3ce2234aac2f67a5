use k8s_openapi::api::core::v1::ResourceRequirements;
use kube_derive::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[kube(
    group = "pikach.us",
    version = "v1",
    kind = "SearchCluster",
    status = "SearchClusterStatus",
    shortname = "sc",
    schema = "disabled",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SearchClusterSpec {
    /// Search engine version, `major.minor.patch`.
    pub version: String,
    pub image: String,
    pub nodes: Vec<NodeSpec>,
    /// Settings rendered into every node's configuration.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Secret holding the node certificates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_secret: Option<String>,
    #[serde(default)]
    pub config_update_policy: UpdatePolicy,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub name: String,
    pub roles: Vec<NodeRole>,
    /// Replica count for nodes without the data role. Data nodes always run one replica.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

impl NodeSpec {
    pub fn is_data(&self) -> bool {
        self.roles.contains(&NodeRole::Data)
    }

    pub fn is_master(&self) -> bool {
        self.roles.contains(&NodeRole::Master)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Data,
    Client,
}

/// How a configuration change reaches the nodes.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum UpdatePolicy {
    /// One node at a time.
    #[default]
    Rolling,
    /// Every node at once, for changes nodes cannot run mixed.
    FullCluster,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchClusterStatus {
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    #[serde(default)]
    pub nodes: Vec<NodeStatus>,

    /// Cluster-wide operation in flight, set when it leaves precheck and cleared once it recovered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<ClusterOperationKind>,

    /// Version every node has been rolled to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConditionType {
    Restarting,
    UpdatingSettings,
    Recovering,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
}

impl From<bool> for ConditionStatus {
    fn from(b: bool) -> Self {
        if b {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    /// RFC 3339 timestamp of the last change of `status`.
    pub last_transition_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub name: String,
    #[serde(default)]
    pub upgrade_status: NodeUpgradeStatus,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpgradeStatus {
    #[serde(default)]
    pub under_upgrade: bool,
    #[serde(default)]
    pub upgrade_phase: UpgradePhase,
    #[serde(default)]
    pub scheduled_for_upgrade: bool,
    #[serde(default)]
    pub scheduled_for_cert_redeploy: bool,
    /// Node operation holding `under_upgrade`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<NodeOperationKind>,
}

impl NodeUpgradeStatus {
    pub fn is_scheduled_for(&self, kind: NodeOperationKind) -> bool {
        match kind {
            NodeOperationKind::Restart => self.scheduled_for_cert_redeploy,
            NodeOperationKind::Update => self.scheduled_for_upgrade,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum UpgradePhase {
    #[default]
    #[serde(rename = "")]
    Unset,
    PreparationComplete,
    NodeRestarting,
    RecoveringData,
    ControllerUpdated,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClusterOperationKind {
    ConfigPush,
    CertRestart,
    VersionRestart,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeOperationKind {
    Restart,
    Update,
}
