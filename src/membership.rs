use crate::errors::*;
use crate::resources::{CLUSTER_LABEL, NODE_LABEL};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberState {
    Ready,
    NotReady,
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Member {
    /// Logical node name the member belongs to.
    pub node: String,
    pub pod: String,
    pub state: MemberState,
}

/// Point-in-time view of which members are up, taken from live readiness
/// rather than from anything recorded in the cluster status.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MembershipSnapshot {
    pub members: Vec<Member>,
}

impl MembershipSnapshot {
    /// A failed member has already left.
    pub fn is_member(&self, node: &str) -> bool {
        self.members
            .iter()
            .any(|m| m.node == node && m.state != MemberState::Failed)
    }

    pub fn is_ready(&self, node: &str) -> bool {
        self.members
            .iter()
            .any(|m| m.node == node && m.state == MemberState::Ready)
    }

    pub fn any_ready(&self) -> bool {
        self.members.iter().any(|m| m.state == MemberState::Ready)
    }

    /// Nodes of `expected` with no ready member.
    pub fn not_ready<'a>(&self, expected: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        expected
            .into_iter()
            .filter(|n| !self.is_ready(n))
            .map(str::to_string)
            .collect()
    }

    /// Ready pods of the given nodes; a stateless node may have several.
    pub fn ready_members<'a>(&self, nodes: impl IntoIterator<Item = &'a str>) -> usize {
        let nodes: Vec<&str> = nodes.into_iter().collect();
        self.members
            .iter()
            .filter(|m| m.state == MemberState::Ready && nodes.contains(&m.node.as_str()))
            .count()
    }

    pub fn ready_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .members
            .iter()
            .filter(|m| m.state == MemberState::Ready)
            .map(|m| m.node.clone())
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }
}

#[async_trait]
pub trait Membership: Send + Sync {
    async fn snapshot(&self) -> Result<MembershipSnapshot>;
}

/// Membership read from the pods of one cluster.
pub struct PodMembership {
    api: Api<Pod>,
    cluster: String,
}

impl PodMembership {
    pub fn new(client: Client, namespace: &str, cluster: &str) -> Self {
        PodMembership {
            api: Api::namespaced(client, namespace),
            cluster: cluster.to_string(),
        }
    }
}

#[async_trait]
impl Membership for PodMembership {
    async fn snapshot(&self) -> Result<MembershipSnapshot> {
        let lp = ListParams::default().labels(&format!("{}={}", CLUSTER_LABEL, self.cluster));
        let members = self
            .api
            .list(&lp)
            .await?
            .items
            .iter()
            .filter_map(|pod| {
                let node = pod.labels().get(NODE_LABEL)?.clone();
                Some(Member {
                    node,
                    pod: pod.name_any(),
                    state: pod_state(pod),
                })
            })
            .collect();
        Ok(MembershipSnapshot { members })
    }
}

fn pod_state(pod: &Pod) -> MemberState {
    let status = match &pod.status {
        Some(s) => s,
        None => return MemberState::NotReady,
    };
    if status.phase.as_deref() == Some("Failed") {
        return MemberState::Failed;
    }
    if pod.metadata.deletion_timestamp.is_some() {
        return MemberState::NotReady;
    }
    let ready = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    if ready {
        MemberState::Ready
    } else {
        MemberState::NotReady
    }
}
