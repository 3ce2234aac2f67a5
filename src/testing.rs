//! In-memory cluster behind every capability trait, for tests.

use crate::cluster::{NodeRole, NodeSpec, SearchCluster, SearchClusterSpec, SearchClusterStatus};
use crate::config::OperatorConfig;
use crate::errors::*;
use crate::executor::OperationContext;
use crate::fingerprint::Fingerprints;
use crate::membership::{Member, MemberState, Membership, MembershipSnapshot};
use crate::node::{Desired, NodeHandle};
use crate::resources;
use crate::search::{AllocationMode, HealthStatus, SearchAdmin};
use crate::store::StatusStore;
use crate::workload::{Workload, WorkloadKind, WorkloadStore};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::ByteString;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

/// Side effects observed by the fake, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    ScaledDown(String),
    ScaledUp(String),
    Applied(String),
    Flush,
    Allocation(AllocationMode),
    MinMasters(i32),
}

struct State {
    sc: SearchCluster,
    certs: BTreeMap<String, ByteString>,
    health: HealthStatus,
    allocation: Option<AllocationMode>,
    transient: Option<AllocationMode>,
    refused: Vec<AllocationMode>,
    flush_fails: bool,
    min_masters: i32,
    /// keyed by node name
    workloads: BTreeMap<String, Workload>,
    /// Template the node's pods were started from. Writing a new template to
    /// the workload does not touch running pods; starting from zero does.
    running: BTreeMap<String, Option<PodTemplateSpec>>,
    starts: BTreeMap<String, u32>,
    node_count_lag: i32,
    lingering: BTreeSet<String>,
    held_down: BTreeSet<String>,
    status: SearchClusterStatus,
    events: Vec<Event>,
}

impl State {
    fn desired(&self, node: &str, image: Option<&str>) -> Desired {
        let mut sc = self.sc.clone();
        if let Some(image) = image {
            sc.spec.image = image.to_string();
        }
        let spec = sc
            .spec
            .nodes
            .iter()
            .find(|n| n.name == node)
            .unwrap_or_else(|| panic!("no node {}", node));
        let template = resources::pod_template(&sc, spec);
        let config = resources::config_map(&sc).data.unwrap_or_default();
        Desired {
            fingerprints: Fingerprints::new(&config, Some(&self.certs), &template),
            template,
            replicas: spec.replicas.unwrap_or(1),
        }
    }

    fn add_node(&mut self, spec: NodeSpec) {
        self.sc.spec.nodes.push(spec.clone());
        let desired = self.desired(&spec.name, None);
        let workload =
            resources::desired_workload(&self.sc, &spec, desired.template, &desired.fingerprints);
        self.insert(spec.name, workload);
    }

    fn insert(&mut self, node: String, workload: Workload) {
        if workload.replicas() > 0 {
            self.running.insert(node.clone(), workload.template().cloned());
        }
        self.workloads.insert(node, workload);
    }

    fn handle(&self, node: &str, image: Option<&str>) -> NodeHandle {
        let record = self
            .workloads
            .get(node)
            .cloned()
            .unwrap_or_else(|| panic!("no workload for {}", node));
        NodeHandle::new(record, self.desired(node, image)).unwrap()
    }
}

pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    /// Healthy cluster of master and data eligible nodes, each running what it should.
    pub fn with_data_nodes(cluster: &str, nodes: &[&str]) -> Self {
        let mut sc = SearchCluster::new(
            cluster,
            SearchClusterSpec {
                version: "6.8.1".to_string(),
                image: "search:6.8.1".to_string(),
                cert_secret: Some(format!("{}-certs", cluster)),
                ..SearchClusterSpec::default()
            },
        );
        sc.metadata.namespace = Some("search".to_string());
        let mut state = State {
            sc,
            certs: BTreeMap::from([("node.pem".to_string(), ByteString(b"v1".to_vec()))]),
            health: HealthStatus::Green,
            allocation: None,
            transient: None,
            refused: Vec::new(),
            flush_fails: false,
            min_masters: 0,
            workloads: BTreeMap::new(),
            running: BTreeMap::new(),
            starts: BTreeMap::new(),
            node_count_lag: 0,
            lingering: BTreeSet::new(),
            held_down: BTreeSet::new(),
            status: SearchClusterStatus::default(),
            events: Vec::new(),
        };
        for node in nodes {
            state.add_node(NodeSpec {
                name: node.to_string(),
                roles: vec![NodeRole::Master, NodeRole::Data],
                ..NodeSpec::default()
            });
        }
        FakeCluster {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_stateless(&self, node: &str, replicas: i32) {
        self.state().add_node(NodeSpec {
            name: node.to_string(),
            roles: vec![NodeRole::Client],
            replicas: Some(replicas),
            ..NodeSpec::default()
        });
    }

    pub fn cluster(&self) -> SearchCluster {
        self.state().sc.clone()
    }

    pub fn handle(&self, node: &str) -> NodeHandle {
        self.state().handle(node, None)
    }

    pub fn handles(&self) -> Vec<NodeHandle> {
        let state = self.state();
        state.workloads.keys().map(|n| state.handle(n, None)).collect()
    }

    /// Handle whose desired template runs `image`.
    pub fn handle_with_image(&self, node: &str, image: &str) -> NodeHandle {
        self.state().handle(node, Some(image))
    }

    pub fn handles_with_image(&self, image: &str) -> Vec<NodeHandle> {
        let state = self.state();
        state
            .workloads
            .keys()
            .map(|n| state.handle(n, Some(image)))
            .collect()
    }

    pub fn replicas(&self, node: &str) -> i32 {
        self.state().workloads[node].replicas()
    }

    /// Changes replicas behind the orchestrator's back; records no event.
    pub fn set_replicas(&self, node: &str, replicas: i32) {
        if let Some(w) = self.state().workloads.get_mut(node) {
            w.set_replicas(replicas);
        }
    }

    pub fn image(&self, node: &str) -> Option<String> {
        self.state().workloads[node]
            .template()
            .and_then(|t| t.spec.as_ref())
            .and_then(|s| s.containers.first())
            .and_then(|c| c.image.clone())
    }

    /// Image the node's pods were last started with.
    pub fn running_image(&self, node: &str) -> Option<String> {
        self.state()
            .running
            .get(node)
            .cloned()
            .flatten()
            .and_then(|t| t.spec)
            .and_then(|s| s.containers.into_iter().next())
            .and_then(|c| c.image)
    }

    /// Times the node was started from zero replicas.
    pub fn starts(&self, node: &str) -> u32 {
        self.state().starts.get(node).copied().unwrap_or(0)
    }

    /// The cluster counts `n` fewer nodes than have ready pods.
    pub fn lag_node_count(&self, n: i32) {
        self.state().node_count_lag = n;
    }

    /// A transient allocation setting an operator left behind.
    pub fn override_allocation(&self, mode: AllocationMode) {
        self.state().transient = Some(mode);
    }

    pub fn remove_workload(&self, node: &str) {
        self.state().workloads.remove(node);
    }

    pub fn certs(&self) -> BTreeMap<String, ByteString> {
        self.state().certs.clone()
    }

    pub fn rotate_certs(&self) {
        self.state()
            .certs
            .insert("node.pem".to_string(), ByteString(b"v2".to_vec()));
    }

    pub fn set_health(&self, health: HealthStatus) {
        self.state().health = health;
    }

    /// The cluster stops acknowledging `mode`.
    pub fn refuse_allocation(&self, mode: AllocationMode) {
        self.state().refused.push(mode);
    }

    pub fn accept_allocation(&self) {
        self.state().refused.clear();
    }

    pub fn fail_flush(&self) {
        self.state().flush_fails = true;
    }

    /// A scaled down node stays listed as a not ready member.
    pub fn linger(&self, node: &str) {
        self.state().lingering.insert(node.to_string());
    }

    /// A running node never becomes ready.
    pub fn hold_down(&self, node: &str) {
        self.state().held_down.insert(node.to_string());
    }

    pub fn release(&self, node: &str) {
        self.state().held_down.remove(node);
    }

    pub fn allocation(&self) -> Option<AllocationMode> {
        self.state().allocation
    }

    pub fn transient_allocation(&self) -> Option<AllocationMode> {
        self.state().transient
    }

    pub fn min_masters(&self) -> i32 {
        self.state().min_masters
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn update_status(&self, f: impl FnOnce(&mut SearchClusterStatus)) {
        f(&mut self.state().status);
    }

    pub fn status(&self) -> SearchClusterStatus {
        self.state().status.clone()
    }

    pub fn context<'a>(&'a self, config: &'a OperatorConfig) -> OperationContext<'a> {
        OperationContext::new(self, self, self, self, config)
    }
}

#[async_trait]
impl SearchAdmin for FakeCluster {
    async fn health_status(&self) -> Result<HealthStatus> {
        Ok(self.state().health)
    }

    async fn set_shard_allocation(&self, mode: AllocationMode) -> Result<bool> {
        let mut state = self.state();
        if state.refused.contains(&mode) {
            return Ok(false);
        }
        state.allocation = Some(mode);
        state.events.push(Event::Allocation(mode));
        Ok(true)
    }

    async fn clear_shard_allocation(&self) -> Result<bool> {
        self.state().transient = None;
        Ok(true)
    }

    async fn synchronized_flush(&self) -> Result<bool> {
        let mut state = self.state();
        if state.flush_fails {
            bail!(ErrorKind::AdminStatus(409, "flush in progress".to_string()));
        }
        state.events.push(Event::Flush);
        Ok(true)
    }

    async fn node_count(&self) -> Result<i32> {
        let snapshot = self.snapshot().await?;
        let ready = snapshot
            .members
            .iter()
            .filter(|m| m.state == MemberState::Ready)
            .count() as i32;
        Ok(ready - self.state().node_count_lag)
    }

    async fn min_master_nodes(&self) -> Result<i32> {
        Ok(self.state().min_masters)
    }

    async fn set_min_master_nodes(&self, n: i32) -> Result<bool> {
        let mut state = self.state();
        state.min_masters = n;
        state.events.push(Event::MinMasters(n));
        Ok(true)
    }
}

#[async_trait]
impl Membership for FakeCluster {
    async fn snapshot(&self) -> Result<MembershipSnapshot> {
        let state = self.state();
        let mut members = Vec::new();
        for (node, workload) in &state.workloads {
            let replicas = workload.replicas();
            let state_of = if replicas == 0 {
                if !state.lingering.contains(node) {
                    continue;
                }
                MemberState::NotReady
            } else if state.held_down.contains(node) {
                MemberState::NotReady
            } else {
                MemberState::Ready
            };
            for i in 0..replicas.max(1) {
                members.push(Member {
                    node: node.clone(),
                    pod: format!("{}-{}", workload.name(), i),
                    state: state_of,
                });
            }
        }
        Ok(MembershipSnapshot { members })
    }
}

#[async_trait]
impl WorkloadStore for FakeCluster {
    async fn list(&self) -> Result<Vec<Workload>> {
        Ok(self.state().workloads.values().cloned().collect())
    }

    async fn get(&self, kind: WorkloadKind, name: &str) -> Result<Option<Workload>> {
        Ok(self
            .state()
            .workloads
            .values()
            .find(|w| w.kind() == kind && w.name() == name)
            .cloned())
    }

    async fn replace(&self, workload: &Workload) -> Result<Workload> {
        let node = match workload.node_name() {
            Some(n) => n.to_string(),
            None => bail!(ErrorKind::WorkloadMissing(workload.name())),
        };
        let mut state = self.state();
        let old = match state.workloads.get(&node) {
            Some(w) => w.clone(),
            None => bail!(ErrorKind::WorkloadMissing(workload.name())),
        };
        if old.replicas() > 0 && workload.replicas() == 0 {
            state.events.push(Event::ScaledDown(node.clone()));
        }
        if old.replicas() == 0 && workload.replicas() > 0 {
            state.events.push(Event::ScaledUp(node.clone()));
            state.running.insert(node.clone(), workload.template().cloned());
            *state.starts.entry(node.clone()).or_default() += 1;
        }
        if old.template() != workload.template() {
            state.events.push(Event::Applied(node.clone()));
        }
        state.workloads.insert(node, workload.clone());
        Ok(workload.clone())
    }

    async fn create(&self, workload: &Workload) -> Result<Workload> {
        let node = match workload.node_name() {
            Some(n) => n.to_string(),
            None => bail!(ErrorKind::InvalidOperation(format!(
                "{} has no node label",
                workload.name()
            ))),
        };
        self.state().insert(node, workload.clone());
        Ok(workload.clone())
    }
}

#[async_trait]
impl StatusStore for FakeCluster {
    async fn read(&self) -> Result<SearchClusterStatus> {
        Ok(self.state().status.clone())
    }

    async fn update(
        &self,
        mutate: &(dyn for<'s> Fn(&'s mut SearchClusterStatus) + Send + Sync),
    ) -> Result<SearchClusterStatus> {
        let mut state = self.state();
        mutate(&mut state.status);
        Ok(state.status.clone())
    }
}
