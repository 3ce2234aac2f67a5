use crate::catalog::OperationBuilder;
use crate::cluster::{
    ClusterOperationKind, NodeOperationKind, SearchCluster, SearchClusterStatus, UpdatePolicy,
};
use crate::config::OperatorConfig;
use crate::errors::*;
use crate::executor::OperationContext;
use crate::fingerprint::Fingerprints;
use crate::membership::PodMembership;
use crate::node::{Desired, NodeHandle};
use crate::resources;
use crate::search::HttpSearchAdmin;
use crate::state::ClusterPhase;
use crate::store::KubeStatusStore;
use crate::workload::{KubeWorkloads, Workload, WorkloadStore};
use futures::{future::BoxFuture, FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::ByteString;
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    ResourceExt,
};
use kube_runtime::controller::{Action, Controller};
use kube_runtime::watcher;
use log::{debug, info, trace, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const CRD_NAME: &str = "searchclusters.pikach.us";
const FIELD_MANAGER: &str = "shardwise";

// Context for our reconciler
struct Data {
    /// kubernetes client
    client: Client,
    config: OperatorConfig,
}

/// What a pass sets out to do, decided from persisted status alone.
#[derive(Clone, Debug, PartialEq)]
pub enum Plan {
    Idle,
    Cluster(ClusterOperationKind),
    /// Targets in order; a node already under upgrade comes first.
    Rolling(NodeOperationKind, Vec<String>),
}

fn major(version: &str) -> Option<u32> {
    version.split('.').next()?.parse().ok()
}

/// Nodes of different major versions cannot form one cluster.
fn major_version_change(from: Option<&str>, to: &str) -> bool {
    match (from.and_then(major), major(to)) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    }
}

/// Picks the operation for this pass. An operation already in flight always
/// wins; otherwise certificate rotation goes before upgrades.
pub fn plan(sc: &SearchCluster, status: &SearchClusterStatus, nodes: &[String]) -> Plan {
    if let Some(kind) = status.operation {
        return Plan::Cluster(kind);
    }
    let scheduled = |kind: NodeOperationKind| -> Vec<String> {
        nodes
            .iter()
            .filter(|n| status.node(n).map_or(false, |u| u.is_scheduled_for(kind)))
            .cloned()
            .collect()
    };

    if let Some((node, Some(kind))) = status.node_in_flight() {
        let mut targets = vec![node.to_string()];
        targets.extend(scheduled(kind).into_iter().filter(|n| n != node));
        return Plan::Rolling(kind, targets);
    }

    let certs = scheduled(NodeOperationKind::Restart);
    if !certs.is_empty() {
        if certs.len() == nodes.len() {
            return Plan::Cluster(ClusterOperationKind::CertRestart);
        }
        return Plan::Rolling(NodeOperationKind::Restart, certs);
    }

    let upgrades = scheduled(NodeOperationKind::Update);
    if upgrades.is_empty() {
        Plan::Idle
    } else if major_version_change(status.version.as_deref(), &sc.spec.version) {
        Plan::Cluster(ClusterOperationKind::VersionRestart)
    } else if sc.spec.config_update_policy == UpdatePolicy::FullCluster {
        Plan::Cluster(ClusterOperationKind::ConfigPush)
    } else {
        Plan::Rolling(NodeOperationKind::Update, upgrades)
    }
}

/// Raises the schedule flags of drifted nodes and makes sure every node has
/// an entry. Flags are never lowered here; the operations do that. Entries of
/// nodes no longer declared are dropped, along with any operation they held.
fn schedule(handles: &[NodeHandle], status: &mut SearchClusterStatus) -> bool {
    let declared = |name: &str| handles.iter().any(|h| h.name() == name);
    let before = status.nodes.len();
    status.nodes.retain(|n| declared(n.name.as_str()));
    let mut changed = status.nodes.len() != before;
    for h in handles {
        changed |= status.node(h.name()).is_none();
        let upgrade = status.node_mut(h.name());
        if h.needs_cert_redeploy() && !upgrade.scheduled_for_cert_redeploy {
            upgrade.scheduled_for_cert_redeploy = true;
            changed = true;
        }
        if h.needs_upgrade() && !upgrade.scheduled_for_upgrade {
            upgrade.scheduled_for_upgrade = true;
            changed = true;
        }
    }
    changed
}

/// Nothing in flight and nothing waiting.
fn settled(status: &SearchClusterStatus) -> bool {
    status.operation.is_none()
        && status.cluster_phase() == ClusterPhase::Idle
        && status.nodes.iter().all(|n| {
            let u = &n.upgrade_status;
            !u.under_upgrade && !u.scheduled_for_upgrade && !u.scheduled_for_cert_redeploy
        })
}

/// Creates the workloads of declared nodes that have none, and pairs every
/// declared node with its record and what it should look like.
async fn node_handles(
    sc: &SearchCluster,
    config: &BTreeMap<String, String>,
    certs: Option<&BTreeMap<String, ByteString>>,
    store: &dyn WorkloadStore,
) -> Result<Vec<NodeHandle>> {
    let mut existing: BTreeMap<String, Workload> = store
        .list()
        .await?
        .into_iter()
        .filter_map(|w| Some((w.node_name()?.to_string(), w)))
        .collect();

    let mut handles = Vec::with_capacity(sc.spec.nodes.len());
    for node in &sc.spec.nodes {
        let template = resources::pod_template(sc, node);
        let fingerprints = Fingerprints::new(config, certs, &template);
        let record = match existing.remove(&node.name) {
            Some(w) => w,
            None => {
                let w = resources::desired_workload(sc, node, template.clone(), &fingerprints);
                info!("creating {} for node {}", w.name(), node.name);
                store.create(&w).await?
            }
        };
        let desired = Desired {
            template,
            fingerprints,
            replicas: node.replicas.unwrap_or(1),
        };
        match NodeHandle::new(record, desired) {
            Some(h) => handles.push(h),
            None => bail!(ErrorKind::InvalidOperation(format!(
                "workload of {} lost its node label",
                node.name
            ))),
        }
    }
    for orphan in existing.keys() {
        debug!("{} is not declared, leaving its workload alone", orphan);
    }
    Ok(handles)
}

/// One pass over a cluster whose config map is in place: schedule drifted
/// nodes, run whatever operation is due, and record the version once
/// nothing is left to do.
pub async fn drive(
    sc: &SearchCluster,
    config: &BTreeMap<String, String>,
    certs: Option<&BTreeMap<String, ByteString>>,
    ctx: &OperationContext<'_>,
) -> Result<Plan> {
    let name = sc.name_any();
    let handles = node_handles(sc, config, certs, ctx.workloads).await?;

    let mut status = ctx.store.read().await?;
    if schedule(&handles, &mut status.clone()) {
        status = ctx
            .store
            .update(&|s: &mut SearchClusterStatus| {
                schedule(&handles, s);
            })
            .await?;
    }

    let names: Vec<String> = handles.iter().map(|h| h.name().to_string()).collect();
    let masters = sc
        .spec
        .nodes
        .iter()
        .filter(|n| n.is_master())
        .map(|n| n.name.clone())
        .collect();
    let planned = plan(sc, &status, &names);
    trace!("{}: {:?}", name, planned);

    let builder = OperationBuilder::new(name.clone()).nodes(handles).masters(masters);
    let outcomes = match &planned {
        Plan::Idle => Vec::new(),
        Plan::Cluster(kind) => vec![builder.cluster_operation(*kind)?.execute(ctx).await?],
        Plan::Rolling(kind, targets) => builder.rolling(*kind, targets)?.execute(ctx).await?,
    };

    let skipped: u32 = outcomes.iter().map(|o| o.skipped_safety_steps).sum();
    if skipped > 0 {
        warn!("{}: {} best-effort safety steps were skipped", name, skipped);
    }
    if let Some(last) = outcomes.last() {
        status = last.status.clone();
    }

    if settled(&status) && status.version.as_deref() != Some(sc.spec.version.as_str()) {
        let version = sc.spec.version.clone();
        ctx.store
            .update(&|s: &mut SearchClusterStatus| s.version = Some(version.clone()))
            .await?;
        info!("{} runs version {}", name, version);
    }
    Ok(planned)
}

async fn reconcile(sc: Arc<SearchCluster>, ctx: Arc<Data>) -> Result<Action> {
    let client = ctx.client.clone();
    let config = &ctx.config;
    let name = sc.name_any();
    let ns = sc
        .namespace()
        .ok_or_else(|| ErrorKind::InvalidOperation(format!("{} is not namespaced", name)))?;
    debug!("reconciling {}/{}", ns, name);

    let config_map = resources::config_map(&sc);
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &ns);
    config_maps
        .patch(
            &resources::config_map_name(&name),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&config_map),
        )
        .await?;

    let certs = match &sc.spec.cert_secret {
        Some(secret) => {
            let secrets: Api<Secret> = Api::namespaced(client.clone(), &ns);
            match secrets.get_opt(secret).await? {
                Some(s) => s.data,
                None => {
                    warn!("{}: cert secret {} does not exist yet", name, secret);
                    None
                }
            }
        }
        None => None,
    };

    let admin = HttpSearchAdmin::new(&config.admin, &name, &ns)?;
    let membership = PodMembership::new(client.clone(), &ns, &name);
    let workloads = KubeWorkloads::new(client.clone(), &ns, &name);
    let store = KubeStatusStore::new(client, &ns, &name, config.status_conflict_retries);
    let op_ctx = OperationContext::new(&admin, &membership, &workloads, &store, config);

    let rendered = config_map.data.unwrap_or_default();
    match drive(&sc, &rendered, certs.as_ref(), &op_ctx).await? {
        Plan::Idle => debug!("{}/{} is up to date", ns, name),
        planned => info!("{}/{}: pass of {:?} finished", ns, name, planned),
    }

    Ok(Action::requeue(Duration::from_secs(config.requeue_secs)))
}

fn error_policy(sc: Arc<SearchCluster>, error: &Error, ctx: Arc<Data>) -> Action {
    let secs = if error.is_retryable() {
        ctx.config.retry_requeue_secs
    } else {
        ctx.config.error_requeue_secs
    };
    warn!("reconciling {} failed, retrying in {}s: {}", sc.name_any(), secs, error);
    Action::requeue(Duration::from_secs(secs))
}

pub struct Manager {}

/// Manager that owns a Controller for SearchCluster
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives a `Controller` + a future to be awaited
    /// It is up to `main` to wait for the controller stream.
    pub async fn new(
        client: Client,
        config: OperatorConfig,
    ) -> Result<(Self, BoxFuture<'static, ()>)> {
        let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
        crds.get(CRD_NAME)
            .await
            .chain_err(|| format!("install the {} crd first", CRD_NAME))?;

        let context = Arc::new(Data {
            client: client.clone(),
            config,
        });
        let clusters = Api::<SearchCluster>::all(client.clone());
        let statefulsets = Api::<StatefulSet>::all(client.clone());
        let deployments = Api::<Deployment>::all(client);

        let drainer = Controller::new(clusters, watcher::Config::default())
            .owns(statefulsets, watcher::Config::default())
            .owns(deployments, watcher::Config::default())
            .run(reconcile, error_policy, context)
            .for_each(|res| {
                match res {
                    Ok((obj, action)) => debug!("reconciled {}: {:?}", obj.name, action),
                    Err(e) => warn!("reconcile failed: {}", e),
                }
                futures::future::ready(())
            })
            .boxed();
        // what we do with the controller stream from .run() ^^ does not matter
        // but we do need to consume it, hence logging + return future

        Ok((Self {}, drainer))
    }
}
