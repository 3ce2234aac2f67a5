use crate::errors::*;
use crate::resources::{CLUSTER_LABEL, NODE_LABEL};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};
use log::debug;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkloadKind {
    StatefulSet,
    Deployment,
}

/// The Kubernetes object backing one cluster member.
#[derive(Clone, Debug, PartialEq)]
pub enum Workload {
    StatefulSet(StatefulSet),
    Deployment(Deployment),
}

impl Workload {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::StatefulSet(_) => WorkloadKind::StatefulSet,
            Workload::Deployment(_) => WorkloadKind::Deployment,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Workload::StatefulSet(s) => s.name_any(),
            Workload::Deployment(d) => d.name_any(),
        }
    }

    /// Logical node name, from the node label.
    pub fn node_name(&self) -> Option<&str> {
        let labels = match self {
            Workload::StatefulSet(s) => s.labels(),
            Workload::Deployment(d) => d.labels(),
        };
        labels.get(NODE_LABEL).map(String::as_str)
    }

    pub fn replicas(&self) -> i32 {
        let replicas = match self {
            Workload::StatefulSet(s) => s.spec.as_ref().and_then(|s| s.replicas),
            Workload::Deployment(d) => d.spec.as_ref().and_then(|s| s.replicas),
        };
        replicas.unwrap_or(1)
    }

    pub fn set_replicas(&mut self, n: i32) {
        match self {
            Workload::StatefulSet(s) => {
                s.spec.get_or_insert_with(Default::default).replicas = Some(n)
            },
            Workload::Deployment(d) => {
                d.spec.get_or_insert_with(Default::default).replicas = Some(n)
            },
        }
    }

    pub fn template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Workload::StatefulSet(s) => s.spec.as_ref().map(|s| &s.template),
            Workload::Deployment(d) => d.spec.as_ref().map(|s| &s.template),
        }
    }

    pub fn set_template(&mut self, template: PodTemplateSpec) {
        match self {
            Workload::StatefulSet(s) => {
                s.spec.get_or_insert_with(Default::default).template = template
            }
            Workload::Deployment(d) => {
                d.spec.get_or_insert_with(Default::default).template = template
            }
        }
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        match self {
            Workload::StatefulSet(s) => s.annotations(),
            Workload::Deployment(d) => d.annotations(),
        }
    }

    pub fn annotations_mut(&mut self) -> &mut BTreeMap<String, String> {
        match self {
            Workload::StatefulSet(s) => s.annotations_mut(),
            Workload::Deployment(d) => d.annotations_mut(),
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().get(key).map(String::as_str)
    }
}

/// Read and write access to the workload records of one cluster.
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Workload>>;
    async fn get(&self, kind: WorkloadKind, name: &str) -> Result<Option<Workload>>;
    /// Writes the record back; rejected when it changed since it was read.
    async fn replace(&self, workload: &Workload) -> Result<Workload>;
    async fn create(&self, workload: &Workload) -> Result<Workload>;
}

pub struct KubeWorkloads {
    statefulsets: Api<StatefulSet>,
    deployments: Api<Deployment>,
    cluster: String,
}

impl KubeWorkloads {
    pub fn new(client: Client, namespace: &str, cluster: &str) -> Self {
        KubeWorkloads {
            statefulsets: Api::namespaced(client.clone(), namespace),
            deployments: Api::namespaced(client, namespace),
            cluster: cluster.to_string(),
        }
    }
}

#[async_trait]
impl WorkloadStore for KubeWorkloads {
    async fn list(&self) -> Result<Vec<Workload>> {
        let lp = ListParams::default().labels(&format!("{}={}", CLUSTER_LABEL, self.cluster));
        let mut out: Vec<Workload> = self
            .statefulsets
            .list(&lp)
            .await?
            .items
            .into_iter()
            .map(Workload::StatefulSet)
            .collect();
        out.extend(
            self.deployments
                .list(&lp)
                .await?
                .items
                .into_iter()
                .map(Workload::Deployment),
        );
        debug!("listed {} workloads for {}", out.len(), self.cluster);
        Ok(out)
    }

    async fn get(&self, kind: WorkloadKind, name: &str) -> Result<Option<Workload>> {
        Ok(match kind {
            WorkloadKind::StatefulSet => {
                self.statefulsets.get_opt(name).await?.map(Workload::StatefulSet)
            }
            WorkloadKind::Deployment => {
                self.deployments.get_opt(name).await?.map(Workload::Deployment)
            }
        })
    }

    async fn replace(&self, workload: &Workload) -> Result<Workload> {
        let pp = PostParams::default();
        Ok(match workload {
            Workload::StatefulSet(s) => {
                Workload::StatefulSet(self.statefulsets.replace(&s.name_any(), &pp, s).await?)
            }
            Workload::Deployment(d) => {
                Workload::Deployment(self.deployments.replace(&d.name_any(), &pp, d).await?)
            }
        })
    }

    async fn create(&self, workload: &Workload) -> Result<Workload> {
        let pp = PostParams::default();
        Ok(match workload {
            Workload::StatefulSet(s) => {
                Workload::StatefulSet(self.statefulsets.create(&pp, s).await?)
            }
            Workload::Deployment(d) => {
                Workload::Deployment(self.deployments.create(&pp, d).await?)
            }
        })
    }
}
