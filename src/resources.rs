use crate::cluster::{NodeSpec, SearchCluster};
use crate::fingerprint::{Fingerprints, CERT_HASH, CONFIG_HASH, TEMPLATE_HASH};
use crate::workload::Workload;
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, StatefulSet, StatefulSetSpec,
    StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

pub const CLUSTER_LABEL: &str = "pikach.us/cluster";
pub const NODE_LABEL: &str = "pikach.us/node";

const CONFIG_FILE: &str = "search.yml";
const CONFIG_DIR: &str = "/usr/share/search/config";
const CERT_DIR: &str = "/usr/share/search/certs";

pub fn workload_name(cluster: &str, node: &str) -> String {
    format!("{}-{}", cluster, node)
}

pub fn config_map_name(cluster: &str) -> String {
    format!("{}-config", cluster)
}

fn labels(cluster: &str, node: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_LABEL.to_string(), cluster.to_string()),
        (NODE_LABEL.to_string(), node.to_string()),
    ])
}

fn metadata(sc: &SearchCluster, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: sc.namespace(),
        labels: Some(labels),
        owner_references: sc.controller_owner_ref(&()).map(|o| vec![o]),
        ..ObjectMeta::default()
    }
}

/// Rendered configuration shared by every node of the cluster.
pub fn config_map(sc: &SearchCluster) -> ConfigMap {
    let cluster = sc.name_any();
    let mut rendered = format!("cluster.name: {}\n", cluster);
    for (k, v) in &sc.spec.config {
        rendered.push_str(&format!("{}: {}\n", k, v));
    }
    ConfigMap {
        metadata: metadata(
            sc,
            config_map_name(&cluster),
            BTreeMap::from([(CLUSTER_LABEL.to_string(), cluster.clone())]),
        ),
        data: Some(BTreeMap::from([(CONFIG_FILE.to_string(), rendered)])),
        ..ConfigMap::default()
    }
}

pub fn pod_template(sc: &SearchCluster, node: &NodeSpec) -> PodTemplateSpec {
    let cluster = sc.name_any();
    let env = vec![
        env("NODE_NAME", &node.name),
        env("CLUSTER_NAME", &cluster),
        env("NODE_MASTER", &node.is_master().to_string()),
        env("NODE_DATA", &node.is_data().to_string()),
    ];

    let mut volumes = vec![Volume {
        name: "config".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(config_map_name(&cluster)),
            ..ConfigMapVolumeSource::default()
        }),
        ..Volume::default()
    }];
    let mut mounts = vec![VolumeMount {
        name: "config".to_string(),
        mount_path: CONFIG_DIR.to_string(),
        ..VolumeMount::default()
    }];
    if let Some(secret) = &sc.spec.cert_secret {
        volumes.push(Volume {
            name: "certs".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.clone()),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        });
        mounts.push(VolumeMount {
            name: "certs".to_string(),
            mount_path: CERT_DIR.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        });
    }

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels(&cluster, &node.name)),
            ..ObjectMeta::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "search".to_string(),
                image: Some(sc.spec.image.clone()),
                env: Some(env),
                ports: Some(vec![
                    port("http", 9200),
                    port("transport", 9300),
                ]),
                resources: node.resources.clone(),
                volume_mounts: Some(mounts),
                ..Container::default()
            }],
            volumes: Some(volumes),
            ..PodSpec::default()
        }),
    }
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..EnvVar::default()
    }
}

fn port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..ContainerPort::default()
    }
}

/// Writes the fingerprints a workload was last brought in line with.
pub fn stamp(workload: &mut Workload, fingerprints: &Fingerprints) {
    let annotations = workload.annotations_mut();
    annotations.insert(CONFIG_HASH.to_string(), fingerprints.config.clone());
    annotations.insert(CERT_HASH.to_string(), fingerprints.certs.clone());
    annotations.insert(TEMPLATE_HASH.to_string(), fingerprints.template.clone());
}

/// Workload to create for a node that has none yet: a single replica
/// StatefulSet for data nodes, a Deployment for everything else.
pub fn desired_workload(
    sc: &SearchCluster,
    node: &NodeSpec,
    template: PodTemplateSpec,
    fingerprints: &Fingerprints,
) -> Workload {
    let cluster = sc.name_any();
    let meta = metadata(sc, workload_name(&cluster, &node.name), labels(&cluster, &node.name));
    let selector = LabelSelector {
        match_labels: Some(labels(&cluster, &node.name)),
        ..LabelSelector::default()
    };

    let mut workload = if node.is_data() {
        Workload::StatefulSet(StatefulSet {
            metadata: meta,
            spec: Some(StatefulSetSpec {
                replicas: Some(1),
                service_name: format!("{}-cluster", cluster),
                selector,
                template,
                // pods are replaced by scaling, never by the statefulset controller
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("OnDelete".to_string()),
                    ..StatefulSetUpdateStrategy::default()
                }),
                ..StatefulSetSpec::default()
            }),
            ..StatefulSet::default()
        })
    } else {
        Workload::Deployment(Deployment {
            metadata: meta,
            spec: Some(DeploymentSpec {
                replicas: Some(node.replicas.unwrap_or(1)),
                selector,
                template,
                strategy: Some(DeploymentStrategy {
                    type_: Some("Recreate".to_string()),
                    ..DeploymentStrategy::default()
                }),
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        })
    };
    stamp(&mut workload, fingerprints);
    workload
}
