use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};
use k8s_openapi::ByteString;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const CONFIG_HASH: &str = "pikach.us/config-hash";
pub const CERT_HASH: &str = "pikach.us/cert-hash";
pub const TEMPLATE_HASH: &str = "pikach.us/template-hash";

/// Content hashes a workload is compared against to detect drift.
///
/// They are persisted as annotations and compared across operator builds, so
/// each is a SHA-256 over canonical JSON rather than anything seeded or
/// toolchain dependent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fingerprints {
    pub config: String,
    pub certs: String,
    pub template: String,
}

impl Fingerprints {
    pub fn new(
        config: &BTreeMap<String, String>,
        certs: Option<&BTreeMap<String, ByteString>>,
        template: &PodTemplateSpec,
    ) -> Self {
        Fingerprints {
            config: checksum(&json!(config)),
            certs: certs.map(|c| checksum(&json!(c))).unwrap_or_default(),
            template: checksum(&pod_shape(template)),
        }
    }
}

/// serde_json keeps object keys sorted, so equal values print identically.
fn checksum(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The parts of a pod template that need the pod restarted when they change.
pub fn pod_shape(template: &PodTemplateSpec) -> Value {
    let meta = template.metadata.as_ref();
    let spec = template.spec.as_ref();
    json!({
        "labels": meta.and_then(|m| m.labels.as_ref()),
        "annotations": meta.and_then(|m| m.annotations.as_ref()),
        "initContainers": spec
            .and_then(|s| s.init_containers.as_ref())
            .map(|cs| cs.iter().map(container_shape).collect::<Vec<_>>()),
        "containers": spec.map(|s| s.containers.iter().map(container_shape).collect::<Vec<_>>()),
        "nodeSelector": spec.and_then(|s| s.node_selector.as_ref()),
        "serviceAccountName": spec.and_then(|s| s.service_account_name.as_ref()),
        "volumes": spec.and_then(|s| s.volumes.as_ref()).map(|vs| {
            vs.iter()
                .map(|v| json!({
                    "name": v.name,
                    "configMap": v.config_map.as_ref().and_then(|c| c.name.as_ref()),
                    "secret": v.secret.as_ref().and_then(|s| s.secret_name.as_ref()),
                }))
                .collect::<Vec<_>>()
        }),
    })
}

fn container_shape(c: &Container) -> Value {
    json!({
        "name": c.name,
        "image": c.image,
        "command": c.command,
        "args": c.args,
        "env": c.env.as_ref().map(|env| {
            env.iter()
                .map(|e| json!({"name": e.name, "value": e.value}))
                .collect::<Vec<_>>()
        }),
        "limits": c.resources.as_ref().and_then(|r| r.limits.as_ref()),
        "requests": c.resources.as_ref().and_then(|r| r.requests.as_ref()),
        "volumeMounts": c.volume_mounts.as_ref().map(|ms| {
            ms.iter()
                .map(|m| json!({"name": m.name, "mountPath": m.mount_path}))
                .collect::<Vec<_>>()
        }),
    })
}
