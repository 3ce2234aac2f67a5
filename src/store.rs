use crate::cluster::{SearchCluster, SearchClusterStatus};
use crate::errors::*;
use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::Client;
use log::{debug, warn};

/// Persisted state of one cluster's status sub-resource.
///
/// `update` is a read-modify-write: it reads the current status, applies
/// `mutate` to an owned copy and writes it back conditionally on the version
/// it read, re-reading and re-applying on conflict.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn read(&self) -> Result<SearchClusterStatus>;
    async fn update(
        &self,
        mutate: &(dyn for<'s> Fn(&'s mut SearchClusterStatus) + Send + Sync),
    ) -> Result<SearchClusterStatus>;
}

pub struct KubeStatusStore {
    api: Api<SearchCluster>,
    name: String,
    retries: u32,
}

impl KubeStatusStore {
    pub fn new(client: Client, namespace: &str, name: &str, retries: u32) -> Self {
        KubeStatusStore {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            retries,
        }
    }
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn read(&self) -> Result<SearchClusterStatus> {
        let sc = self.api.get_status(&self.name).await?;
        Ok(sc.status.unwrap_or_default())
    }

    async fn update(
        &self,
        mutate: &(dyn for<'s> Fn(&'s mut SearchClusterStatus) + Send + Sync),
    ) -> Result<SearchClusterStatus> {
        for attempt in 0..=self.retries {
            // resourceVersion from this read makes the replace conditional
            let mut sc = self.api.get_status(&self.name).await?;
            let mut status = sc.status.take().unwrap_or_default();
            mutate(&mut status);
            sc.status = Some(status);

            let data = serde_json::to_vec(&sc)?;
            match self
                .api
                .replace_status(&self.name, &PostParams::default(), data)
                .await
            {
                Ok(written) => {
                    debug!("status of {} written", self.name);
                    return Ok(written.status.unwrap_or_default());
                }
                Err(e) if is_conflict(&e) => {
                    warn!(
                        "status of {} changed underneath us (attempt {}), retrying",
                        self.name,
                        attempt + 1
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        bail!(ErrorKind::StatusConflict(self.name.clone()))
    }
}
