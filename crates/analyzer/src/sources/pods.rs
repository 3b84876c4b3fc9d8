//! Kubernetes pod listing.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::debug;

use super::PodSource;
use crate::target::ResolvedTarget;

/// Lists pods through the cluster API using the target's label selector.
#[derive(Clone)]
pub struct KubePodSource {
    client: Client,
}

impl KubePodSource {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster config or the local kubeconfig.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;
        Ok(Self::new(client))
    }
}

/// Stands in for [`KubePodSource`] when no cluster client could be built,
/// so the resources section degrades instead of the whole run failing.
#[derive(Debug, Clone)]
pub struct UnavailablePodSource {
    reason: String,
}

impl UnavailablePodSource {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl PodSource for UnavailablePodSource {
    async fn list_pods(&self, _target: &ResolvedTarget) -> Result<Vec<Pod>> {
        Err(anyhow!("{}", self.reason))
    }
}

#[async_trait]
impl PodSource for KubePodSource {
    async fn list_pods(&self, target: &ResolvedTarget) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let params = ListParams::default().labels(&target.label_selector);

        let list = pods.list(&params).await.with_context(|| {
            format!(
                "Failed to list pods in {} with selector {}",
                target.namespace, target.label_selector
            )
        })?;

        debug!(
            namespace = %target.namespace,
            selector = %target.label_selector,
            count = list.items.len(),
            "Listed target pods"
        );

        let mut items = list.items;
        items.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(items)
    }
}
