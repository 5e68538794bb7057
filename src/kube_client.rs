//! Kubernetes client seam for the state core
//!
//! All API-server access in this crate goes through [`ClusterClient`]. The
//! trait keeps the state logic testable (mocked in unit tests) while
//! [`ClusterClientImpl`] wraps a real [`kube::Client`] in production.
//!
//! Lookups here are exact-match only: by node name, by provider id, by pod
//! binding, by pool label. That is the entire query surface the state core
//! needs.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod, Taint};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::crd::NodeClaim;
use crate::Error;

/// Field manager name used for patches issued by the state core
const FIELD_MANAGER: &str = "stratus-state";

/// Trait abstracting the Kubernetes lookups and patches the state core issues
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a node by name, `None` if it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// All live nodes whose `spec.providerID` equals the given id
    async fn list_nodes_by_provider_id(&self, provider_id: &str) -> Result<Vec<Node>, Error>;

    /// All NodeClaims whose `status.providerID` equals the given id
    async fn list_nodeclaims_by_provider_id(
        &self,
        provider_id: &str,
    ) -> Result<Vec<NodeClaim>, Error>;

    /// All NodeClaims labeled as belonging to the given node pool
    async fn list_nodeclaims_by_pool(&self, pool: &str) -> Result<Vec<NodeClaim>, Error>;

    /// All pods bound to the named node
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, Error>;

    /// Fetch a persistent volume claim, `None` if it does not exist
    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// Merge-patch a node's full taint list
    ///
    /// Optimistic: conflict detection beyond the single object's
    /// resourceVersion is the API server's responsibility.
    async fn patch_node_taints(&self, name: &str, taints: &[Taint]) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct ClusterClientImpl {
    client: Client,
}

impl ClusterClientImpl {
    /// Create a new ClusterClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for ClusterClientImpl {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_nodes_by_provider_id(&self, provider_id: &str) -> Result<Vec<Node>, Error> {
        // The API server does not index nodes by spec.providerID, so this
        // filters a full list. Production deployments sit behind a watch
        // cache, which keeps this cheap.
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes
            .items
            .into_iter()
            .filter(|node| {
                node.spec
                    .as_ref()
                    .and_then(|s| s.provider_id.as_deref())
                    .is_some_and(|id| id == provider_id)
            })
            .collect())
    }

    async fn list_nodeclaims_by_provider_id(
        &self,
        provider_id: &str,
    ) -> Result<Vec<NodeClaim>, Error> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        let claims = api.list(&ListParams::default()).await?;
        Ok(claims
            .items
            .into_iter()
            .filter(|claim| {
                claim
                    .status
                    .as_ref()
                    .is_some_and(|s| s.provider_id == provider_id)
            })
            .collect())
    }

    async fn list_nodeclaims_by_pool(&self, pool: &str) -> Result<Vec<NodeClaim>, Error> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        let params =
            ListParams::default().labels(&format!("{}={}", crate::NODEPOOL_LABEL_KEY, pool));
        let claims = api.list(&params).await?;
        Ok(claims.items)
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        let pods = api.list(&params).await?;
        Ok(pods.items)
    }

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_node_taints(&self, name: &str, taints: &[Taint]) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "spec": {
                "taints": taints,
            }
        });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}
