//! Node pod-lookup helpers

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;

use crate::kube_client::ClusterClient;
use crate::utils::pod::is_reschedulable;
use crate::Result;

/// Pods currently bound to the node, per the api-server bindings
pub async fn get_pods(client: &dyn ClusterClient, node: &Node) -> Result<Vec<Pod>> {
    client.list_pods_on_node(&node.name_any()).await
}

/// Pods bound to the node that would reschedule elsewhere if evicted
pub async fn get_reschedulable_pods(client: &dyn ClusterClient, node: &Node) -> Result<Vec<Pod>> {
    let pods = get_pods(client, node).await?;
    Ok(pods.into_iter().filter(is_reschedulable).collect())
}
