//! NodeClaim identity resolution and watch-event mapping
//!
//! Identity resolution pairs a NodeClaim with its realized Node by provider
//! id and defines the 0-match / many-match error conditions. The event
//! mapping functions translate a changed Pod, Node, or pool grouping into
//! the set of NodeClaims the reconcile queue must revisit; they fail open
//! to an empty set so a transient lookup failure never stalls the watch
//! pipeline.

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use tracing::debug;

use crate::crd::NodeClaim;
use crate::kube_client::ClusterClient;
use crate::{Error, Result};

/// All live Nodes matching the claim's resolved provider id
///
/// A claim whose provider id is still unresolved has no realized machine
/// yet: that is a normal state, returned as an empty result, never an error.
pub async fn nodes_for_nodeclaim(
    client: &dyn ClusterClient,
    claim: &NodeClaim,
) -> Result<Vec<Node>> {
    let provider_id = resolved_provider_id(claim);
    if provider_id.is_empty() {
        return Ok(Vec::new());
    }
    client.list_nodes_by_provider_id(provider_id).await
}

/// The single live Node realized from the claim
///
/// Fails with [`Error::NodeNotFound`] when no node matches and with
/// [`Error::DuplicateNode`] when more than one does. Duplicates signal an
/// inconsistent cluster and are never silently resolved by picking one.
pub async fn node_for_nodeclaim(client: &dyn ClusterClient, claim: &NodeClaim) -> Result<Node> {
    let provider_id = resolved_provider_id(claim).to_string();
    let mut nodes = nodes_for_nodeclaim(client, claim).await?;
    match nodes.len() {
        0 => Err(Error::NodeNotFound { provider_id }),
        1 => Ok(nodes.remove(0)),
        _ => Err(Error::DuplicateNode { provider_id }),
    }
}

fn resolved_provider_id(claim: &NodeClaim) -> &str {
    claim
        .status
        .as_ref()
        .map(|s| s.provider_id.as_str())
        .unwrap_or("")
}

/// NodeClaims affected by a change to the given pod
///
/// Maps the pod through its bound node's provider id. Fails open: any
/// lookup failure yields an empty set and a future reconcile retries.
pub async fn nodeclaims_for_pod(client: &dyn ClusterClient, pod: &Pod) -> Vec<String> {
    let Some(node_name) = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|name| !name.is_empty())
    else {
        return Vec::new();
    };
    let node = match client.get_node(node_name).await {
        Ok(Some(node)) => node,
        Ok(None) => return Vec::new(),
        Err(err) => {
            debug!(node = %node_name, error = %err, "failed to map pod to nodeclaims");
            return Vec::new();
        }
    };
    nodeclaims_for_node(client, &node).await
}

/// NodeClaims affected by a change to the given node
pub async fn nodeclaims_for_node(client: &dyn ClusterClient, node: &Node) -> Vec<String> {
    let Some(provider_id) = node
        .spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .filter(|id| !id.is_empty())
    else {
        return Vec::new();
    };
    match client.list_nodeclaims_by_provider_id(provider_id).await {
        Ok(claims) => claims.iter().map(|c| c.name_any()).collect(),
        Err(err) => {
            debug!(node = %node.name_any(), error = %err, "failed to map node to nodeclaims");
            Vec::new()
        }
    }
}

/// NodeClaims belonging to the given node pool, via the grouping label
pub async fn nodeclaims_for_pool(client: &dyn ClusterClient, pool: &str) -> Vec<String> {
    match client.list_nodeclaims_by_pool(pool).await {
        Ok(claims) => claims.iter().map(|c| c.name_any()).collect(),
        Err(err) => {
            debug!(pool = %pool, error = %err, "failed to map pool to nodeclaims");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeSpec, PodSpec};
    use kube::api::ObjectMeta;
    use mockall::predicate::eq;

    use crate::crd::{NodeClaimSpec, NodeClaimStatus};
    use crate::error::ignore_node_not_found;
    use crate::kube_client::MockClusterClient;

    fn claim(name: &str, provider_id: &str) -> NodeClaim {
        let mut claim = NodeClaim::new(name, NodeClaimSpec::default());
        claim.status = Some(NodeClaimStatus {
            provider_id: provider_id.to_string(),
            ..Default::default()
        });
        claim
    }

    fn node(name: &str, provider_id: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(provider_id.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unresolved_claim_maps_to_no_nodes_without_error() {
        // no list expectation: the lookup must not even be issued
        let client = MockClusterClient::new();
        let nodes = nodes_for_nodeclaim(&client, &claim("nc-1", "")).await.unwrap();
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn zero_matches_fail_with_node_not_found() {
        let mut client = MockClusterClient::new();
        client
            .expect_list_nodes_by_provider_id()
            .with(eq("pid-1"))
            .returning(|_| Ok(vec![]));

        let err = node_for_nodeclaim(&client, &claim("nc-1", "pid-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NodeNotFound { ref provider_id } if provider_id == "pid-1"
        ));
    }

    #[tokio::test]
    async fn duplicate_matches_fail_with_duplicate_node() {
        let mut client = MockClusterClient::new();
        client
            .expect_list_nodes_by_provider_id()
            .with(eq("pid-1"))
            .returning(|_| Ok(vec![node("node-a", "pid-1"), node("node-b", "pid-1")]));

        let err = node_for_nodeclaim(&client, &claim("nc-1", "pid-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateNode { ref provider_id } if provider_id == "pid-1"
        ));
    }

    #[tokio::test]
    async fn exactly_one_match_resolves() {
        let mut client = MockClusterClient::new();
        client
            .expect_list_nodes_by_provider_id()
            .with(eq("pid-1"))
            .returning(|_| Ok(vec![node("node-a", "pid-1")]));

        let resolved = node_for_nodeclaim(&client, &claim("nc-1", "pid-1"))
            .await
            .unwrap();
        assert_eq!(resolved.metadata.name.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn not_found_is_ignorable_while_machines_launch() {
        let mut client = MockClusterClient::new();
        client
            .expect_list_nodes_by_provider_id()
            .returning(|_| Ok(vec![]));

        let result = ignore_node_not_found(node_for_nodeclaim(&client, &claim("nc-1", "pid-1")).await);
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn pod_events_map_through_the_bound_node() {
        let mut client = MockClusterClient::new();
        client
            .expect_get_node()
            .with(eq("node-1"))
            .returning(|_| Ok(Some(node("node-1", "pid-1"))));
        client
            .expect_list_nodeclaims_by_provider_id()
            .with(eq("pid-1"))
            .returning(|_| Ok(vec![claim("nc-1", "pid-1")]));

        let pod = Pod {
            spec: Some(PodSpec {
                node_name: Some("node-1".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(nodeclaims_for_pod(&client, &pod).await, vec!["nc-1"]);

        // unbound pods map to nothing
        assert!(nodeclaims_for_pod(&client, &Pod::default()).await.is_empty());
    }

    #[tokio::test]
    async fn event_mapping_fails_open_on_lookup_errors() {
        let mut client = MockClusterClient::new();
        client.expect_list_nodeclaims_by_provider_id().returning(|_| {
            Err(Error::NodeNotFound {
                provider_id: "pid-1".into(),
            })
        });
        client
            .expect_list_nodeclaims_by_pool()
            .returning(|_| Err(Error::DuplicateNode { provider_id: "x".into() }));

        assert!(nodeclaims_for_node(&client, &node("node-1", "pid-1"))
            .await
            .is_empty());
        assert!(nodeclaims_for_pool(&client, "pool-a").await.is_empty());
    }
}
