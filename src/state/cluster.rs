//! The cluster-state arena
//!
//! [`ClusterState`] owns the canonical mapping from identity key to
//! [`StateNode`], with a lock alongside each value. Reconcile workers for
//! the Node, NodeClaim, and Pod watch streams mutate it concurrently;
//! consumers take snapshots.
//!
//! Lock order: the arena lock is always taken before a per-node lock, and a
//! per-node lock is never held while re-acquiring the arena lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument};

use crate::crd::NodeClaim;
use crate::kube_client::ClusterClient;
use crate::options::Options;
use crate::state::statenode::{StateNode, StateNodes};
use crate::utils::pod::PodKey;
use crate::Result;

/// The identity key correlating a machine across rebuilds and joining its
/// Node/NodeClaim pair: the provider id when resolved, else the object name
fn identity_key(provider_id: Option<&str>, name: &str) -> String {
    match provider_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => name.to_string(),
    }
}

type SharedStateNode = Arc<Mutex<StateNode>>;

#[derive(Default)]
struct Arena {
    nodes: HashMap<String, SharedStateNode>,
    node_name_to_key: HashMap<String, String>,
    claim_name_to_key: HashMap<String, String>,
    pod_bindings: HashMap<PodKey, String>,
}

impl Arena {
    /// Move an entry to a new identity key, folding it into any entry
    /// already living there so pod ledgers and deletion/nomination flags
    /// survive a join
    async fn re_key(&mut self, old_key: &str, key: &str) {
        let Some(old_entry) = self.nodes.remove(old_key) else {
            return;
        };
        let carried = old_entry.lock().await.clone();
        if let Some(existing) = self.nodes.get(key).cloned() {
            existing.lock().await.absorb(carried);
        } else {
            self.nodes
                .insert(key.to_string(), Arc::new(Mutex::new(carried)));
        }
        for bound in self.pod_bindings.values_mut() {
            if bound.as_str() == old_key {
                *bound = key.to_string();
            }
        }
    }

    /// Drop the entry if neither underlying object remains
    async fn prune(&mut self, key: &str) {
        let empty = match self.nodes.get(key) {
            Some(entry) => {
                let state = entry.lock().await;
                !state.has_node() && state.node_claim().is_none()
            }
            None => return,
        };
        if empty {
            self.nodes.remove(key);
            self.pod_bindings.retain(|_, bound| bound != key);
        }
    }
}

/// Concurrent, identity-keyed store of every known [`StateNode`]
///
/// Safe to discard and rebuild at any time: it is a pure projection of watch
/// events, persisting nothing itself.
pub struct ClusterState {
    options: Options,
    arena: RwLock<Arena>,
}

impl ClusterState {
    /// Create an empty cluster state
    pub fn new(options: Options) -> Self {
        Self {
            options,
            arena: RwLock::new(Arena::default()),
        }
    }

    /// Record an observed Node, creating or updating its machine's state
    #[instrument(skip_all, fields(node = %node.name_any()))]
    pub async fn update_node(&self, node: &Node) {
        let name = node.name_any();
        let provider_id = node.spec.as_ref().and_then(|s| s.provider_id.as_deref());
        let key = identity_key(provider_id, &name);

        let mut arena = self.arena.write().await;

        // A node that resolves its provider id moves to a new identity key;
        // carry its accumulated state across.
        if let Some(old_key) = arena.node_name_to_key.get(&name).cloned() {
            if old_key != key {
                debug!(from = %old_key, to = %key, "re-keying node state");
                arena.re_key(&old_key, &key).await;
            }
        }

        let entry = arena
            .nodes
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(StateNode::from_node(node.clone()))))
            .clone();
        arena.node_name_to_key.insert(name, key);
        drop(arena);

        entry.lock().await.set_node(node.clone());
    }

    /// Record an observed NodeClaim, joining it to any Node sharing its key
    #[instrument(skip_all, fields(nodeclaim = %claim.name_any()))]
    pub async fn update_nodeclaim(&self, claim: &NodeClaim) {
        let name = claim.name_any();
        let provider_id = claim.status.as_ref().map(|s| s.provider_id.as_str());
        let key = identity_key(provider_id, &name);

        let mut arena = self.arena.write().await;

        // A claim that resolves its provider id moves from its name key to
        // the provider-id key, merging with a node-only entry if one exists.
        if let Some(old_key) = arena.claim_name_to_key.get(&name).cloned() {
            if old_key != key {
                debug!(from = %old_key, to = %key, "re-keying nodeclaim state");
                arena.re_key(&old_key, &key).await;
            }
        }

        let entry = arena
            .nodes
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(StateNode::from_nodeclaim(claim.clone()))))
            .clone();
        arena.claim_name_to_key.insert(name, key);
        drop(arena);

        entry.lock().await.set_nodeclaim(claim.clone());
    }

    /// Forget a deleted Node; the machine's state survives while its
    /// NodeClaim remains
    pub async fn delete_node(&self, name: &str) {
        let mut arena = self.arena.write().await;
        let Some(key) = arena.node_name_to_key.remove(name) else {
            return;
        };
        if let Some(entry) = arena.nodes.get(&key).cloned() {
            entry.lock().await.clear_node();
        }
        arena.prune(&key).await;
    }

    /// Forget a deleted NodeClaim; the machine's state survives while its
    /// Node remains
    pub async fn delete_nodeclaim(&self, name: &str) {
        let mut arena = self.arena.write().await;
        let Some(key) = arena.claim_name_to_key.remove(name) else {
            return;
        };
        if let Some(entry) = arena.nodes.get(&key).cloned() {
            entry.lock().await.clear_nodeclaim();
        }
        arena.prune(&key).await;
    }

    /// Record a pod binding, updating the bound machine's ledgers
    ///
    /// A pod observed on a different node than before is cleaned up there
    /// first. Serialized per machine by the per-node lock.
    #[instrument(skip_all, fields(pod = %PodKey::from_pod(pod)))]
    pub async fn update_pod(&self, client: &dyn ClusterClient, pod: &Pod) -> Result<()> {
        let pod_key = PodKey::from_pod(pod);
        let node_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .filter(|name| !name.is_empty());
        let Some(node_name) = node_name else {
            // unbound (or unbound again): drop any stale ledger entries
            self.delete_pod(&pod_key).await;
            return Ok(());
        };

        let arena = self.arena.read().await;
        let Some(key) = arena.node_name_to_key.get(&node_name).cloned() else {
            // the node has not been observed yet; a later node event
            // triggers a fresh pod reconcile. Any previous binding is stale
            // now and must stop counting against the old node's ledgers.
            drop(arena);
            self.delete_pod(&pod_key).await;
            return Ok(());
        };
        let entry = arena.nodes.get(&key).cloned();
        let previous = arena.pod_bindings.get(&pod_key).cloned();
        drop(arena);

        if let Some(previous_key) = previous.filter(|p| *p != key) {
            let stale = self.arena.read().await.nodes.get(&previous_key).cloned();
            if let Some(stale_entry) = stale {
                stale_entry.lock().await.cleanup_for_pod(&pod_key);
            }
        }

        if let Some(entry) = entry {
            entry.lock().await.update_for_pod(client, pod).await?;
        }

        self.arena
            .write()
            .await
            .pod_bindings
            .insert(pod_key, key);
        Ok(())
    }

    /// Remove every ledger entry for the pod. Idempotent.
    pub async fn delete_pod(&self, pod_key: &PodKey) {
        let (entry, _) = {
            let mut arena = self.arena.write().await;
            let Some(key) = arena.pod_bindings.remove(pod_key) else {
                return;
            };
            (arena.nodes.get(&key).cloned(), key)
        };
        if let Some(entry) = entry {
            entry.lock().await.cleanup_for_pod(pod_key);
        }
    }

    /// Set or clear the disruption engine's deletion override on a machine
    pub async fn mark_for_deletion(&self, key: &str, marked: bool) {
        if let Some(entry) = self.arena.read().await.nodes.get(key).cloned() {
            entry.lock().await.set_marked_for_deletion(marked);
        }
    }

    /// Reserve a machine against disruption for the nomination window
    pub async fn nominate(&self, key: &str, now: Instant) {
        if let Some(entry) = self.arena.read().await.nodes.get(key).cloned() {
            entry
                .lock()
                .await
                .nominate(now, self.options.batch_max_duration);
        }
    }

    /// Snapshot of one machine's state by identity key
    ///
    /// An entry emptied by a concurrent delete (the reader took the entry
    /// before the delete pruned it) reads as absent, never as a machine
    /// with no backing objects.
    pub async fn node(&self, key: &str) -> Option<StateNode> {
        let entry = self.arena.read().await.nodes.get(key).cloned()?;
        let state = entry.lock().await.clone();
        if !state.has_node() && state.node_claim().is_none() {
            return None;
        }
        Some(state)
    }

    /// Ordered snapshot of every machine's state
    ///
    /// Each element is cloned under its own lock, so every individual node
    /// view is internally consistent; the collection as a whole is a
    /// point-in-time-ish read, which is all the watch-driven model offers.
    pub async fn nodes(&self) -> StateNodes {
        let entries: Vec<(String, SharedStateNode)> = {
            let arena = self.arena.read().await;
            let mut entries: Vec<_> = arena
                .nodes
                .iter()
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        };
        let mut nodes = Vec::with_capacity(entries.len());
        for (_, entry) in entries {
            let state = entry.lock().await.clone();
            // skip entries emptied by a delete racing this snapshot
            if state.has_node() || state.node_claim().is_some() {
                nodes.push(state);
            }
        }
        StateNodes::new(nodes)
    }

    /// Number of machines currently tracked
    pub async fn node_count(&self) -> usize {
        self.arena.read().await.nodes.len()
    }

    /// Discard everything; the state rebuilds from future watch events
    pub async fn reset(&self) {
        let mut arena = self.arena.write().await;
        *arena = Arena::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, NodeSpec, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;

    use crate::crd::{NodeClaimSpec, NodeClaimStatus};
    use crate::kube_client::MockClusterClient;

    fn node(name: &str, provider_id: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: (!provider_id.is_empty()).then(|| provider_id.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn claim(name: &str, provider_id: &str) -> NodeClaim {
        let mut claim = NodeClaim::new(name, NodeClaimSpec::default());
        claim.status = Some(NodeClaimStatus {
            provider_id: provider_id.to_string(),
            ..Default::default()
        });
        claim
    }

    fn bound_pod(name: &str, node_name: &str, cpu: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("default".into()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node_name.to_string()),
                containers: vec![Container {
                    name: "app".into(),
                    resources: Some(ResourceRequirements {
                        requests: Some(
                            [("cpu".to_string(), Quantity(cpu.to_string()))]
                                .into_iter()
                                .collect(),
                        ),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn node_and_claim_join_under_the_provider_id() {
        let state = ClusterState::new(Options::default());
        state.update_nodeclaim(&claim("nc-1", "pid-1")).await;
        state.update_node(&node("node-1", "pid-1")).await;

        assert_eq!(state.node_count().await, 1);
        let merged = state.node("pid-1").await.unwrap();
        assert!(merged.managed());
        assert!(merged.node().is_some());
        assert_eq!(merged.provider_id(), "pid-1");
    }

    #[tokio::test]
    async fn claim_re_keys_when_its_provider_id_resolves() {
        let state = ClusterState::new(Options::default());

        // first observed with no provider id: keyed by name
        state.update_nodeclaim(&claim("nc-1", "")).await;
        assert!(state.node("nc-1").await.is_some());

        // provider id resolves: the entry moves and joins the node
        state.update_node(&node("node-1", "pid-1")).await;
        state.update_nodeclaim(&claim("nc-1", "pid-1")).await;

        assert_eq!(state.node_count().await, 1);
        assert!(state.node("nc-1").await.is_none());
        let merged = state.node("pid-1").await.unwrap();
        assert!(merged.managed());
        assert!(merged.node().is_some());
    }

    #[tokio::test]
    async fn entry_survives_until_both_sides_are_gone() {
        let state = ClusterState::new(Options::default());
        state.update_nodeclaim(&claim("nc-1", "pid-1")).await;
        state.update_node(&node("node-1", "pid-1")).await;

        state.delete_node("node-1").await;
        // claim remains: the machine is still tracked, view degrades to it
        let remaining = state.node("pid-1").await.unwrap();
        assert!(remaining.node().is_none());
        assert_eq!(remaining.name(), "nc-1");

        state.delete_nodeclaim("nc-1").await;
        assert_eq!(state.node_count().await, 0);
    }

    #[tokio::test]
    async fn pod_updates_land_on_the_bound_machine() {
        let client = MockClusterClient::new();
        let state = ClusterState::new(Options::default());
        state.update_node(&node("node-1", "pid-1")).await;

        state
            .update_pod(&client, &bound_pod("web-0", "node-1", "500m"))
            .await
            .unwrap();

        let snapshot = state.node("pid-1").await.unwrap();
        assert_eq!(
            snapshot.pod_requests().get("cpu"),
            Some(&Quantity("500m".into()))
        );

        state.delete_pod(&PodKey::new("default", "web-0")).await;
        let snapshot = state.node("pid-1").await.unwrap();
        assert!(snapshot.pod_requests().is_empty());
    }

    #[tokio::test]
    async fn rebinding_a_pod_moves_its_ledger_entries() {
        let client = MockClusterClient::new();
        let state = ClusterState::new(Options::default());
        state.update_node(&node("node-1", "pid-1")).await;
        state.update_node(&node("node-2", "pid-2")).await;

        state
            .update_pod(&client, &bound_pod("web-0", "node-1", "500m"))
            .await
            .unwrap();
        state
            .update_pod(&client, &bound_pod("web-0", "node-2", "500m"))
            .await
            .unwrap();

        assert!(state.node("pid-1").await.unwrap().pod_requests().is_empty());
        assert_eq!(
            state.node("pid-2").await.unwrap().pod_requests().get("cpu"),
            Some(&Quantity("500m".into()))
        );
    }

    #[tokio::test]
    async fn re_keying_onto_an_existing_entry_keeps_pod_ledgers() {
        let client = MockClusterClient::new();
        let state = ClusterState::new(Options::default());

        // the claim is already keyed by provider id; the node starts keyed
        // by name and accumulates a pod before its provider id resolves
        state.update_nodeclaim(&claim("nc-1", "pid-1")).await;
        state.update_node(&node("node-1", "")).await;
        state
            .update_pod(&client, &bound_pod("web-0", "node-1", "500m"))
            .await
            .unwrap();
        state.mark_for_deletion("node-1", true).await;

        state.update_node(&node("node-1", "pid-1")).await;

        assert_eq!(state.node_count().await, 1);
        let merged = state.node("pid-1").await.unwrap();
        assert!(merged.managed());
        assert!(merged.node().is_some());
        assert_eq!(
            merged.pod_requests().get("cpu"),
            Some(&Quantity("500m".into()))
        );
        assert!(merged.marked_for_deletion());

        // the binding moved too: deleting the pod empties the merged entry
        state.delete_pod(&PodKey::new("default", "web-0")).await;
        assert!(state.node("pid-1").await.unwrap().pod_requests().is_empty());
    }

    #[tokio::test]
    async fn snapshots_never_expose_an_emptied_entry() {
        let state = ClusterState::new(Options::default());
        state.update_node(&node("node-1", "pid-1")).await;

        // a reader racing a delete can hold the entry after the arena has
        // let go of the underlying objects; emulate that window by clearing
        // the entry in place
        let entry = state
            .arena
            .read()
            .await
            .nodes
            .get("pid-1")
            .cloned()
            .unwrap();
        entry.lock().await.clear_node();

        assert!(state.node("pid-1").await.is_none());
        assert!(state.nodes().await.is_empty());
    }

    #[tokio::test]
    async fn binding_to_an_untracked_node_clears_the_stale_binding() {
        let client = MockClusterClient::new();
        let state = ClusterState::new(Options::default());
        state.update_node(&node("node-1", "pid-1")).await;

        state
            .update_pod(&client, &bound_pod("web-0", "node-1", "500m"))
            .await
            .unwrap();

        // the pod moves to a node the arena has never observed; the old
        // node must stop counting it immediately
        state
            .update_pod(&client, &bound_pod("web-0", "node-x", "500m"))
            .await
            .unwrap();

        assert!(state.node("pid-1").await.unwrap().pod_requests().is_empty());
    }

    #[tokio::test]
    async fn snapshots_are_ordered_and_reset_clears_everything() {
        let state = ClusterState::new(Options::default());
        state.update_node(&node("node-b", "pid-b")).await;
        state.update_node(&node("node-a", "pid-a")).await;

        let nodes = state.nodes().await;
        let keys: Vec<String> = nodes.iter().map(|n| n.provider_id()).collect();
        assert_eq!(keys, vec!["pid-a", "pid-b"]);

        state.reset().await;
        assert_eq!(state.node_count().await, 0);
        assert!(state.nodes().await.is_empty());
    }
}
