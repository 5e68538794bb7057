//! The synthesized per-machine state entity
//!
//! A [`StateNode`] fuses at most one live `Node` and at most one `NodeClaim`
//! into a single view of a machine. Either side may be absent (a claim whose
//! machine has not registered yet, or a node the controller never created),
//! but never both. Every derived view re-evaluates the precedence rule on
//! read: the two watch streams deliver events in no particular order
//! relative to each other, so staleness of either side is expected and must
//! not be baked in at update time.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use kube::ResourceExt;

use crate::crd::NodeClaim;
use crate::kube_client::ClusterClient;
use crate::resources::{self, ResourceList};
use crate::scheduling::{
    get_host_ports, get_volumes, known_ephemeral_taints, taints_match, HostPortUsage, VolumeUsage,
};
use crate::utils::node as node_utils;
use crate::utils::pod::{is_owned_by_daemon_set, PodKey};
use crate::{Result, INITIALIZED_LABEL_KEY, REGISTERED_LABEL_KEY};

/// Which underlying objects currently back a StateNode
///
/// The bootstrap lifecycle (claim first, node later) is a small state
/// machine; keeping it as an explicit variant evaluated per accessor keeps
/// the precedence rule in one place instead of scattered nil checks.
enum Backing<'a> {
    /// Only a live Node; the machine is not managed by this controller
    NodeOnly(&'a Node),
    /// Only a NodeClaim; the machine has not registered yet
    ClaimOnly(&'a NodeClaim),
    /// Both sides known; precedence switches on the Registered gate
    Both(&'a Node, &'a NodeClaim),
}

/// Cached state for one machine in the cluster
///
/// Maintains the facts that are expensive to recompute on every scheduling
/// decision: summed pod requests and limits, the DaemonSet subset thereof,
/// host-port and volume usage, and the deletion/nomination flags the
/// disruption engine reads.
#[derive(Clone, Debug)]
pub struct StateNode {
    node: Option<Node>,
    node_claim: Option<NodeClaim>,

    pod_requests: HashMap<PodKey, ResourceList>,
    pod_limits: HashMap<PodKey, ResourceList>,

    // DaemonSet demand is tracked separately so provisioning can anticipate
    // what future daemonsets will consume on nodes that do not exist yet.
    daemonset_requests: HashMap<PodKey, ResourceList>,
    daemonset_limits: HashMap<PodKey, ResourceList>,

    host_port_usage: HostPortUsage,
    volume_usage: VolumeUsage,

    marked_for_deletion: bool,
    nominated_until: Option<Instant>,
}

impl StateNode {
    /// Create state for a machine first observed as a live Node
    pub fn from_node(node: Node) -> Self {
        Self {
            node: Some(node),
            ..Self::empty()
        }
    }

    /// Create state for a machine first observed as a NodeClaim
    pub fn from_nodeclaim(claim: NodeClaim) -> Self {
        Self {
            node_claim: Some(claim),
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            node: None,
            node_claim: None,
            pod_requests: HashMap::new(),
            pod_limits: HashMap::new(),
            daemonset_requests: HashMap::new(),
            daemonset_limits: HashMap::new(),
            host_port_usage: HostPortUsage::default(),
            volume_usage: VolumeUsage::default(),
            marked_for_deletion: false,
            nominated_until: None,
        }
    }

    fn backing(&self) -> Backing<'_> {
        match (self.node.as_ref(), self.node_claim.as_ref()) {
            (Some(node), Some(claim)) => Backing::Both(node, claim),
            (Some(node), None) => Backing::NodeOnly(node),
            (None, Some(claim)) => Backing::ClaimOnly(claim),
            // Construction and the cluster arena guarantee at least one side.
            (None, None) => unreachable!("StateNode without a Node or a NodeClaim"),
        }
    }

    /// The live Node, if one has been observed
    pub fn node(&self) -> Option<&Node> {
        self.node.as_ref()
    }

    /// The NodeClaim, if the machine is managed by this controller
    pub fn node_claim(&self) -> Option<&NodeClaim> {
        self.node_claim.as_ref()
    }

    pub(crate) fn set_node(&mut self, node: Node) {
        self.node = Some(node);
    }

    pub(crate) fn set_nodeclaim(&mut self, claim: NodeClaim) {
        self.node_claim = Some(claim);
    }

    pub(crate) fn clear_node(&mut self) {
        self.node = None;
    }

    pub(crate) fn clear_nodeclaim(&mut self) {
        self.node_claim = None;
    }

    pub(crate) fn has_node(&self) -> bool {
        self.node.is_some()
    }

    /// True if this machine was created by this controller
    pub fn managed(&self) -> bool {
        self.node_claim.is_some()
    }

    /// The machine's name, preferring the Node once it has registered
    pub fn name(&self) -> String {
        match self.backing() {
            Backing::NodeOnly(node) => node.name_any(),
            Backing::ClaimOnly(claim) => claim.name_any(),
            Backing::Both(node, claim) => {
                if self.registered() {
                    node.name_any()
                } else {
                    claim.name_any()
                }
            }
        }
    }

    /// The cloud-assigned identity of the machine
    ///
    /// Empty while a managed machine's provider id is unresolved.
    pub fn provider_id(&self) -> String {
        match self.backing() {
            Backing::NodeOnly(node) | Backing::Both(node, _) => node
                .spec
                .as_ref()
                .and_then(|s| s.provider_id.clone())
                .unwrap_or_default(),
            Backing::ClaimOnly(claim) => claim
                .status
                .as_ref()
                .map(|s| s.provider_id.clone())
                .unwrap_or_default(),
        }
    }

    /// The hostname label, falling back to the machine's name
    pub fn hostname(&self) -> String {
        self.labels()
            .get("kubernetes.io/hostname")
            .cloned()
            .unwrap_or_else(|| self.name())
    }

    /// True once the machine has joined the cluster
    ///
    /// Unmanaged machines (no NodeClaim) are always considered registered:
    /// they only exist in our state because the api-server already knows them.
    pub fn registered(&self) -> bool {
        if !self.managed() {
            return true;
        }
        self.node
            .as_ref()
            .is_some_and(|node| label_is_true(node, REGISTERED_LABEL_KEY))
    }

    /// True once the machine has finished bootstrap probing
    pub fn initialized(&self) -> bool {
        if !self.managed() {
            return true;
        }
        self.node
            .as_ref()
            .is_some_and(|node| label_is_true(node, INITIALIZED_LABEL_KEY))
    }

    /// Labels, preferring the Node's once it has registered
    pub fn labels(&self) -> BTreeMap<String, String> {
        match self.backing() {
            Backing::NodeOnly(node) => node.labels().clone(),
            Backing::ClaimOnly(claim) => claim.labels().clone(),
            Backing::Both(node, claim) => {
                if self.registered() {
                    node.labels().clone()
                } else {
                    claim.labels().clone()
                }
            }
        }
    }

    /// Annotations, preferring the Node's once it has registered
    pub fn annotations(&self) -> BTreeMap<String, String> {
        match self.backing() {
            Backing::NodeOnly(node) => node.annotations().clone(),
            Backing::ClaimOnly(claim) => claim.annotations().clone(),
            Backing::Both(node, claim) => {
                if self.registered() {
                    node.annotations().clone()
                } else {
                    claim.annotations().clone()
                }
            }
        }
    }

    /// The taints that gate scheduling onto this machine
    ///
    /// Prefers the NodeClaim's taints more eagerly than labels do: an
    /// unregistered managed machine is judged by what it was provisioned
    /// with, not by whatever its half-bootstrapped Node reports. Until the
    /// machine is initialized, well-known ephemeral taints and the claim's
    /// declared startup taints are excluded; they are expected to reappear
    /// transiently later, and leaking them into pre-initialization checks
    /// would make the scheduler permanently distrust the node.
    pub fn taints(&self) -> Vec<Taint> {
        let taints = if (!self.registered() && self.managed()) || self.node.is_none() {
            self.node_claim
                .as_ref()
                .map(|claim| claim.spec.taints.clone())
                .unwrap_or_default()
        } else {
            self.node
                .as_ref()
                .and_then(|node| node.spec.as_ref())
                .and_then(|spec| spec.taints.clone())
                .unwrap_or_default()
        };
        match self.node_claim.as_ref() {
            Some(claim) if !self.initialized() => {
                let ephemeral = known_ephemeral_taints();
                taints
                    .into_iter()
                    .filter(|taint| {
                        !ephemeral
                            .iter()
                            .chain(claim.spec.startup_taints.iter())
                            .any(|reference| taints_match(reference, taint))
                    })
                    .collect()
            }
            _ => taints,
        }
    }

    /// Total machine capacity
    ///
    /// Until the node is initialized, zero-valued entries in its status are
    /// patched from the NodeClaim's expected capacity: a freshly-launched
    /// node reports zero for resources kubelet has not probed yet (GPUs,
    /// ephemeral storage).
    pub fn capacity(&self) -> ResourceList {
        if !self.initialized() {
            if let Some(claim) = self.node_claim.as_ref() {
                let expected = claim
                    .status
                    .as_ref()
                    .map(|s| s.capacity.clone())
                    .unwrap_or_default();
                return overlay_expected(self.node_capacity(), expected, self.node.is_some());
            }
        }
        self.node_capacity()
    }

    /// Allocatable capacity, patched like [`StateNode::capacity`]
    pub fn allocatable(&self) -> ResourceList {
        if !self.initialized() {
            if let Some(claim) = self.node_claim.as_ref() {
                let expected = claim
                    .status
                    .as_ref()
                    .map(|s| s.allocatable.clone())
                    .unwrap_or_default();
                return overlay_expected(self.node_allocatable(), expected, self.node.is_some());
            }
        }
        self.node_allocatable()
    }

    fn node_capacity(&self) -> ResourceList {
        self.node
            .as_ref()
            .and_then(|n| n.status.as_ref())
            .and_then(|s| s.capacity.clone())
            .unwrap_or_default()
    }

    fn node_allocatable(&self) -> ResourceList {
        self.node
            .as_ref()
            .and_then(|n| n.status.as_ref())
            .and_then(|s| s.allocatable.clone())
            .unwrap_or_default()
    }

    /// Allocatable minus everything allocated to pods
    ///
    /// Negative values are meaningful over-commit signals, not clamped.
    pub fn available(&self) -> ResourceList {
        resources::subtract(&self.allocatable(), &self.pod_requests())
    }

    /// Sum of resource requests across all tracked pods
    pub fn pod_requests(&self) -> ResourceList {
        resources::merge(self.pod_requests.values())
    }

    /// Sum of resource limits across all tracked pods
    pub fn pod_limits(&self) -> ResourceList {
        resources::merge(self.pod_limits.values())
    }

    /// Sum of resource requests contributed by DaemonSet-owned pods
    pub fn daemonset_requests(&self) -> ResourceList {
        resources::merge(self.daemonset_requests.values())
    }

    /// Sum of resource limits contributed by DaemonSet-owned pods
    pub fn daemonset_limits(&self) -> ResourceList {
        resources::merge(self.daemonset_limits.values())
    }

    /// The host-port ledger for this machine
    pub fn host_port_usage(&self) -> &HostPortUsage {
        &self.host_port_usage
    }

    /// The volume ledger for this machine
    pub fn volume_usage(&self) -> &VolumeUsage {
        &self.volume_usage
    }

    /// True if this machine should be treated as going away
    ///
    /// Either the disruption engine marked it explicitly, or its NodeClaim
    /// is deleting, or - only when no NodeClaim exists - the Node itself is
    /// deleting. Once a claim exists it is authoritative: a lingering Node's
    /// own deletion timestamp does not re-trigger this.
    pub fn marked_for_deletion(&self) -> bool {
        self.marked_for_deletion
            || self
                .node_claim
                .as_ref()
                .is_some_and(|claim| claim.metadata.deletion_timestamp.is_some())
            || (self.node_claim.is_none()
                && self
                    .node
                    .as_ref()
                    .is_some_and(|node| node.metadata.deletion_timestamp.is_some()))
    }

    pub(crate) fn set_marked_for_deletion(&mut self, marked: bool) {
        self.marked_for_deletion = marked;
    }

    /// Reserve this machine against disruption until the nomination expires
    ///
    /// Advisory only: nothing enforces the reservation beyond the scheduler
    /// reading [`StateNode::nominated`].
    pub fn nominate(&mut self, now: Instant, batch_max_duration: Duration) {
        self.nominated_until = Some(now + nomination_window(batch_max_duration));
    }

    /// True while a nomination is outstanding
    pub fn nominated(&self, now: Instant) -> bool {
        self.nominated_until.is_some_and(|until| until > now)
    }

    /// Pods bound to this machine, per the api-server bindings
    pub async fn pods(&self, client: &dyn ClusterClient) -> Result<Vec<Pod>> {
        match self.node.as_ref() {
            Some(node) => node_utils::get_pods(client, node).await,
            None => Ok(Vec::new()),
        }
    }

    /// Bound pods that would reschedule elsewhere if evicted
    pub async fn reschedulable_pods(&self, client: &dyn ClusterClient) -> Result<Vec<Pod>> {
        match self.node.as_ref() {
            Some(node) => node_utils::get_reschedulable_pods(client, node).await,
            None => Ok(Vec::new()),
        }
    }

    /// Recompute and store every ledger entry for the pod
    ///
    /// All-or-nothing: volume resolution happens before any ledger is
    /// touched, so a failure leaves this node's state exactly as it was and
    /// the caller retries the whole update. Re-adding a pod overwrites its
    /// previous entries, never double-accumulates.
    pub(crate) async fn update_for_pod(
        &mut self,
        client: &dyn ClusterClient,
        pod: &Pod,
    ) -> Result<()> {
        let pod_key = PodKey::from_pod(pod);
        let host_ports = get_host_ports(pod);
        let volumes = get_volumes(client, pod).await?;

        // The usage trackers are not idempotent on double-add; the discipline
        // of delete-before-re-add lives here.
        if self.host_port_usage.contains_pod(&pod_key) {
            self.host_port_usage.delete_pod(&pod_key);
        }
        if self.volume_usage.contains_pod(&pod_key) {
            self.volume_usage.delete_pod(&pod_key);
        }

        self.pod_requests
            .insert(pod_key.clone(), resources::requests_for_pod(pod));
        self.pod_limits
            .insert(pod_key.clone(), resources::limits_for_pod(pod));
        if is_owned_by_daemon_set(pod) {
            self.daemonset_requests
                .insert(pod_key.clone(), resources::requests_for_pod(pod));
            self.daemonset_limits
                .insert(pod_key.clone(), resources::limits_for_pod(pod));
        }
        self.host_port_usage.add(pod_key.clone(), host_ports);
        self.volume_usage.add(pod_key, volumes);
        Ok(())
    }

    /// Fold another machine's accumulated state into this one
    ///
    /// Used when an entry moves to a new identity key and lands on an entry
    /// that already exists there: the pod ledgers and the deletion/nomination
    /// flags must survive the move. Per-pod entries already present on this
    /// side win a collision; a pod is only ever bound to one machine, so
    /// collisions mean the same pod was observed on both halves of the join.
    pub(crate) fn absorb(&mut self, other: StateNode) {
        if self.node.is_none() {
            self.node = other.node;
        }
        if self.node_claim.is_none() {
            self.node_claim = other.node_claim;
        }
        for (pod, requests) in other.pod_requests {
            self.pod_requests.entry(pod).or_insert(requests);
        }
        for (pod, limits) in other.pod_limits {
            self.pod_limits.entry(pod).or_insert(limits);
        }
        for (pod, requests) in other.daemonset_requests {
            self.daemonset_requests.entry(pod).or_insert(requests);
        }
        for (pod, limits) in other.daemonset_limits {
            self.daemonset_limits.entry(pod).or_insert(limits);
        }
        self.host_port_usage.absorb(other.host_port_usage);
        self.volume_usage.absorb(other.volume_usage);
        self.marked_for_deletion = self.marked_for_deletion || other.marked_for_deletion;
        self.nominated_until = match (self.nominated_until, other.nominated_until) {
            (Some(ours), Some(theirs)) => Some(ours.max(theirs)),
            (ours, theirs) => ours.or(theirs),
        };
    }

    /// Remove every ledger entry for the pod. Idempotent.
    pub(crate) fn cleanup_for_pod(&mut self, pod_key: &PodKey) {
        self.host_port_usage.delete_pod(pod_key);
        self.volume_usage.delete_pod(pod_key);
        self.pod_requests.remove(pod_key);
        self.pod_limits.remove(pod_key);
        self.daemonset_requests.remove(pod_key);
        self.daemonset_limits.remove(pod_key);
    }
}

fn label_is_true(node: &Node, key: &str) -> bool {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .is_some_and(|value| value == "true")
}

/// Overlay a claim's expected quantities onto a node's reported status,
/// replacing only entries the node still reports as zero
fn overlay_expected(reported: ResourceList, expected: ResourceList, node_exists: bool) -> ResourceList {
    if !node_exists {
        return expected;
    }
    let mut patched = reported;
    for (name, quantity) in expected {
        if resources::is_zero(patched.get(&name)) {
            patched.insert(name, quantity);
        }
    }
    patched
}

/// How long a nomination holds: two full batching rounds, floored at 10s
pub(crate) fn nomination_window(batch_max_duration: Duration) -> Duration {
    std::cmp::max(2 * batch_max_duration, Duration::from_secs(10))
}

/// An ordered collection of [`StateNode`] snapshots
#[derive(Clone, Debug, Default)]
pub struct StateNodes(Vec<StateNode>);

impl StateNodes {
    /// Wrap an ordered sequence of state nodes
    pub fn new(nodes: Vec<StateNode>) -> Self {
        Self(nodes)
    }

    /// Nodes not marked for deletion
    pub fn active(&self) -> StateNodes {
        Self(
            self.0
                .iter()
                .filter(|node| !node.marked_for_deletion())
                .cloned()
                .collect(),
        )
    }

    /// Nodes marked for deletion
    pub fn deleting(&self) -> StateNodes {
        Self(
            self.0
                .iter()
                .filter(|node| node.marked_for_deletion())
                .cloned()
                .collect(),
        )
    }

    /// Pods bound across every node in the collection
    ///
    /// Fails fast on the first node's failure, returning no partial result:
    /// scheduling against a half-populated pod list double-counts capacity.
    pub async fn pods(&self, client: &dyn ClusterClient) -> Result<Vec<Pod>> {
        let mut pods = Vec::new();
        for node in &self.0 {
            pods.extend(node.pods(client).await?);
        }
        Ok(pods)
    }

    /// Reschedulable pods across every node, same atomicity as [`StateNodes::pods`]
    pub async fn reschedulable_pods(&self, client: &dyn ClusterClient) -> Result<Vec<Pod>> {
        let mut pods = Vec::new();
        for node in &self.0 {
            pods.extend(node.reschedulable_pods(client).await?);
        }
        Ok(pods)
    }

    /// Number of nodes in the collection
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the collection is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the nodes
    pub fn iter(&self) -> std::slice::Iter<'_, StateNode> {
        self.0.iter()
    }
}

impl std::ops::Deref for StateNodes {
    type Target = [StateNode];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl IntoIterator for StateNodes {
    type Item = StateNode;
    type IntoIter = std::vec::IntoIter<StateNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<StateNode> for StateNodes {
    fn from_iter<T: IntoIterator<Item = StateNode>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
