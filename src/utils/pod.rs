//! Pod identity and eligibility helpers

use std::fmt;

use k8s_openapi::api::core::v1::Pod;

/// Namespace + name identity of a pod, the key for every per-pod ledger
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
}

impl PodKey {
    /// Create a key from explicit parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of the given pod
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// True if the pod has reached a terminal phase (Succeeded or Failed)
pub fn is_terminal(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Succeeded" || phase == "Failed")
}

/// True if the pod is being deleted
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// True if the pod is running or still intends to run
pub fn is_active(pod: &Pod) -> bool {
    !is_terminal(pod) && !is_terminating(pod)
}

/// True if the pod is owned by a DaemonSet
///
/// DaemonSet pods are tracked in their own ledgers: they re-land on every
/// node, so their demand must be anticipated on nodes that do not exist yet.
pub fn is_owned_by_daemon_set(pod: &Pod) -> bool {
    is_owned_by(pod, "DaemonSet")
}

/// True if the pod is a static (mirror) pod owned directly by its node
pub fn is_owned_by_node(pod: &Pod) -> bool {
    is_owned_by(pod, "Node")
}

fn is_owned_by(pod: &Pod, kind: &str) -> bool {
    pod.metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.kind == kind)
}

/// True if evicting this pod would cause it to land somewhere else
///
/// Static pods never move, DaemonSet pods re-land on the same node, and
/// terminal or terminating pods are already gone for scheduling purposes.
pub fn is_reschedulable(pod: &Pod) -> bool {
    is_active(pod) && !is_owned_by_daemon_set(pod) && !is_owned_by_node(pod)
}
