//! Host-port usage ledger

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Pod;

use crate::utils::pod::PodKey;

/// A single host-port claim made by a container
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostPort {
    /// Host IP the port is bound on; "0.0.0.0" claims every interface
    pub ip: String,
    /// Port number on the host
    pub port: i32,
    /// Protocol, "TCP" or "UDP"
    pub protocol: String,
}

impl HostPort {
    /// True if two claims cannot coexist on one node
    ///
    /// Same port and protocol conflict when the IPs are equal or either
    /// side binds the wildcard address.
    pub fn conflicts_with(&self, other: &HostPort) -> bool {
        self.port == other.port
            && self.protocol == other.protocol
            && (self.ip == other.ip || self.ip == "0.0.0.0" || other.ip == "0.0.0.0")
    }
}

/// Extract the host-port claims from a pod's containers
pub fn get_host_ports(pod: &Pod) -> Vec<HostPort> {
    let Some(spec) = pod.spec.as_ref() else {
        return Vec::new();
    };
    spec.containers
        .iter()
        .chain(spec.init_containers.iter().flatten())
        .flat_map(|container| container.ports.iter().flatten())
        .filter_map(|port| {
            let host_port = port.host_port?;
            if host_port == 0 {
                return None;
            }
            Some(HostPort {
                ip: port.host_ip.clone().unwrap_or_else(|| "0.0.0.0".to_string()),
                port: host_port,
                protocol: port.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            })
        })
        .collect()
}

/// Per-pod ledger of host-port claims on one node
///
/// Callers own the add/delete discipline: never add the same pod twice
/// without deleting it in between.
#[derive(Clone, Debug, Default)]
pub struct HostPortUsage {
    used: HashMap<PodKey, Vec<HostPort>>,
}

impl HostPortUsage {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pod's host-port claims
    pub fn add(&mut self, pod: PodKey, ports: Vec<HostPort>) {
        self.used.insert(pod, ports);
    }

    /// Remove every claim made by the pod. Idempotent.
    pub fn delete_pod(&mut self, pod: &PodKey) {
        self.used.remove(pod);
    }

    /// Take over every claim from another ledger, keeping ours on collision
    pub(crate) fn absorb(&mut self, other: HostPortUsage) {
        for (pod, ports) in other.used {
            self.used.entry(pod).or_insert(ports);
        }
    }

    /// True if the ledger has an entry for the pod
    pub fn contains_pod(&self, pod: &PodKey) -> bool {
        self.used.contains_key(pod)
    }

    /// First existing claim that conflicts with any of the candidate ports
    ///
    /// Claims made by `pod` itself are skipped so a pod can be re-checked
    /// against its own node.
    pub fn conflicting(&self, pod: &PodKey, ports: &[HostPort]) -> Option<(&PodKey, &HostPort)> {
        self.used
            .iter()
            .filter(|(key, _)| *key != pod)
            .flat_map(|(key, used)| used.iter().map(move |p| (key, p)))
            .find(|(_, used)| ports.iter().any(|candidate| used.conflicts_with(candidate)))
    }

    /// True if no pods hold any claims
    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}
