//! The taint-based scheduling-pause protocol
//!
//! Before executing a disruption action the engine pauses scheduling onto
//! its candidate machines by applying the disruption taint; it removes the
//! taint when the action completes or aborts. The protocol is idempotent
//! and race-aware: it re-fetches the live Node before acting, never touches
//! machines this controller does not own, and stays out of the way of an
//! in-flight termination workflow.

use k8s_openapi::api::core::v1::Taint;
use tracing::{debug, instrument};

use crate::kube_client::ClusterClient;
use crate::scheduling::{disruption_taint, is_disrupting_taint};
use crate::state::statenode::StateNode;
use crate::{Error, Result, DISRUPTION_TAINT_KEY};

/// The taint list a node should carry for the requested pause state
///
/// Pausing drops any existing instance of the pause-taint key before
/// appending the canonical taint, so a drifted value or effect is repaired
/// rather than duplicated. Unpausing just drops the key.
pub fn desired_taints(current: &[Taint], paused: bool) -> Vec<Taint> {
    let mut taints: Vec<Taint> = current
        .iter()
        .filter(|taint| taint.key != DISRUPTION_TAINT_KEY)
        .cloned()
        .collect();
    if paused {
        taints.push(disruption_taint());
    }
    taints
}

/// Pause or resume scheduling onto the given machines
///
/// Only managed machines with both a live Node and a NodeClaim are touched:
/// the controller must never taint machines it does not own. Each node's
/// live object is re-fetched so the decision is never made against a stale
/// cached copy; a fetch failure skips that node's handling entirely rather
/// than proceeding against a zero-value object. Per-node failures are
/// collected and combined, never short-circuited, so every node in the
/// batch is attempted.
#[instrument(skip(client, nodes))]
pub async fn set_scheduling_paused(
    client: &dyn ClusterClient,
    nodes: &[StateNode],
    paused: bool,
) -> Result<()> {
    let mut errors: Vec<Error> = Vec::new();
    for state_node in nodes {
        let node_name = match (state_node.node(), state_node.node_claim()) {
            (Some(node), Some(_)) => node.metadata.name.clone().unwrap_or_default(),
            // claim-only or unmanaged: not ours to taint
            _ => continue,
        };

        let live = match client.get_node(&node_name).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                // gone between snapshot and re-fetch: nothing to taint
                debug!(node = %node_name, "node disappeared before taint update");
                continue;
            }
            Err(err) => {
                errors.push(Error::tainting(&node_name, err));
                continue;
            }
        };

        let current = live
            .spec
            .as_ref()
            .and_then(|spec| spec.taints.clone())
            .unwrap_or_default();
        let has_taint = current.iter().any(is_disrupting_taint);

        // Removal requested with nothing to remove.
        if !paused && !has_taint {
            continue;
        }
        // The termination workflow owns taints on a deleting node; do not
        // race its remove/re-add sequence.
        if has_taint && live.metadata.deletion_timestamp.is_some() {
            continue;
        }
        // Pause requested and the canonical taint already present.
        if paused && has_taint {
            continue;
        }

        let desired = desired_taints(&current, paused);
        if desired != current {
            if let Err(err) = client.patch_node_taints(&node_name, &desired).await {
                errors.push(Error::tainting(&node_name, err));
            }
        }
    }
    match Error::combine(errors) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
