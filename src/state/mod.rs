//! Synthesized cluster state
//!
//! One [`StateNode`] per machine, fused from the live Node and the owning
//! NodeClaim; [`ClusterState`] as the concurrent arena holding them; and
//! the scheduling-pause taint protocol operating over them.

mod cluster;
mod statenode;
mod taints;

pub use cluster::ClusterState;
pub use statenode::{StateNode, StateNodes};
pub use taints::{desired_taints, set_scheduling_paused};
