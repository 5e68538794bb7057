//! Stratus - in-memory cluster state for a Kubernetes node-autoscaling controller
//!
//! Stratus watches the cluster's live `Node` objects and its own `NodeClaim`
//! custom resources and fuses the two into one synthesized [`state::StateNode`]
//! per machine. The state cache maintains derived facts that are expensive to
//! recompute on every scheduling decision: resource availability, per-pod
//! host-port and volume usage, taint state, lifecycle phase, and temporary
//! scheduling reservations. The bin-packing scheduler and the disruption
//! engine read this cache instead of querying the API server directly.
//!
//! # Modules
//!
//! - [`crd`] - NodeClaim Custom Resource Definition
//! - [`state`] - Synthesized per-machine state, the cluster-state arena, and
//!   the scheduling-pause taint protocol
//! - [`scheduling`] - Host-port and volume usage ledgers, taint helpers
//! - [`resources`] - Resource quantity arithmetic
//! - [`kube_client`] - Kubernetes client trait used at every API seam
//! - [`utils`] - Node/Pod/NodeClaim helpers: identity resolution, event
//!   mapping, pod eligibility
//! - [`options`] - Resolved controller options consumed by this crate
//! - [`error`] - Error types for the state core

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_client;
pub mod options;
pub mod resources;
pub mod scheduling;
pub mod state;
pub mod utils;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-Known Keys
// =============================================================================
// Labels, taints, and finalizers owned by Stratus. Centralizing them here
// keeps the CRD, the state cache, and test fixtures consistent.

/// Label set to "true" on a node once it has joined the cluster
pub const REGISTERED_LABEL_KEY: &str = "stratus.dev/registered";

/// Label set to "true" on a node once bootstrap probing has finished
pub const INITIALIZED_LABEL_KEY: &str = "stratus.dev/initialized";

/// Label joining NodeClaims to the node pool that produced them
pub const NODEPOOL_LABEL_KEY: &str = "stratus.dev/nodepool";

/// Taint key used to pause scheduling onto a node during disruption
pub const DISRUPTION_TAINT_KEY: &str = "stratus.dev/disruption";

/// Value carried by the disruption taint
pub const DISRUPTION_TAINT_VALUE: &str = "disrupting";

/// Finalizer placed on NodeClaims so termination is always reconciled
pub const TERMINATION_FINALIZER: &str = "stratus.dev/termination";
