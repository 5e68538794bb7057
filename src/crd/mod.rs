//! Custom Resource Definitions for Stratus
//!
//! Stratus owns a single CRD: [`NodeClaim`], the record of a machine the
//! controller has asked its cloud provider for. A NodeClaim exists before,
//! and while, the machine becomes a live `v1.Node`.

mod nodeclaim;
mod types;

pub use nodeclaim::{NodeClaim, NodeClaimSpec, NodeClaimStatus, ResourceRequests};
pub use types::{Condition, ConditionStatus, ConditionType};
