//! NodeClaim Custom Resource Definition
//!
//! A NodeClaim is the controller's record of a *desired* machine: the taints
//! and requirements it was provisioned for, and - once the cloud provider
//! responds - the provider id and expected capacity of the machine backing
//! it. The state cache joins NodeClaims to live Nodes by provider id.

use k8s_openapi::api::core::v1::{NodeSelectorRequirement, Taint};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ConditionStatus, ConditionType};
use crate::resources::ResourceList;

/// Specification for a NodeClaim
///
/// Written once at provisioning time and treated as immutable afterwards;
/// everything the machine learns about itself lands in the status.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "stratus.dev",
    version = "v1alpha1",
    kind = "NodeClaim",
    plural = "nodeclaims",
    shortname = "nc",
    status = "NodeClaimStatus",
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".status.providerID"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimSpec {
    /// Taints the provisioned node must carry
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,

    /// Taints expected only during bootstrap; removed by the owning agent
    /// once the node is ready, and ignored by pre-initialization taint checks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub startup_taints: Vec<Taint>,

    /// Scheduling requirements the machine was provisioned to satisfy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<NodeSelectorRequirement>,

    /// Resources the machine was asked to provide
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequests>,
}

/// Resource requests carried by a NodeClaim spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequests {
    /// Requested quantities by resource name
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub requests: ResourceList,
}

/// Status for a NodeClaim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimStatus {
    /// Cloud-assigned identity correlating this claim to its realized Node.
    /// Empty until the cloud provider reports the machine.
    #[serde(rename = "providerID", default, skip_serializing_if = "String::is_empty")]
    pub provider_id: String,

    /// Name of the Node backing this claim, once registered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Capacity the machine is expected to report once probed
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub capacity: ResourceList,

    /// Allocatable the machine is expected to report once probed
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub allocatable: ResourceList,

    /// Lifecycle conditions (Launched, Registered, Initialized)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl NodeClaimStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// True if the given condition is present and `True`
    pub fn is_condition_true(&self, type_: ConditionType) -> bool {
        self.condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Insert or replace a condition, returning self for chaining
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }
}
