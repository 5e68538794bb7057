//! Helpers over Kubernetes objects used by the state core

pub mod node;
pub mod nodeclaim;
pub mod pod;
