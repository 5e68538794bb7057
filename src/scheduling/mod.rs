//! Scheduling-adjacent bookkeeping: usage ledgers and taint helpers
//!
//! The ledgers track per-pod claims of scarce node-local resources (host
//! ports, exclusive volumes) so the scheduler can check exclusivity without
//! re-deriving usage from every bound pod.

mod hostport;
mod taints;
mod volume;

pub use hostport::{get_host_ports, HostPort, HostPortUsage};
pub use taints::{disruption_taint, is_disrupting_taint, known_ephemeral_taints, taints_match};
pub use volume::{get_volumes, VolumeUsage};
