//! Resolved controller options consumed by the state core
//!
//! The embedding binary owns flag parsing; this crate only consumes the
//! resolved values.

use std::time::Duration;

/// Options that influence state-core behavior
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Maximum time the provisioner batches pending pods before scheduling.
    ///
    /// Nomination windows are derived from this so that a nominated node
    /// stays reserved across at least two batching rounds.
    pub batch_max_duration: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            batch_max_duration: Duration::from_secs(10),
        }
    }
}
