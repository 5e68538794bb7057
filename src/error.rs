//! Error types for the Stratus state core

use thiserror::Error;

/// Main error type for Stratus state operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// No live node matches a NodeClaim's resolved provider id
    ///
    /// Recoverable: callers commonly ignore this while a machine is still
    /// launching.
    #[error("no nodes found for provider id '{provider_id}'")]
    NodeNotFound {
        /// The provider id the lookup was keyed by
        provider_id: String,
    },

    /// Two or more live nodes claim the same provider id
    ///
    /// Always surfaced: the cluster is inconsistent and the controller
    /// cannot auto-resolve which machine is real.
    #[error("multiple nodes found for provider id '{provider_id}'")]
    DuplicateNode {
        /// The provider id shared by the duplicate nodes
        provider_id: String,
    },

    /// A pod's volume claims could not be resolved during a ledger update
    ///
    /// Recoverable: no ledger entries were written, the caller retries the
    /// whole pod update.
    #[error("tracking volume usage of claim '{claim}' for pod {pod}: {reason}")]
    VolumeResolution {
        /// Namespace/name of the pod being tracked
        pod: String,
        /// Name of the volume claim that failed to resolve
        claim: String,
        /// What went wrong with the lookup
        reason: String,
    },

    /// A single node failed during a taint-enforcement batch
    #[error("enforcing scheduling pause on node '{node}': {source}")]
    Tainting {
        /// Name of the node that failed
        node: String,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Combined per-node failures from a batch operation
    ///
    /// The batch is attempted in full even when individual nodes fail;
    /// callers retry the whole batch, which is idempotent.
    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multi(Vec<Error>),
}

impl Error {
    /// Wrap a per-node failure with the node it occurred on
    pub fn tainting(node: impl Into<String>, source: Error) -> Self {
        Self::Tainting {
            node: node.into(),
            source: Box::new(source),
        }
    }

    /// Combine a batch of errors into one, unwrapping the singleton case
    pub fn combine(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Multi(errors)),
        }
    }

    /// True if this error (or its taint-batch wrapper) is a missing-node error
    pub fn is_node_not_found(&self) -> bool {
        match self {
            Error::NodeNotFound { .. } => true,
            Error::Tainting { source, .. } => source.is_node_not_found(),
            _ => false,
        }
    }

    /// True if this error (or its taint-batch wrapper) is a duplicate-node error
    pub fn is_duplicate_node(&self) -> bool {
        match self {
            Error::DuplicateNode { .. } => true,
            Error::Tainting { source, .. } => source.is_duplicate_node(),
            _ => false,
        }
    }
}

/// Treat a missing-node failure as an expected, retryable condition
///
/// Returns `Ok(None)` for [`Error::NodeNotFound`] and propagates every other
/// error unchanged.
pub fn ignore_node_not_found<T>(result: crate::Result<T>) -> crate::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_node_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Swallow duplicate-node failures, propagating everything else
pub fn ignore_duplicate_node<T>(result: crate::Result<T>) -> crate::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_duplicate_node() => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_not_found_is_classified_by_variant_not_message() {
        let err = Error::NodeNotFound {
            provider_id: "pid-1".into(),
        };
        assert!(err.is_node_not_found());
        assert!(!err.is_duplicate_node());
        assert!(err.to_string().contains("pid-1"));
    }

    #[test]
    fn duplicate_node_is_classified_by_variant_not_message() {
        let err = Error::DuplicateNode {
            provider_id: "pid-1".into(),
        };
        assert!(err.is_duplicate_node());
        assert!(!err.is_node_not_found());
        assert!(err.to_string().contains("pid-1"));
    }

    #[test]
    fn classification_looks_through_taint_batch_wrappers() {
        let err = Error::tainting(
            "node-1",
            Error::NodeNotFound {
                provider_id: "pid-1".into(),
            },
        );
        assert!(err.is_node_not_found());
        assert!(err.to_string().contains("node-1"));
    }

    #[test]
    fn ignore_node_not_found_swallows_only_its_own_kind() {
        let missing: crate::Result<()> = Err(Error::NodeNotFound {
            provider_id: "pid-1".into(),
        });
        assert!(matches!(ignore_node_not_found(missing), Ok(None)));

        let duplicate: crate::Result<()> = Err(Error::DuplicateNode {
            provider_id: "pid-1".into(),
        });
        assert!(ignore_node_not_found(duplicate).is_err());

        let ok: crate::Result<u32> = Ok(7);
        assert!(matches!(ignore_node_not_found(ok), Ok(Some(7))));
    }

    #[test]
    fn ignore_duplicate_node_swallows_only_its_own_kind() {
        let duplicate: crate::Result<()> = Err(Error::DuplicateNode {
            provider_id: "pid-1".into(),
        });
        assert!(matches!(ignore_duplicate_node(duplicate), Ok(None)));

        let missing: crate::Result<()> = Err(Error::NodeNotFound {
            provider_id: "pid-1".into(),
        });
        assert!(ignore_duplicate_node(missing).is_err());
    }

    #[test]
    fn combine_unwraps_singletons_and_joins_batches() {
        assert!(Error::combine(vec![]).is_none());

        let single = Error::combine(vec![Error::NodeNotFound {
            provider_id: "pid-1".into(),
        }])
        .unwrap();
        assert!(matches!(single, Error::NodeNotFound { .. }));

        let multi = Error::combine(vec![
            Error::tainting(
                "node-1",
                Error::NodeNotFound {
                    provider_id: "pid-1".into(),
                },
            ),
            Error::tainting(
                "node-2",
                Error::DuplicateNode {
                    provider_id: "pid-2".into(),
                },
            ),
        ])
        .unwrap();
        let message = multi.to_string();
        assert!(message.contains("node-1"));
        assert!(message.contains("node-2"));
    }
}
