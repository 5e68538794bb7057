//! Taint helpers: the disruption taint and the well-known ephemeral set

use k8s_openapi::api::core::v1::Taint;

use crate::{DISRUPTION_TAINT_KEY, DISRUPTION_TAINT_VALUE};

/// The canonical scheduling-pause taint applied during disruption actions
pub fn disruption_taint() -> Taint {
    Taint {
        key: DISRUPTION_TAINT_KEY.to_string(),
        value: Some(DISRUPTION_TAINT_VALUE.to_string()),
        effect: "NoSchedule".to_string(),
        time_added: None,
    }
}

/// True if the taint is the scheduling-pause taint
pub fn is_disrupting_taint(taint: &Taint) -> bool {
    taints_match(&disruption_taint(), taint)
}

/// True if two taints refer to the same scheduling constraint
///
/// Matches on key and effect only, mirroring the Kubernetes taint-matching
/// rule: the value carries detail, not identity.
pub fn taints_match(reference: &Taint, taint: &Taint) -> bool {
    reference.key == taint.key && reference.effect == taint.effect
}

/// Taints the system applies and removes on its own during a node's life
///
/// These are expected to reappear transiently (a cordon, a not-ready blip)
/// after initialization, so pre-initialization taint checks must not treat
/// them as permanent scheduling constraints.
pub fn known_ephemeral_taints() -> Vec<Taint> {
    vec![
        Taint {
            key: "node.kubernetes.io/not-ready".to_string(),
            value: None,
            effect: "NoExecute".to_string(),
            time_added: None,
        },
        Taint {
            key: "node.kubernetes.io/unreachable".to_string(),
            value: None,
            effect: "NoExecute".to_string(),
            time_added: None,
        },
        Taint {
            key: "node.kubernetes.io/unschedulable".to_string(),
            value: None,
            effect: "NoSchedule".to_string(),
            time_added: None,
        },
        Taint {
            key: "node.cloudprovider.kubernetes.io/uninitialized".to_string(),
            value: Some("true".to_string()),
            effect: "NoSchedule".to_string(),
            time_added: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_ignores_values_but_not_effects() {
        let reference = disruption_taint();
        let same_key_no_value = Taint {
            key: DISRUPTION_TAINT_KEY.to_string(),
            value: None,
            effect: "NoSchedule".to_string(),
            time_added: None,
        };
        let different_effect = Taint {
            key: DISRUPTION_TAINT_KEY.to_string(),
            value: Some(DISRUPTION_TAINT_VALUE.to_string()),
            effect: "NoExecute".to_string(),
            time_added: None,
        };

        assert!(taints_match(&reference, &same_key_no_value));
        assert!(is_disrupting_taint(&same_key_no_value));
        assert!(!taints_match(&reference, &different_effect));
        assert!(!is_disrupting_taint(&different_effect));
    }

    #[test]
    fn ephemeral_taints_cover_the_node_lifecycle_set() {
        let keys: Vec<_> = known_ephemeral_taints().into_iter().map(|t| t.key).collect();
        assert!(keys.contains(&"node.kubernetes.io/not-ready".to_string()));
        assert!(keys.contains(&"node.kubernetes.io/unreachable".to_string()));
        assert!(keys.contains(&"node.kubernetes.io/unschedulable".to_string()));
    }
}
