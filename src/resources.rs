//! Resource quantity arithmetic
//!
//! Kubernetes keeps resource quantities as canonical strings ("100m", "2Gi").
//! The state cache needs real arithmetic over them: summing pod requests,
//! subtracting usage from allocatable, and detecting the zero-valued entries
//! a freshly-launched node reports before kubelet finishes probing.
//!
//! Arithmetic is done in nano-units (i128), which covers the full suffix
//! range from "n" to "Ei" without loss for the integral values the API
//! server produces.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// A mapping from resource name to quantity, mirroring `v1.ResourceList`
pub type ResourceList = BTreeMap<String, Quantity>;

/// Nano-units per whole unit
const NANO: i128 = 1_000_000_000;

/// Parse a quantity into nano-units
///
/// Accepts the apimachinery grammar: optional sign, decimal number, then a
/// decimal SI suffix (n/u/m/k/M/G/T/P/E), a binary suffix (Ki..Ei), or a
/// scientific exponent ("12e3"). Returns `None` for strings that do not
/// parse; callers decide whether that means zero.
pub fn parse_quantity(quantity: &Quantity) -> Option<i128> {
    let s = quantity.0.trim();
    if s.is_empty() {
        return None;
    }
    let (s, sign) = match s.strip_prefix('-') {
        Some(rest) => (rest, -1i128),
        None => (s.strip_prefix('+').unwrap_or(s), 1i128),
    };
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(digits_end);

    let multiplier: i128 = match suffix {
        "n" => 1,
        "u" => 1_000,
        "m" => 1_000_000,
        "" => NANO,
        "k" => NANO * 1_000,
        "M" => NANO * 1_000_000,
        "G" => NANO * 1_000_000_000,
        "T" => NANO * 1_000_000_000_000,
        "P" => NANO * 1_000_000_000_000_000,
        "E" => NANO * 1_000_000_000_000_000_000,
        "Ki" => NANO << 10,
        "Mi" => NANO << 20,
        "Gi" => NANO << 30,
        "Ti" => NANO << 40,
        "Pi" => NANO << 50,
        "Ei" => NANO << 60,
        exp if exp.starts_with('e') || exp.starts_with('E') => {
            let exponent: u32 = exp[1..].parse().ok()?;
            NANO.checked_mul(10i128.checked_pow(exponent)?)?
        }
        _ => return None,
    };

    let (integer, fraction) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if integer.is_empty() && fraction.is_empty() {
        return None;
    }
    let mut value: i128 = 0;
    if !integer.is_empty() {
        value = integer.parse::<i128>().ok()?.checked_mul(multiplier)?;
    }
    if !fraction.is_empty() {
        // Nine fractional digits are representable at nano precision;
        // anything finer is truncated.
        let digits: String = fraction.chars().take(9).collect();
        let scale = 10i128.pow(digits.len() as u32);
        let frac: i128 = digits.parse().ok()?;
        value = value.checked_add(frac.checked_mul(multiplier)? / scale)?;
    }
    Some(sign * value)
}

/// Format nano-units back into a canonical quantity string
///
/// Whole units print plain ("2"), sub-unit values fall back to the finest
/// suffix that represents them exactly ("500m", "1500u", "7n").
pub fn format_quantity(nanos: i128) -> Quantity {
    let s = if nanos % NANO == 0 {
        format!("{}", nanos / NANO)
    } else if nanos % 1_000_000 == 0 {
        format!("{}m", nanos / 1_000_000)
    } else if nanos % 1_000 == 0 {
        format!("{}u", nanos / 1_000)
    } else {
        format!("{nanos}n")
    };
    Quantity(s)
}

/// True if the quantity is absent, unparseable, or exactly zero
pub fn is_zero(quantity: Option<&Quantity>) -> bool {
    quantity.is_none_or(|q| parse_quantity(q).unwrap_or(0) == 0)
}

/// Add every entry of `from` into `into`, summing per resource name
pub fn merge_into(mut into: ResourceList, from: &ResourceList) -> ResourceList {
    for (name, quantity) in from {
        let current = into.get(name).and_then(parse_quantity).unwrap_or(0);
        let added = parse_quantity(quantity).unwrap_or(0);
        into.insert(name.clone(), format_quantity(current + added));
    }
    into
}

/// Sum a sequence of resource lists component-wise
pub fn merge<'a>(lists: impl IntoIterator<Item = &'a ResourceList>) -> ResourceList {
    lists
        .into_iter()
        .fold(ResourceList::new(), |acc, list| merge_into(acc, list))
}

/// Component-wise `lhs - rhs`
///
/// Resources present only in `rhs` appear negated in the result. Negative
/// values are preserved: over-commit is a signal the scheduler needs, never
/// clamped away here.
pub fn subtract(lhs: &ResourceList, rhs: &ResourceList) -> ResourceList {
    let mut result = lhs.clone();
    for (name, quantity) in rhs {
        let current = result.get(name).and_then(parse_quantity).unwrap_or(0);
        let subtracted = parse_quantity(quantity).unwrap_or(0);
        result.insert(name.clone(), format_quantity(current - subtracted));
    }
    result
}

/// Effective resource requests for a pod
///
/// Sum of the regular containers' requests, raised per resource name to the
/// largest single init container request (init containers run sequentially,
/// so the pod needs max, not sum, of their demands).
pub fn requests_for_pod(pod: &Pod) -> ResourceList {
    resources_for_pod(pod, |r| r.requests.as_ref())
}

/// Effective resource limits for a pod, same shape as [`requests_for_pod`]
pub fn limits_for_pod(pod: &Pod) -> ResourceList {
    resources_for_pod(pod, |r| r.limits.as_ref())
}

fn resources_for_pod(
    pod: &Pod,
    pick: fn(&ResourceRequirements) -> Option<&ResourceList>,
) -> ResourceList {
    let Some(spec) = pod.spec.as_ref() else {
        return ResourceList::new();
    };
    let mut total = merge(
        spec.containers
            .iter()
            .filter_map(|c| c.resources.as_ref().and_then(pick)),
    );
    for init in spec.init_containers.iter().flatten() {
        for (name, quantity) in init.resources.as_ref().and_then(pick).into_iter().flatten() {
            let requested = parse_quantity(quantity).unwrap_or(0);
            let current = total.get(name).and_then(parse_quantity).unwrap_or(0);
            if requested > current {
                total.insert(name.clone(), format_quantity(requested));
            }
        }
    }
    total
}
