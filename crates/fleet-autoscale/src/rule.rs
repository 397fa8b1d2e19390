//! Scaling rules: defaults and validation.
//!
//! Which rule applies to a pool is resolved by
//! [`Cluster::autoscale_rule`](fleet_registry::Cluster::autoscale_rule).

use fleet_registry::{AutoScaleRule, StateStore};

use crate::error::{AutoscaleError, AutoscaleResult};

/// Applied when a rule leaves `scale_down_ratio` at zero.
pub const DEFAULT_SCALE_DOWN_RATIO: f64 = 1.333;

/// Fill in defaults and reject unusable rules.
pub fn normalize_rule(mut rule: AutoScaleRule) -> AutoscaleResult<AutoScaleRule> {
    if rule.scale_down_ratio == 0.0 {
        rule.scale_down_ratio = DEFAULT_SCALE_DOWN_RATIO;
    } else if rule.scale_down_ratio <= 1.0 {
        return Err(AutoscaleError::InvalidRule(format!(
            "scale down ratio needs to be greater than 1.0, got {}",
            rule.scale_down_ratio
        )));
    }
    if rule.max_memory_ratio < 0.0 {
        return Err(AutoscaleError::InvalidRule(format!(
            "max memory ratio cannot be negative, got {}",
            rule.max_memory_ratio
        )));
    }
    if rule.max_container_count == 0 && rule.max_memory_ratio == 0.0 {
        return Err(AutoscaleError::InvalidRule(
            "either maxContainerCount or maxMemoryRatio must be set".to_string(),
        ));
    }
    Ok(rule)
}

/// Validate and store a rule.
pub fn set_rule(store: &StateStore, rule: AutoScaleRule) -> AutoscaleResult<AutoScaleRule> {
    let rule = normalize_rule(rule)?;
    store.put_rule(&rule)?;
    Ok(rule)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pool: &str, count: u32, memory: f64, ratio: f64) -> AutoScaleRule {
        AutoScaleRule {
            metadata_filter: pool.to_string(),
            enabled: true,
            max_container_count: count,
            max_memory_ratio: memory,
            scale_down_ratio: ratio,
            prevent_rebalance: false,
        }
    }

    #[test]
    fn normalize_applies_default_ratio() {
        let r = normalize_rule(rule("p1", 10, 0.0, 0.0)).unwrap();
        assert_eq!(r.scale_down_ratio, DEFAULT_SCALE_DOWN_RATIO);
    }

    #[test]
    fn normalize_rejects_bad_rules() {
        assert!(normalize_rule(rule("p1", 10, 0.0, 1.0)).unwrap_err().is_invalid());
        assert!(normalize_rule(rule("p1", 10, 0.0, 0.5)).unwrap_err().is_invalid());
        assert!(normalize_rule(rule("p1", 0, 0.0, 2.0)).unwrap_err().is_invalid());
        assert!(normalize_rule(rule("p1", 0, 0.8, 2.0)).is_ok());
    }

    #[test]
    fn set_rule_stores_normalized_and_refuses_invalid() {
        let store = StateStore::open_in_memory().unwrap();
        let stored = set_rule(&store, rule("p1", 4, 0.0, 0.0)).unwrap();
        assert_eq!(store.get_rule("p1").unwrap(), Some(stored));

        assert!(set_rule(&store, rule("p2", 4, 0.0, 1.0)).is_err());
        assert!(store.get_rule("p2").unwrap().is_none());
    }
}
