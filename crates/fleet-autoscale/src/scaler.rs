//! Count and memory scalers.
//!
//! A scaler looks at one pool and says how many nodes to add, which
//! nodes to remove and whether a rebalance looks useful. Scalers are pure:
//! everything they need is in a [`PoolState`] gathered beforehand.

use std::collections::HashMap;

use serde::Serialize;

use fleet_registry::{AutoScaleRule, Container, Node};
use fleet_scheduler::choose_nodes_for_removal;

use crate::error::{AutoscaleError, AutoscaleResult};

/// What a scaler decided for one pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScalerResult {
    #[serde(rename = "toadd")]
    pub to_add: usize,
    #[serde(rename = "toremove")]
    pub to_remove: Vec<Node>,
    #[serde(rename = "torebalance")]
    pub to_rebalance: bool,
    pub reason: String,
}

impl ScalerResult {
    pub fn is_noop(&self) -> bool {
        self.to_add == 0 && self.to_remove.is_empty() && !self.to_rebalance
    }

    pub fn is_rebalance_only(&self) -> bool {
        self.to_add == 0 && self.to_remove.is_empty() && self.to_rebalance
    }
}

/// Snapshot of one pool, as seen by a scaler.
#[derive(Debug, Clone, Default)]
pub struct PoolState {
    pub pool: String,
    pub nodes: Vec<Node>,
    /// Units per node address. Every node of `nodes` has an entry.
    pub units: HashMap<String, Vec<Container>>,
    /// Plan memory per app, in bytes. Only the memory scaler reads it.
    pub app_memory: HashMap<String, u64>,
    /// Largest plan memory, in bytes. Only the memory scaler reads it.
    pub max_plan: Option<u64>,
}

impl PoolState {
    fn unit_count(&self, node: &Node) -> usize {
        self.units.get(&node.address).map(Vec::len).unwrap_or(0)
    }

    fn unit_counts(&self) -> HashMap<String, usize> {
        self.nodes
            .iter()
            .map(|n| (n.address.clone(), self.unit_count(n)))
            .collect()
    }

    fn reserved_memory(&self, node: &Node) -> u64 {
        self.units
            .get(&node.address)
            .map(|units| {
                units
                    .iter()
                    .map(|u| self.app_memory.get(&u.app_name).copied().unwrap_or(0))
                    .sum()
            })
            .unwrap_or(0)
    }
}

/// The scaler a rule asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Scaler {
    /// At most `max_container_count` units per node.
    Count { rule: AutoScaleRule },
    /// At most `max_memory_ratio` of each node's total memory reserved.
    Memory {
        rule: AutoScaleRule,
        total_memory_metadata: String,
    },
}

impl Scaler {
    /// The count scaler wins whenever the rule sets a container count.
    pub fn for_rule(rule: &AutoScaleRule, total_memory_metadata: &str) -> Self {
        if rule.max_container_count > 0 {
            Scaler::Count { rule: rule.clone() }
        } else {
            Scaler::Memory {
                rule: rule.clone(),
                total_memory_metadata: total_memory_metadata.to_string(),
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Scaler::Count { .. } => "count",
            Scaler::Memory { .. } => "memory",
        }
    }

    pub fn needs_memory(&self) -> bool {
        matches!(self, Scaler::Memory { .. })
    }

    fn rule(&self) -> &AutoScaleRule {
        match self {
            Scaler::Count { rule } | Scaler::Memory { rule, .. } => rule,
        }
    }

    /// Never asks for a rebalance when the rule prevents one.
    pub fn scale(&self, state: &PoolState) -> AutoscaleResult<ScalerResult> {
        let mut result = match self {
            Scaler::Count { rule } => count_scale(rule, state),
            Scaler::Memory {
                rule,
                total_memory_metadata,
            } => memory_scale(rule, total_memory_metadata, state),
        }?;
        if self.rule().prevent_rebalance {
            result.to_rebalance = false;
        }
        Ok(result)
    }
}

// ── Count ──────────────────────────────────────────────────────────

fn count_scale(rule: &AutoScaleRule, state: &PoolState) -> AutoscaleResult<ScalerResult> {
    let max = i64::from(rule.max_container_count);
    let total: i64 = state.nodes.iter().map(|n| state.unit_count(n) as i64).sum();
    let free = state.nodes.len() as i64 * max - total;
    let scaled_max = (max as f64 * rule.scale_down_ratio) as i64;
    let reason = format!("number of free slots is {free}");

    if free > scaled_max && scaled_max > 0 {
        let count = (free / scaled_max) as usize;
        let to_remove = choose_nodes_for_removal(&state.nodes, &state.unit_counts(), count)?;
        return Ok(ScalerResult {
            to_remove,
            reason,
            ..ScalerResult::default()
        });
    }
    if free >= 0 {
        let counts: Vec<usize> = state.nodes.iter().map(|n| state.unit_count(n)).collect();
        let gap = match (counts.iter().max(), counts.iter().min()) {
            (Some(max), Some(min)) => max - min,
            _ => 0,
        };
        return Ok(ScalerResult {
            to_rebalance: gap >= 2,
            ..ScalerResult::default()
        });
    }
    let missing = -free;
    Ok(ScalerResult {
        to_add: ((missing + max - 1) / max) as usize,
        reason,
        ..ScalerResult::default()
    })
}

// ── Memory ─────────────────────────────────────────────────────────

fn node_max_memory(node: &Node, key: &str, ratio: f64) -> AutoscaleResult<u64> {
    let total: u64 = node
        .metadata
        .get(key)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| AutoscaleError::MissingTotalMemory {
            node: node.address.clone(),
            key: key.to_string(),
        })?;
    Ok((total as f64 * ratio) as u64)
}

fn memory_scale(
    rule: &AutoScaleRule,
    key: &str,
    state: &PoolState,
) -> AutoscaleResult<ScalerResult> {
    let max_plan = state.max_plan.ok_or(AutoscaleError::MissingPlan)?;
    if state.nodes.is_empty() {
        return Ok(ScalerResult::default());
    }

    let mut max_total = 0u64;
    let mut reserved_total = 0u64;
    let mut fits_somewhere = false;
    let mut smallest_max = u64::MAX;
    for node in &state.nodes {
        let max = node_max_memory(node, key, rule.max_memory_ratio)?;
        let reserved = state.reserved_memory(node);
        max_total += max;
        reserved_total += reserved;
        smallest_max = smallest_max.min(max);
        if max as i64 - reserved as i64 >= max_plan as i64 {
            fits_somewhere = true;
        }
    }

    let n = state.nodes.len();
    if max_total > 0 {
        let avg_max = max_total as f64 / n as f64;
        let scaled_plan = max_plan as f64 * rule.scale_down_ratio;
        let needed = ((reserved_total as f64 + scaled_plan) / avg_max).ceil() as i64;
        let excess = n as i64 - needed;
        if excess > 0 {
            let to_remove =
                choose_nodes_for_removal(&state.nodes, &state.unit_counts(), excess as usize)?;
            if !to_remove.is_empty() {
                let left = n - to_remove.len();
                return Ok(ScalerResult {
                    to_remove,
                    reason: format!("containers can be distributed in only {left} nodes"),
                    ..ScalerResult::default()
                });
            }
        }
    }

    if max_plan > smallest_max {
        return Err(AutoscaleError::ImpossibleToFit {
            plan: max_plan,
            max: smallest_max,
        });
    }
    if fits_somewhere {
        return Ok(ScalerResult::default());
    }
    let to_add = (reserved_total + max_plan).checked_div(max_total).unwrap_or(0) as usize;
    if to_add == 0 {
        return Ok(ScalerResult::default());
    }
    Ok(ScalerResult {
        to_add,
        reason: format!("can't add {max_plan} bytes to an existing node"),
        ..ScalerResult::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_registry::ContainerStatus;
    use proptest::prelude::*;

    const MB4: u64 = 4_194_304;
    const MB24: u64 = 25_165_824;

    fn count_rule(max: u32) -> AutoScaleRule {
        AutoScaleRule {
            metadata_filter: "p1".to_string(),
            enabled: true,
            max_container_count: max,
            max_memory_ratio: 0.0,
            scale_down_ratio: 1.333,
            prevent_rebalance: false,
        }
    }

    fn memory_rule(ratio: f64) -> AutoScaleRule {
        AutoScaleRule {
            max_container_count: 0,
            max_memory_ratio: ratio,
            ..count_rule(0)
        }
    }

    fn unit(id: String, app: &str, host: &str) -> Container {
        Container {
            id: id.clone(),
            name: id,
            app_name: app.to_string(),
            process_name: "web".to_string(),
            image_id: "img".to_string(),
            host_addr: host.to_string(),
            host_port: "30000".to_string(),
            ip: "172.17.0.2".to_string(),
            status: ContainerStatus::Started,
            last_status_update: 0,
        }
    }

    /// A pool with `per_node[i]` units of app "a" on node `n{i}`.
    fn pool(per_node: &[usize]) -> PoolState {
        let mut state = PoolState {
            pool: "p1".to_string(),
            ..PoolState::default()
        };
        for (i, count) in per_node.iter().enumerate() {
            let addr = format!("n{i}");
            state.nodes.push(
                Node::new(&addr, "p1")
                    .with_metadata("iaas", "mem")
                    .with_metadata("totalMem", &MB24.to_string()),
            );
            let units = (0..*count).map(|j| unit(format!("{addr}-{j}"), "a", &addr)).collect();
            state.units.insert(addr, units);
        }
        state.app_memory.insert("a".to_string(), MB4);
        state.max_plan = Some(MB4);
        state
    }

    fn count(max: u32, per_node: &[usize]) -> ScalerResult {
        Scaler::for_rule(&count_rule(max), "totalMem")
            .scale(&pool(per_node))
            .unwrap()
    }

    // ── Count ──────────────────────────────────────────────────────

    #[test]
    fn count_grows_by_missing_slots() {
        let r = count(2, &[4]);
        assert_eq!(r.to_add, 1);
        assert_eq!(r.reason, "number of free slots is -2");

        let r = count(2, &[6]);
        assert_eq!(r.to_add, 2);

        let r = count(4, &[3, 3, 3]);
        assert_eq!(r.to_add, 0);
    }

    #[test]
    fn count_is_noop_within_slack() {
        assert!(count(2, &[0]).is_noop());
        assert!(count(2, &[1, 2]).is_noop());
    }

    #[test]
    fn uneven_pool_is_noop_when_rebalance_is_prevented() {
        assert!(count(4, &[4, 0]).is_rebalance_only());

        let rule = AutoScaleRule {
            prevent_rebalance: true,
            ..count_rule(4)
        };
        let r = Scaler::for_rule(&rule, "totalMem").scale(&pool(&[4, 0])).unwrap();
        assert!(r.is_noop());
    }

    #[test]
    fn count_asks_rebalance_on_gap() {
        let r = count(4, &[4, 1]);
        assert!(r.is_rebalance_only());
    }

    #[test]
    fn count_shrinks_with_free_slots() {
        let r = count(2, &[0, 0]);
        assert_eq!(r.to_remove.len(), 1);
        assert_eq!(r.reason, "number of free slots is 4");

        let r = count(2, &[0]);
        assert!(r.to_remove.is_empty());
    }

    #[test]
    fn count_scaler_wins_when_both_are_set() {
        let rule = AutoScaleRule {
            max_memory_ratio: 0.8,
            ..count_rule(2)
        };
        assert_eq!(Scaler::for_rule(&rule, "totalMem").kind(), "count");
        assert_eq!(Scaler::for_rule(&memory_rule(0.8), "totalMem").kind(), "memory");
    }

    // ── Memory ─────────────────────────────────────────────────────

    fn memory(per_node: &[usize], max_plan: Option<u64>) -> AutoscaleResult<ScalerResult> {
        let mut state = pool(per_node);
        state.max_plan = max_plan;
        Scaler::for_rule(&memory_rule(0.8), "totalMem").scale(&state)
    }

    #[test]
    fn memory_grows_when_no_node_fits_the_largest_plan() {
        let r = memory(&[9], Some(MB4)).unwrap();
        assert_eq!(r.to_add, 2);
        assert_eq!(r.reason, "can't add 4194304 bytes to an existing node");
    }

    #[test]
    fn memory_is_noop_when_a_node_has_room() {
        assert!(memory(&[2], Some(MB4)).unwrap().is_noop());
    }

    #[test]
    fn memory_aborts_when_plan_cannot_fit() {
        let err = memory(&[0], Some(MB24)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "aborting, impossible to fit max plan memory of 25165824 bytes, node max available memory is 20132659"
        );
    }

    #[test]
    fn memory_shrinks_idle_nodes() {
        let r = memory(&[1, 0, 0], Some(MB4)).unwrap();
        assert_eq!(r.to_remove.len(), 2);
        assert_eq!(r.reason, "containers can be distributed in only 1 nodes");
        assert!(r.to_remove.iter().all(|n| n.address != "n0"));
    }

    #[test]
    fn memory_requires_a_plan_and_total_memory() {
        assert!(matches!(memory(&[1], None), Err(AutoscaleError::MissingPlan)));

        let mut state = pool(&[1]);
        state.nodes[0].metadata.remove("totalMem");
        let err = Scaler::for_rule(&memory_rule(0.8), "totalMem")
            .scale(&state)
            .unwrap_err();
        assert!(matches!(err, AutoscaleError::MissingTotalMemory { .. }));
    }

    #[test]
    fn memory_floor_can_round_growth_to_nothing() {
        let r = memory(&[4], Some(MB4)).unwrap();
        assert_eq!(r.to_add, 1);

        // (32MB + 4MB) / 38.4MB floors to zero even though nothing fits.
        assert!(memory(&[4, 4], Some(MB4)).unwrap().is_noop());
    }

    proptest! {
        #[test]
        fn count_grow_lands_in_a_stable_state(
            max in 1u32..8,
            per_node in proptest::collection::vec(0usize..20, 1..5),
        ) {
            let first = count(max, &per_node);
            prop_assert!(first.to_add == 0 || first.to_remove.is_empty());
            if first.to_add > 0 {
                let mut grown = per_node.clone();
                grown.extend(std::iter::repeat_n(0, first.to_add));
                let second = count(max, &grown);
                prop_assert_eq!(second.to_add, 0);
                prop_assert!(second.to_remove.is_empty());
            }
        }

        #[test]
        fn noop_stays_noop(
            max in 1u32..8,
            per_node in proptest::collection::vec(0usize..20, 1..5),
        ) {
            let first = count(max, &per_node);
            if first.is_noop() {
                prop_assert!(count(max, &per_node).is_noop());
            }
            prop_assert!(first.to_remove.len() < per_node.len());
        }
    }
}
