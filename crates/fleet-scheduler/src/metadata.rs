//! Node selection helpers.
//!
//! Metadata keys whose value differs between nodes are *exclusive*; the
//! nodes sharing the same values on every exclusive key form a
//! failure-domain group. Keys with one value everywhere are *common*.
//!
//! ```text
//! n1 {pool: p1, zone: a}   ┐
//! n2 {pool: p1, zone: a}   ├─ common {pool: p1}
//! n3 {pool: p1, zone: b}   ┘  groups [{zone: b} x1, {zone: a} x2]
//! ```

use std::collections::{BTreeMap, HashMap};

use fleet_registry::Node;

use crate::error::{SchedulerError, SchedulerResult};

/// Nodes sharing the same values on every exclusive metadata key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataGroup {
    pub metadata: BTreeMap<String, String>,
    /// Addresses of the nodes in this group.
    pub nodes: Vec<String>,
}

impl MetadataGroup {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn matches(&self, node: &Node) -> bool {
        self.metadata
            .iter()
            .all(|(k, v)| node.metadata.get(k) == Some(v))
    }
}

/// Result of [`split_metadata`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitMetadata {
    /// Failure-domain groups, smallest first. Empty when all nodes agree
    /// on every key.
    pub exclusive: Vec<MetadataGroup>,
    pub common: HashMap<String, String>,
}

/// Partition node metadata into exclusive groups and common metadata.
///
/// Fails with `UnbalancedMetadata` when two nodes in different groups
/// still share some exclusive values (the groups are not separable), or
/// when a key is present on some nodes and missing on others.
pub fn split_metadata(nodes: &[Node]) -> SchedulerResult<SplitMetadata> {
    let mut common = HashMap::new();
    let mut exclusive: Vec<BTreeMap<String, String>> = vec![BTreeMap::new(); nodes.len()];

    for (i, node) in nodes.iter().enumerate() {
        for (key, value) in &node.metadata {
            let differs = nodes
                .iter()
                .enumerate()
                .any(|(j, other)| i != j && other.metadata.get(key) != Some(value));
            if differs {
                exclusive[i].insert(key.clone(), value.clone());
            } else {
                common.insert(key.clone(), value.clone());
            }
        }
    }

    let mut groups: Vec<MetadataGroup> = Vec::new();
    for (i, mine) in exclusive.iter().enumerate() {
        for (j, theirs) in exclusive.iter().enumerate() {
            if i == j {
                continue;
            }
            let diff = mine.iter().filter(|(k, v)| theirs.get(*k) != Some(*v)).count();
            if diff > 0 && (diff < mine.len() || diff > theirs.len()) {
                return Err(SchedulerError::UnbalancedMetadata(format!(
                    "{} {:?} vs {} {:?}",
                    nodes[i].address, mine, nodes[j].address, theirs
                )));
            }
        }
        if mine.is_empty() {
            continue;
        }
        match groups.iter_mut().find(|g| g.metadata == *mine) {
            Some(group) => group.nodes.push(nodes[i].address.clone()),
            None => groups.push(MetadataGroup {
                metadata: mine.clone(),
                nodes: vec![nodes[i].address.clone()],
            }),
        }
    }
    groups.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.metadata.cmp(&b.metadata)));

    Ok(SplitMetadata {
        exclusive: groups,
        common,
    })
}

/// Metadata for a new node: the common metadata overlaid with the least
/// represented group's exclusive metadata.
pub fn choose_metadata_from_nodes(nodes: &[Node]) -> SchedulerResult<HashMap<String, String>> {
    let split = split_metadata(nodes)?;
    let mut metadata = split.common;
    if let Some(smallest) = split.exclusive.first() {
        metadata.extend(smallest.metadata.clone());
    }
    Ok(metadata)
}

/// Whether `node` can leave `nodes` without emptying its pool or its
/// failure-domain group.
pub fn can_remove_node(node: &Node, nodes: &[Node]) -> SchedulerResult<bool> {
    if nodes.len() <= 1 {
        return Ok(false);
    }
    let split = split_metadata(nodes)?;
    if split.exclusive.is_empty() {
        return Ok(true);
    }
    Ok(split
        .exclusive
        .iter()
        .find(|g| g.matches(node))
        .is_some_and(|g| g.len() > 1))
}

/// Pick up to `count` nodes to remove.
///
/// Candidates from the largest groups come first; inside a group, nodes
/// with the fewest units (`unit_counts`) come first. Each pick is checked
/// with [`can_remove_node`] against the nodes still remaining, so the
/// result may be shorter than `count`.
pub fn choose_nodes_for_removal(
    nodes: &[Node],
    unit_counts: &HashMap<String, usize>,
    count: usize,
) -> SchedulerResult<Vec<Node>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let split = split_metadata(nodes)?;
    let group_size = |node: &Node| {
        split
            .exclusive
            .iter()
            .find(|g| g.matches(node))
            .map(MetadataGroup::len)
            .unwrap_or(nodes.len())
    };

    let mut candidates: Vec<&Node> = nodes.iter().collect();
    candidates.sort_by(|a, b| {
        group_size(b)
            .cmp(&group_size(a))
            .then_with(|| {
                let ca = unit_counts.get(&a.address).copied().unwrap_or(0);
                let cb = unit_counts.get(&b.address).copied().unwrap_or(0);
                ca.cmp(&cb)
            })
            .then_with(|| a.address.cmp(&b.address))
    });

    let mut remaining: Vec<Node> = nodes.to_vec();
    let mut chosen = Vec::new();
    for node in candidates {
        if can_remove_node(node, &remaining)? {
            remaining.retain(|n| n.address != node.address);
            chosen.push(node.clone());
            if chosen.len() >= count {
                break;
            }
        }
    }
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(addr: &str, meta: &[(&str, &str)]) -> Node {
        let mut n = Node::new(addr, "p1");
        for (k, v) in meta {
            n = n.with_metadata(k, v);
        }
        n
    }

    #[test]
    fn split_identical_nodes_has_no_groups() {
        let nodes = vec![node("n1", &[("iaas", "ec2")]), node("n2", &[("iaas", "ec2")])];
        let split = split_metadata(&nodes).unwrap();
        assert!(split.exclusive.is_empty());
        assert_eq!(split.common["pool"], "p1");
        assert_eq!(split.common["iaas"], "ec2");
    }

    #[test]
    fn split_groups_by_zone_smallest_first() {
        let nodes = vec![
            node("n1", &[("zone", "a"), ("net", "1")]),
            node("n2", &[("zone", "a"), ("net", "1")]),
            node("n3", &[("zone", "b"), ("net", "2")]),
        ];
        let split = split_metadata(&nodes).unwrap();
        assert_eq!(split.exclusive.len(), 2);
        assert_eq!(split.exclusive[0].nodes, vec!["n3"]);
        assert_eq!(split.exclusive[0].metadata["zone"], "b");
        assert_eq!(split.exclusive[1].nodes, vec!["n1", "n2"]);
        assert!(!split.common.contains_key("zone"));
    }

    #[test]
    fn split_rejects_overlapping_groups() {
        let nodes = vec![
            node("n1", &[("zone", "a"), ("net", "1")]),
            node("n2", &[("zone", "a"), ("net", "2")]),
            node("n3", &[("zone", "b"), ("net", "1")]),
        ];
        let err = split_metadata(&nodes).unwrap_err();
        assert!(matches!(err, SchedulerError::UnbalancedMetadata(_)));
    }

    #[test]
    fn split_rejects_key_missing_on_some_nodes() {
        let nodes = vec![node("n1", &[("zone", "a")]), node("n2", &[])];
        assert!(matches!(
            split_metadata(&nodes),
            Err(SchedulerError::UnbalancedMetadata(_))
        ));
    }

    #[test]
    fn choose_metadata_prefers_least_represented_group() {
        let nodes = vec![
            node("n1", &[("zone", "a"), ("iaas", "ec2")]),
            node("n2", &[("zone", "a"), ("iaas", "ec2")]),
            node("n3", &[("zone", "b"), ("iaas", "ec2")]),
        ];
        let meta = choose_metadata_from_nodes(&nodes).unwrap();
        assert_eq!(meta["zone"], "b");
        assert_eq!(meta["iaas"], "ec2");
        assert_eq!(meta["pool"], "p1");
    }

    #[test]
    fn can_remove_rules() {
        let single = vec![node("n1", &[])];
        assert!(!can_remove_node(&single[0], &single).unwrap());

        let flat = vec![node("n1", &[]), node("n2", &[])];
        assert!(can_remove_node(&flat[0], &flat).unwrap());

        let zoned = vec![
            node("n1", &[("zone", "a")]),
            node("n2", &[("zone", "a")]),
            node("n3", &[("zone", "b")]),
        ];
        assert!(can_remove_node(&zoned[0], &zoned).unwrap());
        assert!(!can_remove_node(&zoned[2], &zoned).unwrap());
    }

    #[test]
    fn removal_never_takes_the_last_node() {
        let nodes = vec![node("n1", &[]), node("n2", &[])];
        let chosen = choose_nodes_for_removal(&nodes, &HashMap::new(), 2).unwrap();
        assert_eq!(chosen.len(), 1);
    }

    #[test]
    fn removal_prefers_emptier_nodes_of_the_largest_group() {
        let nodes = vec![
            node("n1", &[("zone", "a")]),
            node("n2", &[("zone", "a")]),
            node("n3", &[("zone", "a")]),
            node("n4", &[("zone", "b")]),
            node("n5", &[("zone", "b")]),
        ];
        let counts: HashMap<String, usize> = [("n1", 3), ("n2", 1), ("n3", 2), ("n4", 0), ("n5", 0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let chosen = choose_nodes_for_removal(&nodes, &counts, 2).unwrap();
        let addrs: Vec<&str> = chosen.iter().map(|n| n.address.as_str()).collect();
        assert_eq!(addrs, vec!["n2", "n3"]);
    }

    proptest! {
        #[test]
        fn removal_keeps_every_group_alive(
            zones in proptest::collection::vec(0u8..3, 1..12),
            count in 0usize..12,
        ) {
            let nodes: Vec<Node> = zones
                .iter()
                .enumerate()
                .map(|(i, z)| node(&format!("n{i:02}"), &[("zone", z.to_string().as_str())]))
                .collect();
            let chosen = choose_nodes_for_removal(&nodes, &HashMap::new(), count).unwrap();

            prop_assert!(chosen.len() <= count);
            let remaining: Vec<&Node> = nodes
                .iter()
                .filter(|n| !chosen.iter().any(|c| c.address == n.address))
                .collect();
            prop_assert!(!remaining.is_empty());
            for zone in &zones {
                let zone = zone.to_string();
                prop_assert!(remaining.iter().any(|n| n.metadata["zone"] == zone));
            }
        }
    }
}
