//! Moving units between nodes and rebalancing pools.
//!
//! A move is a replace batch: one new unit of the same process on the
//! target (or wherever the scheduler picks), then the old unit goes away.
//! A rebalance is a list of moves computed by [`plan_rebalance`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::info;

use fleet_core::Progress;
use fleet_registry::{Container, ContainerFilter};

use crate::error::{PipelineError, PipelineResult};
use crate::provisioner::Provisioner;
use crate::units::UnitBatch;

/// One move of a rebalance plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedMove {
    pub container: Container,
    pub from: String,
    pub to: String,
}

/// Which units a rebalance looks at. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RebalanceFilter {
    pub metadata: HashMap<String, String>,
    pub apps: Vec<String>,
}

/// Moves that even out every process across `nodes`.
///
/// For each process name (across apps), units go from the node holding
/// the most to the node holding the fewest until every node holds
/// `floor(n/N)` or `ceil(n/N)` of them. The unit moved is taken from the
/// app most skewed between those two nodes. Units on nodes outside
/// `nodes` are ignored.
pub fn plan_rebalance(nodes: &[String], containers: &[Container]) -> Vec<PlannedMove> {
    if nodes.len() < 2 {
        return Vec::new();
    }
    let mut by_process: BTreeMap<&str, Vec<&Container>> = BTreeMap::new();
    for c in containers {
        if nodes.contains(&c.host_addr) {
            by_process.entry(c.process_name.as_str()).or_default().push(c);
        }
    }

    let mut moves = Vec::new();
    for units in by_process.values() {
        let mut placed: BTreeMap<&str, Vec<&Container>> =
            nodes.iter().map(|n| (n.as_str(), Vec::new())).collect();
        for unit in units {
            if let Some(list) = placed.get_mut(unit.host_addr.as_str()) {
                list.push(*unit);
            }
        }

        loop {
            let Some((heavy, heavy_len)) = placed
                .iter()
                .map(|(n, l)| (*n, l.len()))
                .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
            else {
                break;
            };
            let Some((light, light_len)) = placed
                .iter()
                .map(|(n, l)| (*n, l.len()))
                .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(b.0)))
            else {
                break;
            };
            if heavy_len <= light_len + 1 {
                break;
            }

            let count_app = |node: &str, app: &str| {
                placed[node].iter().filter(|c| c.app_name == app).count() as i64
            };
            let Some(idx) = placed[heavy]
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    let skew_a = count_app(heavy, a.app_name.as_str()) - count_app(light, a.app_name.as_str());
                    let skew_b = count_app(heavy, b.app_name.as_str()) - count_app(light, b.app_name.as_str());
                    skew_b
                        .cmp(&skew_a)
                        .then_with(|| a.app_name.cmp(&b.app_name))
                        .then_with(|| a.status.removal_priority().cmp(&b.status.removal_priority()))
                        .then_with(|| a.id.cmp(&b.id))
                })
                .map(|(i, _)| i)
            else {
                break;
            };

            let Some(unit) = placed.get_mut(heavy).map(|l| l.swap_remove(idx)) else {
                break;
            };
            if let Some(list) = placed.get_mut(light) {
                list.push(unit);
            }
            moves.push(PlannedMove {
                container: unit.clone(),
                from: heavy.to_string(),
                to: light.to_string(),
            });
        }
    }
    moves
}

impl Provisioner {
    /// Move one unit, to `to_host` or wherever the scheduler picks.
    pub async fn move_container(
        &self,
        owner: &str,
        id: &str,
        to_host: Option<&str>,
        progress: &Progress,
    ) -> PipelineResult<Container> {
        let unit = self.cluster().get_container(id)?;
        if to_host == Some(unit.host_addr.as_str()) {
            return Err(PipelineError::InvalidRequest(format!(
                "unit {id} is already on {}",
                unit.host_addr
            )));
        }
        let _lock = self.lock_app(&unit.app_name, owner).await?;
        let app = self.app(&unit.app_name).await?;

        progress.message(format!(
            "Moving unit {} for {:?} from {} -> {}...\n",
            unit.id,
            unit.app_name,
            unit.host_addr,
            to_host.unwrap_or("*")
        ));
        let mut batch = UnitBatch::new(app, progress.clone());
        batch.image = unit.image_id.clone();
        batch.to_add.insert(unit.process_name.clone(), 1);
        batch.to_host = to_host.map(str::to_string);
        batch.to_remove = vec![unit.clone()];
        self.replace_units(&mut batch).await?;

        let moved = batch
            .added
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::ActionFailed {
                action: "move".to_string(),
                reason: format!("no replacement created for unit {id}"),
            })?;
        progress.message(format!(
            "Finished moving unit {} for {:?}.\n",
            unit.id, unit.app_name
        ));
        info!(id = %unit.id, app = %unit.app_name, from = %unit.host_addr, to = %moved.host_addr, "unit moved");
        Ok(moved)
    }

    /// Move every unit off `from`, in parallel bounded by `max_workers`.
    pub async fn move_containers(
        &self,
        owner: &str,
        from: &str,
        to: Option<&str>,
        progress: &Progress,
    ) -> PipelineResult<Vec<Container>> {
        let units = self.cluster().list_containers(&ContainerFilter::host(from))?;
        if units.is_empty() {
            progress.message(format!("No units to move in {from}\n"));
            return Ok(Vec::new());
        }
        progress.message(format!("Moving {} units...\n", units.len()));

        let workers = match self.config().max_workers {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        let mut tasks = JoinSet::new();
        for unit in units {
            let this = self.clone();
            let owner = owner.to_string();
            let to = to.map(str::to_string);
            let progress = progress.clone();
            let workers = workers.clone();
            tasks.spawn(async move {
                let _permit = match workers {
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };
                let result = this
                    .move_container(&owner, &unit.id, to.as_deref(), &progress)
                    .await;
                (unit.id, result)
            });
        }

        let mut moved = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(unit))) => moved.push(unit),
                Ok((id, Err(err))) => {
                    progress.error(format!("Error moving unit {id}: {err}\n"));
                    failures.push((id, err.to_string()));
                }
                Err(err) => failures.push(("task".to_string(), err.to_string())),
            }
        }
        if !failures.is_empty() {
            failures.sort();
            return Err(PipelineError::Composite(failures));
        }
        moved.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(moved)
    }

    /// Even out units on the nodes matching `filter`, pool by pool.
    ///
    /// With `dry` set, only reports the planned moves.
    pub async fn rebalance_containers(
        &self,
        owner: &str,
        filter: &RebalanceFilter,
        dry: bool,
        progress: &Progress,
    ) -> PipelineResult<Vec<PlannedMove>> {
        let nodes: Vec<_> = self
            .cluster()
            .nodes()?
            .into_iter()
            .filter(|n| n.matches_metadata(&filter.metadata))
            .collect();
        if nodes.is_empty() {
            progress.message("No hosts matching metadata filters\n");
            return Ok(Vec::new());
        }

        let containers = self.cluster().list_containers(&ContainerFilter {
            apps: filter.apps.clone(),
            hosts: nodes.iter().map(|n| n.address.clone()).collect(),
            ..ContainerFilter::default()
        })?;
        if containers.is_empty() {
            progress.message("No containers found to rebalance\n");
            return Ok(Vec::new());
        }

        let mut pools: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for node in &nodes {
            pools.entry(node.pool()).or_default().push(node.address.clone());
        }
        let moves: Vec<PlannedMove> = pools
            .values()
            .flat_map(|addrs| plan_rebalance(addrs, &containers))
            .collect();
        if moves.is_empty() {
            progress.message("Units are already balanced\n");
            return Ok(moves);
        }

        progress.message(format!("Rebalancing {} units...\n", moves.len()));
        if dry {
            for m in &moves {
                progress.message(format!(
                    "Would move unit {} for {:?} from {} -> {}\n",
                    m.container.id, m.container.app_name, m.from, m.to
                ));
            }
            return Ok(moves);
        }
        self.execute_moves(owner, &moves, progress).await?;
        Ok(moves)
    }

    /// Rebalance one pool. Unless `force` is set, acts only when the most
    /// and least loaded nodes differ by two units or more. Returns whether
    /// anything moved.
    pub async fn rebalance_pool(
        &self,
        owner: &str,
        pool: &str,
        force: bool,
        progress: &Progress,
    ) -> PipelineResult<bool> {
        let nodes = self.cluster().pool_nodes(pool)?;
        if nodes.len() < 2 {
            return Ok(false);
        }
        let by_node = self
            .cluster()
            .containers_by_node(&nodes, &ContainerFilter::default())?;
        if !force {
            let max = by_node.values().map(Vec::len).max().unwrap_or(0);
            let min = by_node.values().map(Vec::len).min().unwrap_or(0);
            if max - min < 2 {
                return Ok(false);
            }
        }

        let addrs: Vec<String> = nodes.iter().map(|n| n.address.clone()).collect();
        let containers: Vec<Container> = by_node.into_values().flatten().collect();
        let moves = plan_rebalance(&addrs, &containers);
        if moves.is_empty() {
            return Ok(false);
        }
        progress.message(format!("Rebalancing {} units...\n", moves.len()));
        self.execute_moves(owner, &moves, progress).await?;
        info!(%pool, moved = moves.len(), "pool rebalanced");
        Ok(true)
    }

    async fn execute_moves(
        &self,
        owner: &str,
        moves: &[PlannedMove],
        progress: &Progress,
    ) -> PipelineResult<()> {
        for m in moves {
            self.move_container(owner, &m.container.id, Some(&m.to), progress)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use fleet_core::progress::drain;
    use fleet_core::{ProgressEvent, Router};
    use fleet_registry::ContainerStatus;
    use proptest::prelude::*;

    fn unit(id: &str, app: &str, process: &str, host: &str) -> Container {
        Container {
            id: id.to_string(),
            name: id.to_string(),
            app_name: app.to_string(),
            process_name: process.to_string(),
            image_id: "img".to_string(),
            host_addr: host.to_string(),
            host_port: "30000".to_string(),
            ip: "172.17.0.2".to_string(),
            status: ContainerStatus::Started,
            last_status_update: 0,
        }
    }

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn messages(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<String> {
        drain(rx)
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Message(m) => Some(m),
                ProgressEvent::Error(_) => None,
            })
            .collect()
    }

    // ── Plan ───────────────────────────────────────────────────────

    #[test]
    fn plan_moves_from_heaviest_to_lightest() {
        let units: Vec<Container> = (0..4).map(|i| unit(&format!("c{i}"), "a", "web", "n1")).collect();
        let moves = plan_rebalance(&nodes(&["n1", "n2"]), &units);
        assert_eq!(moves.len(), 2);
        assert!(moves.iter().all(|m| m.from == "n1" && m.to == "n2"));
    }

    #[test]
    fn plan_is_empty_when_balanced() {
        let units = vec![
            unit("c1", "a", "web", "n1"),
            unit("c2", "a", "web", "n2"),
            unit("c3", "a", "web", "n1"),
        ];
        assert!(plan_rebalance(&nodes(&["n1", "n2"]), &units).is_empty());
        assert!(plan_rebalance(&nodes(&["n1"]), &units).is_empty());
    }

    #[test]
    fn plan_balances_each_process_separately() {
        let mut units = vec![
            unit("w1", "a", "worker", "n2"),
            unit("w2", "a", "worker", "n2"),
        ];
        units.extend((0..2).map(|i| unit(&format!("c{i}"), "a", "web", "n1")));
        let moves = plan_rebalance(&nodes(&["n1", "n2"]), &units);
        assert_eq!(moves.len(), 2);
        assert!(moves.iter().any(|m| m.container.process_name == "web" && m.to == "n2"));
        assert!(moves.iter().any(|m| m.container.process_name == "worker" && m.to == "n1"));
    }

    #[test]
    fn plan_moves_the_most_skewed_app() {
        let units = vec![
            unit("a1", "a", "web", "n1"),
            unit("a2", "a", "web", "n2"),
            unit("b1", "b", "web", "n1"),
            unit("b2", "b", "web", "n1"),
        ];
        let moves = plan_rebalance(&nodes(&["n1", "n2"]), &units);
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].container.app_name, "b");
    }

    proptest! {
        #[test]
        fn plan_leaves_every_process_balanced(
            node_count in 1usize..6,
            placements in proptest::collection::vec((0usize..6, 0u8..3, 0u8..2), 0..40),
        ) {
            let names: Vec<String> = (0..node_count).map(|i| format!("n{i}")).collect();
            let units: Vec<Container> = placements
                .iter()
                .enumerate()
                .map(|(i, (n, app, process))| {
                    unit(
                        &format!("c{i:03}"),
                        &format!("app{app}"),
                        if *process == 0 { "web" } else { "worker" },
                        &names[n % node_count],
                    )
                })
                .collect();

            let moves = plan_rebalance(&names, &units);
            let mut final_units = units.clone();
            for m in &moves {
                let u = final_units.iter_mut().find(|u| u.id == m.container.id).unwrap();
                prop_assert_eq!(&u.host_addr, &m.from);
                u.host_addr = m.to.clone();
            }

            for process in ["web", "worker"] {
                let total = final_units.iter().filter(|u| u.process_name == process).count();
                let floor = total / node_count;
                let ceil = total.div_ceil(node_count);
                for name in &names {
                    let here = final_units
                        .iter()
                        .filter(|u| u.process_name == process && &u.host_addr == name)
                        .count();
                    prop_assert!(here >= floor && here <= ceil, "{process} on {name}: {here} not in [{floor}, {ceil}]");
                }
            }
        }
    }

    // ── Moves ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn move_container_replaces_unit_on_target() {
        let fx = Fixture::new().await;
        fx.add_node("n1", "p1");
        fx.add_node("n2", "p1");
        fx.add_app("myapp", "p1").await;
        let added = fx.start_units("myapp", "web", 1, Some("n1")).await;
        let (progress, mut rx) = Progress::channel();

        let moved = fx
            .provisioner
            .move_container("op-1", &added[0].id, Some("n2"), &progress)
            .await
            .unwrap();
        assert_eq!(moved.host_addr, "n2");
        assert_eq!(moved.status, ContainerStatus::Started);
        assert!(fx.cluster.get_container(&added[0].id).is_err());
        assert_eq!(fx.router.routes("myapp").await.unwrap(), vec![moved.address()]);

        let lines = messages(&mut rx);
        assert!(lines[0].starts_with(&format!("Moving unit {} for \"myapp\" from n1 -> n2...", added[0].id)));
        assert!(lines.last().unwrap().starts_with(&format!("Finished moving unit {} for \"myapp\".", added[0].id)));
    }

    #[tokio::test]
    async fn move_to_same_host_or_unknown_unit_fails() {
        let fx = Fixture::new().await;
        fx.add_node("n1", "p1");
        fx.add_app("myapp", "p1").await;
        let added = fx.start_units("myapp", "web", 1, None).await;

        let err = fx
            .provisioner
            .move_container("op-1", &added[0].id, Some("n1"), &Progress::discard())
            .await
            .unwrap_err();
        assert!(err.is_invalid());

        let err = fx
            .provisioner
            .move_container("op-1", "nope", Some("n1"), &Progress::discard())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn failed_move_keeps_the_old_unit_routed() {
        let fx = Fixture::new().await;
        fx.add_node("n1", "p1");
        fx.add_node("n2", "p1");
        fx.add_app("myapp", "p1").await;
        let added = fx.start_units("myapp", "web", 1, Some("n1")).await;
        fx.runtime.set_fail_starts(true);

        assert!(fx
            .provisioner
            .move_container("op-1", &added[0].id, Some("n2"), &Progress::discard())
            .await
            .is_err());
        let left = fx.cluster.list_containers(&ContainerFilter::app("myapp")).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, added[0].id);
        assert_eq!(fx.router.routes("myapp").await.unwrap(), vec![added[0].address()]);
    }

    #[tokio::test]
    async fn move_containers_empties_the_node() {
        let fx = Fixture::new().await;
        fx.add_node("n1", "p1");
        fx.add_node("n2", "p1");
        fx.add_app("myapp", "p1").await;
        fx.start_units("myapp", "web", 3, Some("n1")).await;
        let (progress, mut rx) = Progress::channel();

        let moved = fx
            .provisioner
            .move_containers("op-1", "n1", Some("n2"), &progress)
            .await
            .unwrap();
        assert_eq!(moved.len(), 3);
        assert!(fx.cluster.list_containers(&ContainerFilter::host("n1")).unwrap().is_empty());
        assert_eq!(messages(&mut rx)[0], "Moving 3 units...\n");

        let (progress, mut rx) = Progress::channel();
        fx.provisioner
            .move_containers("op-1", "n1", Some("n2"), &progress)
            .await
            .unwrap();
        assert_eq!(messages(&mut rx), vec!["No units to move in n1\n"]);
    }

    #[tokio::test]
    async fn rebalance_containers_dry_and_real() {
        let fx = Fixture::new().await;
        fx.add_node("n1", "p1");
        fx.add_node("n2", "p1");
        fx.add_app("myapp", "p1").await;
        fx.start_units("myapp", "web", 4, Some("n1")).await;

        let (progress, mut rx) = Progress::channel();
        let planned = fx
            .provisioner
            .rebalance_containers("op-1", &RebalanceFilter::default(), true, &progress)
            .await
            .unwrap();
        assert_eq!(planned.len(), 2);
        assert_eq!(fx.cluster.list_containers(&ContainerFilter::host("n1")).unwrap().len(), 4);
        let lines = messages(&mut rx);
        assert_eq!(lines[0], "Rebalancing 2 units...\n");
        assert!(lines[1].starts_with("Would move unit"));

        fx.provisioner
            .rebalance_containers("op-1", &RebalanceFilter::default(), false, &Progress::discard())
            .await
            .unwrap();
        assert_eq!(fx.cluster.list_containers(&ContainerFilter::host("n1")).unwrap().len(), 2);
        assert_eq!(fx.cluster.list_containers(&ContainerFilter::host("n2")).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rebalance_containers_reports_empty_selections() {
        let fx = Fixture::new().await;
        fx.add_node("n1", "p1");

        let mut filter = RebalanceFilter::default();
        filter.metadata.insert("zone".to_string(), "x".to_string());
        let (progress, mut rx) = Progress::channel();
        fx.provisioner
            .rebalance_containers("op-1", &filter, false, &progress)
            .await
            .unwrap();
        assert_eq!(messages(&mut rx), vec!["No hosts matching metadata filters\n"]);

        let (progress, mut rx) = Progress::channel();
        fx.provisioner
            .rebalance_containers("op-1", &RebalanceFilter::default(), false, &progress)
            .await
            .unwrap();
        assert_eq!(messages(&mut rx), vec!["No containers found to rebalance\n"]);
    }

    #[tokio::test]
    async fn rebalance_pool_respects_gap_unless_forced() {
        let fx = Fixture::new().await;
        fx.add_node("n1", "p1");
        fx.add_node("n2", "p1");
        fx.add_app("myapp", "p1").await;
        fx.start_units("myapp", "web", 1, Some("n1")).await;
        fx.start_units("myapp", "worker", 1, Some("n1")).await;

        // Totals differ by 2 but each process is already balanced.
        assert!(!fx
            .provisioner
            .rebalance_pool("op-1", "p1", false, &Progress::discard())
            .await
            .unwrap());

        fx.start_units("myapp", "web", 1, Some("n1")).await;
        assert!(fx
            .provisioner
            .rebalance_pool("op-1", "p1", true, &Progress::discard())
            .await
            .unwrap());
        let web_n2 = fx
            .cluster
            .list_containers(&ContainerFilter::host("n2").with_process("web"))
            .unwrap();
        assert_eq!(web_n2.len(), 1);
    }
}
