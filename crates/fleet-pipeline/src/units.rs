//! Adding, removing and replacing units.
//!
//! Every batch runs the same four actions over a [`UnitBatch`]:
//!
//! ```text
//! add new units      schedule, create, start, health-check, mark started
//! add new routes     register the new units with the router
//! remove old routes  deregister the units going away
//! remove old units   stop and destroy them
//! ```
//!
//! Adding is a batch with nothing to remove, removing one with nothing to
//! add, and a move is both. Routes for new units are in place before old
//! routes are dropped, and old routes are gone before their units stop.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use fleet_core::{AppInfo, ContainerSpec, Progress};
use fleet_registry::{Container, ContainerFilter, ContainerStatus, epoch_secs};
use fleet_scheduler::{Placement, ScheduleRequest};

use crate::action::{Action, Pipeline};
use crate::error::{PipelineError, PipelineResult};
use crate::provisioner::Provisioner;

/// Shared state of one add/remove/move batch.
#[derive(Debug, Clone)]
pub struct UnitBatch {
    pub app: AppInfo,
    pub image: String,
    /// Units to add, per process name.
    pub to_add: BTreeMap<String, usize>,
    /// Force new units onto this node.
    pub to_host: Option<String>,
    pub to_remove: Vec<Container>,
    /// Filled by the first action.
    pub added: Vec<Container>,
    /// Old routes actually removed, for rollback.
    pub removed_routes: Vec<String>,
    pub progress: Progress,
}

impl UnitBatch {
    pub fn new(app: AppInfo, progress: Progress) -> Self {
        Self {
            image: app.image.clone(),
            app,
            to_add: BTreeMap::new(),
            to_host: None,
            to_remove: Vec::new(),
            added: Vec::new(),
            removed_routes: Vec::new(),
            progress,
        }
    }

    fn add_count(&self) -> usize {
        self.to_add.values().sum()
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "unit" } else { "units" }
}

fn describe(counts: &BTreeMap<String, usize>) -> String {
    counts
        .iter()
        .map(|(process, n)| format!("{process}: {n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

// ── Actions ────────────────────────────────────────────────────────

struct AddNewUnits(Provisioner);

#[async_trait]
impl Action<UnitBatch> for AddNewUnits {
    fn name(&self) -> &'static str {
        "add-new-units"
    }

    async fn forward(&self, ctx: &mut UnitBatch) -> PipelineResult<()> {
        let total = ctx.add_count();
        if total == 0 {
            return Ok(());
        }
        ctx.progress.message(format!(
            "\n---- Starting {total} new {} [{}] ----\n",
            plural(total),
            describe(&ctx.to_add)
        ));
        let ignored: Vec<String> = ctx.to_remove.iter().map(|c| c.id.clone()).collect();
        ctx.added = self
            .0
            .create_units(
                &ctx.app,
                &ctx.image,
                &ctx.to_add,
                ctx.to_host.as_deref(),
                &ignored,
                &ctx.progress,
            )
            .await?;
        Ok(())
    }

    async fn backward(&self, ctx: &mut UnitBatch) -> PipelineResult<()> {
        for unit in std::mem::take(&mut ctx.added) {
            ctx.progress
                .message(format!(" ---> Rolling back new unit {}\n", short_id(&unit.id)));
            if let Err(err) = self.0.destroy_unit(&unit).await {
                warn!(id = %unit.id, error = %err, "failed to remove unit during rollback");
            }
        }
        Ok(())
    }
}

struct AddNewRoutes(Provisioner);

#[async_trait]
impl Action<UnitBatch> for AddNewRoutes {
    fn name(&self) -> &'static str {
        "add-new-routes"
    }

    async fn forward(&self, ctx: &mut UnitBatch) -> PipelineResult<()> {
        if ctx.added.is_empty() {
            return Ok(());
        }
        ctx.progress.message("\n---- Adding routes to new units ----\n");
        let addresses: Vec<String> = ctx.added.iter().map(Container::address).collect();
        self.0
            .route(self.0.router().add_routes(&ctx.app.name, &addresses))
            .await
    }

    async fn backward(&self, ctx: &mut UnitBatch) -> PipelineResult<()> {
        if ctx.added.is_empty() {
            return Ok(());
        }
        let addresses: Vec<String> = ctx.added.iter().map(Container::address).collect();
        self.0
            .route(self.0.router().remove_routes(&ctx.app.name, &addresses))
            .await
    }
}

struct RemoveOldRoutes(Provisioner);

#[async_trait]
impl Action<UnitBatch> for RemoveOldRoutes {
    fn name(&self) -> &'static str {
        "remove-old-routes"
    }

    async fn forward(&self, ctx: &mut UnitBatch) -> PipelineResult<()> {
        if ctx.to_remove.is_empty() {
            return Ok(());
        }
        let routed = self.0.route(self.0.router().routes(&ctx.app.name)).await?;
        let addresses: Vec<String> = ctx
            .to_remove
            .iter()
            .map(Container::address)
            .filter(|a| routed.contains(a))
            .collect();
        if addresses.is_empty() {
            return Ok(());
        }
        ctx.progress.message("\n---- Removing routes from old units ----\n");
        self.0
            .route(self.0.router().remove_routes(&ctx.app.name, &addresses))
            .await?;
        ctx.removed_routes = addresses;
        Ok(())
    }

    async fn backward(&self, ctx: &mut UnitBatch) -> PipelineResult<()> {
        let addresses = std::mem::take(&mut ctx.removed_routes);
        if addresses.is_empty() {
            return Ok(());
        }
        self.0
            .route(self.0.router().add_routes(&ctx.app.name, &addresses))
            .await
    }
}

/// Never fails: a unit that cannot be destroyed is marked `error` so it
/// is neither routed nor counted as running, and left for the healer.
struct RemoveOldUnits(Provisioner);

#[async_trait]
impl Action<UnitBatch> for RemoveOldUnits {
    fn name(&self) -> &'static str {
        "remove-old-units"
    }

    async fn forward(&self, ctx: &mut UnitBatch) -> PipelineResult<()> {
        if ctx.to_remove.is_empty() {
            return Ok(());
        }
        let total = ctx.to_remove.len();
        ctx.progress
            .message(format!("\n---- Removing {total} old {} ----\n", plural(total)));
        for unit in &ctx.to_remove {
            match self.0.destroy_unit(unit).await {
                Ok(()) => ctx.progress.message(format!(
                    " ---> Removed old unit {} [{}]\n",
                    short_id(&unit.id),
                    unit.process_name
                )),
                Err(err) => {
                    warn!(id = %unit.id, error = %err, "failed to remove old unit");
                    ctx.progress
                        .error(format!("unable to remove unit {}: {err}", unit.id));
                    let mut failed = unit.clone();
                    failed.set_status(ContainerStatus::Error);
                    if let Err(err) = self.0.cluster().update_container(&failed) {
                        warn!(id = %unit.id, error = %err, "failed to mark unit as error");
                    }
                }
            }
        }
        Ok(())
    }
}

// ── Operations ─────────────────────────────────────────────────────

impl Provisioner {
    /// Run the replace pipeline over `batch`.
    ///
    /// After a router failure and its rollback, the app's routes are rebuilt
    /// or queued for a rebuild before the error is returned.
    pub async fn replace_units(&self, batch: &mut UnitBatch) -> PipelineResult<()> {
        let actions: Vec<Box<dyn Action<UnitBatch>>> = vec![
            Box::new(AddNewUnits(self.clone())),
            Box::new(AddNewRoutes(self.clone())),
            Box::new(RemoveOldRoutes(self.clone())),
            Box::new(RemoveOldUnits(self.clone())),
        ];
        let result = Pipeline::new(actions).execute(batch).await;
        if let Err(PipelineError::Router(err)) = &result {
            warn!(app = %batch.app.name, error = %err, "router failed mid-operation, rebuilding routes");
            self.rebuild_routes_or_enqueue(&batch.app.name).await;
        }
        result
    }

    /// Add units of `app`, per process, optionally forcing them onto one node.
    pub async fn add_units(
        &self,
        owner: &str,
        app: &str,
        to_add: &BTreeMap<String, usize>,
        to_host: Option<&str>,
        progress: &Progress,
    ) -> PipelineResult<Vec<Container>> {
        if to_add.values().all(|n| *n == 0) {
            return Err(PipelineError::InvalidRequest("no units to add".to_string()));
        }
        let _lock = self.lock_app(app, owner).await?;
        let info = self.app(app).await?;
        let mut batch = UnitBatch::new(info, progress.clone());
        batch.to_add = to_add.clone();
        batch.to_host = to_host.map(str::to_string);
        self.replace_units(&mut batch).await?;
        info!(%app, added = batch.added.len(), "units added");
        Ok(batch.added)
    }

    /// Remove units of `app`, per process, least useful first.
    pub async fn remove_units(
        &self,
        owner: &str,
        app: &str,
        to_remove: &BTreeMap<String, usize>,
        progress: &Progress,
    ) -> PipelineResult<Vec<Container>> {
        let _lock = self.lock_app(app, owner).await?;
        let info = self.app(app).await?;
        let mut chosen = Vec::new();
        for (process, count) in to_remove {
            if *count == 0 {
                continue;
            }
            let have = self
                .cluster()
                .list_containers(&ContainerFilter::app(app).with_process(process))?
                .len();
            if have < *count {
                return Err(PipelineError::NotEnoughUnits {
                    app: app.to_string(),
                    process: process.clone(),
                    want: *count,
                    have,
                });
            }
            chosen.extend(self.scheduler().choose_containers_to_remove(app, process, *count)?);
        }
        if chosen.is_empty() {
            return Err(PipelineError::InvalidRequest("no units to remove".to_string()));
        }
        let mut batch = UnitBatch::new(info, progress.clone());
        batch.to_remove = chosen;
        self.replace_units(&mut batch).await?;
        info!(%app, removed = batch.to_remove.len(), "units removed");
        Ok(batch.to_remove)
    }

    /// Create units in parallel, bounded by `max_workers`. On any failure,
    /// units already created are destroyed and every failure is reported.
    pub(crate) async fn create_units(
        &self,
        app: &AppInfo,
        image: &str,
        to_add: &BTreeMap<String, usize>,
        to_host: Option<&str>,
        ignored: &[String],
        progress: &Progress,
    ) -> PipelineResult<Vec<Container>> {
        let workers = match self.config().max_workers {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        let ignored: Arc<Vec<String>> = Arc::new(ignored.to_vec());
        let mut tasks = JoinSet::new();
        for (process, count) in to_add {
            for i in 0..*count {
                let this = self.clone();
                let app = app.clone();
                let process = process.clone();
                let image = image.to_string();
                let to_host = to_host.map(str::to_string);
                let ignored = ignored.clone();
                let progress = progress.clone();
                let workers = workers.clone();
                let label = format!("{}/{}#{}", app.name, process, i + 1);
                tasks.spawn(async move {
                    let _permit = match workers {
                        Some(sem) => sem.acquire_owned().await.ok(),
                        None => None,
                    };
                    let result = this
                        .create_unit(&app, &process, &image, to_host.as_deref(), &ignored, &progress)
                        .await;
                    (label, result)
                });
            }
        }

        let mut created = Vec::new();
        let mut failures: Vec<(String, PipelineError)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(unit))) => created.push(unit),
                Ok((label, Err(err))) => failures.push((label, err)),
                Err(err) => failures.push((
                    "task".to_string(),
                    PipelineError::ActionFailed {
                        action: "add-new-units".to_string(),
                        reason: err.to_string(),
                    },
                )),
            }
        }
        created.sort_by(|a, b| a.id.cmp(&b.id));
        if failures.is_empty() {
            return Ok(created);
        }

        for unit in &created {
            if let Err(err) = self.destroy_unit(unit).await {
                warn!(id = %unit.id, error = %err, "failed to remove unit after batch failure");
            }
        }
        if failures.len() == 1 && created.is_empty() {
            let (_, err) = failures.remove(0);
            return Err(err);
        }
        failures.sort_by(|a, b| a.0.cmp(&b.0));
        Err(PipelineError::Composite(
            failures
                .into_iter()
                .map(|(label, err)| (label, err.to_string()))
                .collect(),
        ))
    }

    async fn create_unit(
        &self,
        app: &AppInfo,
        process: &str,
        image: &str,
        to_host: Option<&str>,
        ignored: &[String],
        progress: &Progress,
    ) -> PipelineResult<Container> {
        let placement = self
            .scheduler()
            .schedule(&ScheduleRequest {
                app,
                process,
                to_host,
                ignored,
            })
            .await?;
        let result = self.start_unit(app, process, image, &placement, progress).await;
        self.scheduler().release(&placement).await;
        result
    }

    async fn start_unit(
        &self,
        app: &AppInfo,
        process: &str,
        image: &str,
        placement: &Placement,
        progress: &Progress,
    ) -> PipelineResult<Container> {
        let log = self.log_config_for(&app.pool)?;
        let spec = ContainerSpec {
            name: format!("{}-{}-{:x}-{}", app.name, process, epoch_secs(), placement.token),
            app: app.name.clone(),
            process: process.to_string(),
            image: image.to_string(),
            memory: app.plan.memory,
            env: app.env.clone(),
            log_driver: log.as_ref().map(|l| l.driver.clone()).filter(|d| !d.is_empty()),
            log_opts: log.map(|l| l.opts).unwrap_or_default(),
        };

        let node = placement.node.clone();
        let created = {
            let node = node.clone();
            let spec = spec.clone();
            self.cluster()
                .run_on_node(&placement.node, move |rt| async move {
                    rt.create_container(&node, &spec).await
                })
                .await?
        };

        let mut unit = Container {
            id: created.id,
            name: spec.name,
            app_name: app.name.clone(),
            process_name: process.to_string(),
            image_id: image.to_string(),
            host_addr: node,
            host_port: created.host_port,
            ip: created.ip,
            status: ContainerStatus::Building,
            last_status_update: epoch_secs(),
        };
        if let Err(err) = self.cluster().add_container(&unit) {
            self.remove_from_runtime(&unit).await;
            return Err(err.into());
        }

        if let Err(err) = self.boot_unit(app, &mut unit).await {
            if let Err(cleanup) = self.destroy_unit(&unit).await {
                warn!(id = %unit.id, error = %cleanup, "failed to clean up unit that did not boot");
            }
            return Err(err);
        }

        progress.message(format!(
            " ---> Started unit {} [{}] on {}\n",
            short_id(&unit.id),
            process,
            unit.host_addr
        ));
        Ok(unit)
    }

    /// Start a recorded unit, wait for its health check, mark it started.
    async fn boot_unit(&self, app: &AppInfo, unit: &mut Container) -> PipelineResult<()> {
        unit.set_status(ContainerStatus::Starting);
        self.cluster().update_container(unit)?;

        let node = unit.host_addr.clone();
        let id = unit.id.clone();
        self.cluster()
            .run_on_node(&unit.host_addr, move |rt| async move {
                rt.start_container(&node, &id).await
            })
            .await?;

        if let Some(hc) = &app.healthcheck {
            fleet_health::wait_healthy(&unit.address(), hc, self.config().healthcheck_timeout())
                .await?;
        }

        unit.set_status(ContainerStatus::Started);
        self.cluster().update_container(unit)?;
        Ok(())
    }

    /// Stop and remove a unit from its node, then drop its record.
    ///
    /// A unit whose node is no longer registered is already gone.
    pub async fn destroy_unit(&self, unit: &Container) -> PipelineResult<()> {
        let node = unit.host_addr.clone();
        let id = unit.id.clone();
        let result = self
            .cluster()
            .run_on_node(&unit.host_addr, move |rt| async move {
                rt.stop_container(&node, &id).await?;
                rt.remove_container(&node, &id).await
            })
            .await;
        if let Err(err) = result {
            match self.cluster().get_node(&unit.host_addr) {
                Err(e) if e.is_not_found() => {
                    warn!(id = %unit.id, node = %unit.host_addr, "node is gone, dropping unit record");
                }
                _ => return Err(err.into()),
            }
        }
        self.cluster().remove_container(&unit.id)?;
        Ok(())
    }

    async fn remove_from_runtime(&self, unit: &Container) {
        let node = unit.host_addr.clone();
        let id = unit.id.clone();
        let result = self
            .cluster()
            .run_on_node(&unit.host_addr, move |rt| async move {
                rt.remove_container(&node, &id).await
            })
            .await;
        if let Err(err) = result {
            warn!(id = %unit.id, error = %err, "failed to remove unrecorded unit from runtime");
        }
    }
}
