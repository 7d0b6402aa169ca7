//! Deploy and teardown orchestration with compensating rollback
//!
//! The coordinator owns the route set and sequences the allocator, the
//! renderer, the reconciler, and the datastore around the two lifecycle
//! events. All mutating operations serialize through one async mutex held
//! for the whole operation; a failure at any step unwinds every side effect
//! taken so far, so no port or route leak survives a failed deploy and a
//! failed teardown is always retryable.

use crate::allocator::{PortAllocator, RangeStats};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::reconciler::ProxyReconciler;
use crate::render;
use crate::routes::{Route, RouteSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Bounded retries when the durable layer reports a port conflict
const MAX_CONFLICT_RETRIES: u32 = 3;

/// Sequences allocator, renderer, reconciler, and datastore for deploys and
/// teardowns; sole owner of the route set
pub struct LifecycleCoordinator {
    allocator: PortAllocator,
    reconciler: ProxyReconciler,
    db: Arc<Database>,
    routes: Mutex<RouteSet>,
}

impl LifecycleCoordinator {
    pub fn new(allocator: PortAllocator, reconciler: ProxyReconciler, db: Arc<Database>) -> Self {
        Self {
            allocator,
            reconciler,
            db,
            routes: Mutex::new(RouteSet::new()),
        }
    }

    /// Deploy an app: reserve a port pair, add its route, reconcile the
    /// proxy, persist. Returns the access coordinates `(public_port,
    /// canvas_port)`.
    ///
    /// Range exhaustion surfaces immediately with nothing to unwind. Any
    /// later failure rolls back ports and route before `DeploymentFailed`
    /// is returned. A durable port conflict (another coordinator instance
    /// won the race) quarantines the colliding pair and retries with the
    /// next candidates, up to a bounded attempt count.
    pub async fn deploy(
        &self,
        app_id: &str,
        backend_host: &str,
        backend_port: u16,
    ) -> Result<(u16, u16)> {
        let mut routes = self.routes.lock().await;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let assignment = match self.allocator.allocate(app_id) {
                Ok(assignment) => assignment,
                Err(e) => {
                    // A conflict retry left the removed route live; scrub it
                    // before surfacing the allocation failure.
                    if attempt > 1 {
                        self.reapply_after_rollback(&routes).await;
                    }
                    return Err(e);
                }
            };
            routes.insert(Route::new(
                app_id,
                assignment.public_port,
                assignment.canvas_port,
                backend_host,
                backend_port,
            ));

            if let Err(e) = self.reconciler.apply(&render::render(&routes)).await {
                // The reconciler guarantees the live proxy never served the
                // new route; prior config is still active.
                routes.remove(app_id);
                self.allocator.unwind(app_id);
                warn!(app = app_id, error = %e, "Deploy rolled back");
                return Err(Error::DeploymentFailed {
                    app_id: app_id.to_string(),
                    source: Box::new(e),
                });
            }

            match self.db.insert_assignment(
                app_id,
                assignment.public_port,
                assignment.canvas_port,
                backend_host,
                backend_port,
            ) {
                Ok(()) => {
                    info!(
                        app = app_id,
                        public_port = assignment.public_port,
                        canvas_port = assignment.canvas_port,
                        backend = %format!("{}:{}", backend_host, backend_port),
                        "App deployed"
                    );
                    return Ok((assignment.public_port, assignment.canvas_port));
                }
                Err(Error::PortConflict { port }) => {
                    routes.remove(app_id);
                    // Quarantine, not unwind: the next scan must steer past
                    // the pair the durable layer says is taken.
                    self.allocator.release(app_id);
                    warn!(
                        app = app_id,
                        port, attempt, "Durable port conflict, retrying allocation"
                    );

                    if attempt >= MAX_CONFLICT_RETRIES {
                        self.reapply_after_rollback(&routes).await;
                        return Err(Error::DeploymentFailed {
                            app_id: app_id.to_string(),
                            source: Box::new(Error::PortConflict { port }),
                        });
                    }
                }
                Err(e) => {
                    // The new route is already live; scrub it before
                    // unwinding the ports.
                    routes.remove(app_id);
                    self.reapply_after_rollback(&routes).await;
                    self.allocator.unwind(app_id);
                    warn!(app = app_id, error = %e, "Deploy rolled back after persist failure");
                    return Err(Error::DeploymentFailed {
                        app_id: app_id.to_string(),
                        source: Box::new(e),
                    });
                }
            }
        }
    }

    /// Tear an app down: remove its route, reconcile the proxy, and only
    /// then quarantine its ports and delete the durable row.
    ///
    /// The release ordering is load-bearing: a port must never enter
    /// quarantine while a not-yet-reloaded proxy might still serve its old
    /// route. On apply failure the route is re-inserted and the error
    /// surfaces; ports stay allocated and the caller retries safely.
    pub async fn teardown(&self, app_id: &str) -> Result<()> {
        let mut routes = self.routes.lock().await;

        let Some(route) = routes.remove(app_id) else {
            // Unknown app: idempotent, but finish any interrupted cleanup.
            self.allocator.release(app_id);
            self.db.delete_assignment(app_id)?;
            return Ok(());
        };

        if let Err(e) = self.reconciler.apply(&render::render(&routes)).await {
            routes.insert(route);
            warn!(app = app_id, error = %e, "Teardown failed, route kept");
            return Err(e);
        }

        self.allocator.release(app_id);
        self.db.delete_assignment(app_id)?;
        info!(app = app_id, "App torn down");
        Ok(())
    }

    /// Per-range occupancy counters; runs against other reads without
    /// taking the coordinator lock
    pub fn stats(&self) -> BTreeMap<String, RangeStats> {
        self.allocator.stats()
    }

    /// Snapshot of the current routes, for the admin API
    pub async fn routes(&self) -> Vec<Route> {
        self.routes.lock().await.iter().cloned().collect()
    }

    /// Rebuild in-memory state from the datastore at startup and reconcile
    /// the proxy once so it converges to durable truth. Returns the number
    /// of restored assignments; rows that no longer fit the configured
    /// ranges are logged and skipped.
    pub async fn restore(&self) -> Result<usize> {
        let mut routes = self.routes.lock().await;
        let records = self.db.list_assignments()?;
        let mut restored = 0;

        for record in records {
            match self
                .allocator
                .restore(&record.app_id, record.public_port, record.canvas_port)
            {
                Ok(()) => {
                    routes.insert(Route::new(
                        &record.app_id,
                        record.public_port,
                        record.canvas_port,
                        &record.backend_host,
                        record.backend_port,
                    ));
                    restored += 1;
                }
                Err(e) => {
                    warn!(
                        app = %record.app_id,
                        error = %e,
                        "Skipping unrestorable assignment"
                    );
                }
            }
        }

        self.reconciler.apply(&render::render(&routes)).await?;
        info!(restored, "State restored from database");
        Ok(restored)
    }

    /// Re-apply the route set after a rollback removed a route that may
    /// already be live. Best effort: the rollback error still surfaces.
    async fn reapply_after_rollback(&self, routes: &RouteSet) {
        if let Err(e) = self.reconciler.apply(&render::render(routes)).await {
            error!(error = %e, "Failed to re-apply config after rollback");
        }
    }
}
