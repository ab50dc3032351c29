//! Route table: the single authoritative copy of proxy state
//!
//! Every route binds a path prefix and a session cookie to one backend
//! address plus the containers that back it. Routes are kept in insertion
//! order because lookup is first-match-wins.
//!
//! All access goes through [`RouteTable`]. The table lock is only ever held
//! for the in-memory operation (and the synchronous store write that
//! follows a membership change), never across network I/O.

use crate::error::{RouteError, StoreError};
use crate::gateway::SharedGateway;
use crate::store::RouteStore;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Stable identity of a route, assigned at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(pub u64);

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: RouteId,
    /// Prefix the (frontend-relative) request path must start with
    pub frontend: String,
    /// host:port of the backend service
    pub backend_addr: String,
    /// Session cookie value that grants access to this route
    pub cookie: String,
    pub last_seen: DateTime<Utc>,
    /// Containers killed when the route is removed
    #[serde(default)]
    pub container_ids: Vec<String>,
    /// Set when a client connection that used this route closed.
    /// Advisory only, never persisted.
    #[serde(skip)]
    pub expired: bool,
}

impl Route {
    pub fn is_authorized(&self, cookie: &str) -> bool {
        self.cookie == cookie
    }

    pub fn matches(&self, path: &str, cookie: &str) -> bool {
        path.starts_with(&self.frontend) && self.is_authorized(cookie)
    }

    /// Advance `last_seen` to `now`, never backwards
    pub fn seen_at(&mut self, now: DateTime<Utc>) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// Whether the reaper should collect this route at `now`
    pub fn is_stale(&self, now: DateTime<Utc>, idle_threshold: Duration) -> bool {
        if self.expired {
            return true;
        }
        // A clock step backwards yields a negative idle time, which is never stale
        match (now - self.last_seen).to_std() {
            Ok(idle) => idle > idle_threshold,
            Err(_) => false,
        }
    }
}

/// Timing knobs shared by the table and its reaper
#[derive(Debug, Clone)]
pub struct RouteTableConfig {
    pub idle_threshold: Duration,
    pub sweep_interval: Duration,
}

impl Default for RouteTableConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// One past the highest id in `routes`, `None` when no id is left
fn next_free_id(routes: &[Route]) -> Option<u64> {
    routes
        .iter()
        .try_fold(1u64, |next, route| Some(next.max(route.id.0.checked_add(1)?)))
}

pub struct RouteTable {
    routes: RwLock<Vec<Route>>,
    next_id: AtomicU64,
    store: RouteStore,
    gateway: SharedGateway,
    config: RouteTableConfig,
}

impl RouteTable {
    /// Create an empty table. Nothing is read from the store.
    pub fn new(store: RouteStore, gateway: SharedGateway, config: RouteTableConfig) -> Arc<Self> {
        Self::with_routes(Vec::new(), 1, store, gateway, config)
    }

    /// Create a table from whatever the store holds.
    ///
    /// A missing store gives an empty table; a corrupt one is an error the
    /// caller must not paper over.
    pub fn restore(
        store: RouteStore,
        gateway: SharedGateway,
        config: RouteTableConfig,
    ) -> Result<Arc<Self>, StoreError> {
        let routes = store.load()?;
        let next_id = next_free_id(&routes).ok_or_else(|| StoreError::IdExhausted {
            path: store.path().to_path_buf(),
        })?;
        info!(path = %store.path().display(), count = routes.len(), "Restored route table");
        Ok(Self::with_routes(routes, next_id, store, gateway, config))
    }

    fn with_routes(
        routes: Vec<Route>,
        next_id: u64,
        store: RouteStore,
        gateway: SharedGateway,
        config: RouteTableConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            routes: RwLock::new(routes),
            next_id: AtomicU64::new(next_id),
            store,
            gateway,
            config,
        })
    }

    pub fn config(&self) -> &RouteTableConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// Snapshot of all routes in insertion order
    pub fn routes(&self) -> Vec<Route> {
        self.routes.read().clone()
    }

    pub fn get(&self, id: RouteId) -> Option<Route> {
        self.routes.read().iter().find(|r| r.id == id).cloned()
    }

    /// Register a new route and persist the table.
    ///
    /// Duplicate paths and cookies are accepted; the earliest one wins on
    /// lookup. A failed store write is logged and the in-memory route stays.
    pub fn add_route(
        &self,
        frontend: impl Into<String>,
        backend_addr: impl Into<String>,
        cookie: impl Into<String>,
        container_ids: Vec<String>,
    ) -> Route {
        let route = Route {
            id: RouteId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            frontend: frontend.into(),
            backend_addr: backend_addr.into(),
            cookie: cookie.into(),
            last_seen: Utc::now(),
            container_ids,
            expired: false,
        };

        let mut routes = self.routes.write();
        routes.push(route.clone());
        self.persist_locked(&routes);
        drop(routes);

        info!(
            route_id = %route.id,
            frontend = %route.frontend,
            backend = %route.backend_addr,
            containers = ?route.container_ids,
            "Route added"
        );
        route
    }

    /// First route, in insertion order, whose frontend prefixes `path` and
    /// whose cookie equals `cookie`
    pub fn find_route(&self, path: &str, cookie: &str) -> Result<Route, RouteError> {
        self.routes
            .read()
            .iter()
            .find(|r| r.matches(path, cookie))
            .cloned()
            .ok_or(RouteError::NotFound)
    }

    /// Record traffic on a route. Returns false if the route is gone.
    pub fn seen(&self, id: RouteId) -> bool {
        let now = Utc::now();
        let mut routes = self.routes.write();
        match routes.iter_mut().find(|r| r.id == id) {
            Some(route) => {
                route.seen_at(now);
                true
            }
            None => false,
        }
    }

    /// Flag a route for early reclamation
    pub fn mark_expired(&self, id: RouteId) -> bool {
        let mut routes = self.routes.write();
        match routes.iter_mut().find(|r| r.id == id) {
            Some(route) => {
                route.expired = true;
                true
            }
            None => false,
        }
    }

    /// Take a route out of the table and persist.
    ///
    /// Returns `None` when another caller already removed it, so teardown
    /// happens at most once per route.
    pub fn detach(&self, id: RouteId) -> Option<Route> {
        self.detach_if(id, |_| true)
    }

    /// Like [`detach`](Self::detach), but only if `keep_going` still holds
    /// for the route once the write lock is taken
    pub fn detach_if(&self, id: RouteId, keep_going: impl FnOnce(&Route) -> bool) -> Option<Route> {
        let mut routes = self.routes.write();
        let index = routes.iter().position(|r| r.id == id)?;
        if !keep_going(&routes[index]) {
            return None;
        }
        let route = routes.remove(index);
        self.persist_locked(&routes);
        drop(routes);

        info!(route_id = %id, frontend = %route.frontend, backend = %route.backend_addr, "Route removed");
        Some(route)
    }

    /// Kill every container associated with a removed route.
    ///
    /// Failures are logged per container and never stop the remaining kills.
    pub async fn teardown(&self, route: &Route) {
        for container_id in &route.container_ids {
            match self.gateway.kill(container_id).await {
                Ok(()) => debug!(route_id = %route.id, container_id, "Container torn down"),
                Err(e) => warn!(
                    route_id = %route.id,
                    container_id,
                    error = %e,
                    "Failed to tear down container"
                ),
            }
        }
    }

    /// Remove a route and tear down its containers
    pub async fn remove_route(&self, id: RouteId) -> Option<Route> {
        let route = self.detach(id)?;
        self.teardown(&route).await;
        Some(route)
    }

    /// Write the current table to the store
    pub fn persist(&self) -> Result<(), StoreError> {
        let routes = self.routes.read();
        self.store.save(&routes)
    }

    fn persist_locked(&self, routes: &[Route]) {
        if let Err(e) = self.store.save(routes) {
            error!(path = %self.store.path().display(), error = %e, "Failed to persist route table");
        }
    }
}
