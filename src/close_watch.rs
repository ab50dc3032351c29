//! Connection-close watcher
//!
//! One [`ConnectionWatch`] exists per accepted client connection. The
//! request service and every tunnel spawned from that connection hold a
//! clone; when the last clone goes away the client is gone for good and
//! every route matched on the connection is flagged for early reclamation.
//!
//! The flag is route-scoped: a route shared with another, still open
//! connection is flagged as well and will be collected on the next sweep.

use crate::route::{RouteId, RouteTable};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct ConnectionWatch {
    inner: Arc<WatchInner>,
}

struct WatchInner {
    table: Arc<RouteTable>,
    peer: SocketAddr,
    routes: Mutex<Vec<RouteId>>,
}

impl ConnectionWatch {
    pub fn new(table: Arc<RouteTable>, peer: SocketAddr) -> Self {
        Self {
            inner: Arc::new(WatchInner {
                table,
                peer,
                routes: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Remember that a request on this connection matched `id`
    pub fn register(&self, id: RouteId) {
        let mut routes = self.inner.routes.lock();
        if !routes.contains(&id) {
            routes.push(id);
        }
    }

    #[cfg(test)]
    fn registered(&self) -> Vec<RouteId> {
        self.inner.routes.lock().clone()
    }
}

impl Drop for WatchInner {
    fn drop(&mut self) {
        for id in self.routes.get_mut().drain(..) {
            if self.table.mark_expired(id) {
                debug!(peer = %self.peer, route_id = %id, "Client connection closed, route flagged");
            }
        }
    }
}
