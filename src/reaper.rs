//! Idle reaper: periodically removes stale routes and kills their containers

use crate::route::{Route, RouteTable};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

pub struct IdleReaper {
    table: Arc<RouteTable>,
}

impl IdleReaper {
    pub fn new(table: Arc<RouteTable>) -> Self {
        Self { table }
    }

    /// Remove every route that is flagged expired or has been idle longer
    /// than the table's threshold at `now`. Returns the removed routes.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<Route> {
        let threshold = self.table.config().idle_threshold;
        let candidates: Vec<_> = self
            .table
            .routes()
            .into_iter()
            .filter(|r| r.is_stale(now, threshold))
            .map(|r| r.id)
            .collect();

        let mut removed = Vec::with_capacity(candidates.len());
        for id in candidates {
            // Traffic may have arrived since the snapshot; decide again under the lock
            let Some(route) = self.table.detach_if(id, |r| r.is_stale(now, threshold)) else {
                continue;
            };
            info!(
                route_id = %route.id,
                frontend = %route.frontend,
                expired = route.expired,
                idle_secs = (now - route.last_seen).num_seconds(),
                "Reaping route"
            );
            self.table.teardown(&route).await;
            removed.push(route);
        }
        removed
    }

    /// Sweep on every tick until shutdown is signalled
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = self.table.config().sweep_interval;
        debug!(interval_secs = interval.as_secs(), "Idle reaper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.sweep(Utc::now()).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Idle reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::RecordingGateway;
    use crate::route::RouteTableConfig;
    use crate::store::RouteStore;
    use std::time::Duration;

    fn setup(dir: &tempfile::TempDir, idle_secs: u64) -> (Arc<RouteTable>, Arc<RecordingGateway>) {
        let gateway = Arc::new(RecordingGateway::default());
        let table = RouteTable::new(
            RouteStore::new(dir.path().join("sessionMap.json")),
            gateway.clone(),
            RouteTableConfig {
                idle_threshold: Duration::from_secs(idle_secs),
                sweep_interval: Duration::from_millis(20),
            },
        );
        (table, gateway)
    }

    #[tokio::test]
    async fn test_sweep_removes_exactly_stale_routes() {
        let dir = tempfile::tempdir().unwrap();
        let (table, gateway) = setup(&dir, 60);

        let fresh = table.add_route("/fresh", "127.0.0.1:1", "c", vec!["f1".to_string()]);
        let idle = table.add_route(
            "/idle",
            "127.0.0.1:2",
            "c",
            vec!["i1".to_string(), "i2".to_string()],
        );
        let flagged = table.add_route("/flagged", "127.0.0.1:3", "c", vec!["x1".to_string()]);
        table.mark_expired(flagged.id);

        let later = Utc::now() + chrono::Duration::seconds(120);
        let removed = IdleReaper::new(Arc::clone(&table)).sweep(Utc::now()).await;

        let removed_ids: Vec<_> = removed.iter().map(|r| r.id).collect();
        assert_eq!(removed_ids, vec![flagged.id]);
        assert_eq!(gateway.killed(), vec!["x1"]);

        let removed = IdleReaper::new(Arc::clone(&table)).sweep(later).await;
        let removed_ids: Vec<_> = removed.iter().map(|r| r.id).collect();
        assert_eq!(removed_ids, vec![fresh.id, idle.id]);
        assert_eq!(gateway.killed(), vec!["x1", "f1", "i1", "i2"]);
        assert!(table.is_empty());

        // The store reflects the sweep
        let stored = RouteStore::new(dir.path().join("sessionMap.json")).load().unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_keeps_routes_within_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let (table, gateway) = setup(&dir, 60);
        table.add_route("/a", "127.0.0.1:1", "c", vec!["a".to_string()]);

        let soon = Utc::now() + chrono::Duration::seconds(30);
        assert!(IdleReaper::new(Arc::clone(&table)).sweep(soon).await.is_empty());
        assert_eq!(table.len(), 1);
        assert!(gateway.killed().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (table, gateway) = setup(&dir, 60);
        let route = table.add_route("/a", "127.0.0.1:1", "c", vec!["a".to_string()]);
        table.mark_expired(route.id);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(IdleReaper::new(Arc::clone(&table)).run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(table.is_empty());
        assert_eq!(gateway.killed(), vec!["a"]);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reaper should stop")
            .unwrap();
    }
}
