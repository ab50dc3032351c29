//! Container lifecycle gateway used when a route is removed

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Terminates the compute resources behind a route.
///
/// Callers treat every failure as best-effort: it is logged and the route is
/// removed anyway.
#[async_trait]
pub trait ContainerGateway: Send + Sync {
    async fn kill(&self, container_id: &str) -> anyhow::Result<()>;
}

pub type SharedGateway = Arc<dyn ContainerGateway>;

/// Gateway for deployments where backends are not containers
pub struct NoopGateway;

#[async_trait]
impl ContainerGateway for NoopGateway {
    async fn kill(&self, container_id: &str) -> anyhow::Result<()> {
        debug!(container_id, "Container teardown disabled, ignoring");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records every kill and fails for ids listed in `failing`
    #[derive(Default)]
    pub struct RecordingGateway {
        pub killed: Mutex<Vec<String>>,
        pub failing: Vec<String>,
    }

    impl RecordingGateway {
        pub fn failing(ids: &[&str]) -> Self {
            Self {
                killed: Mutex::new(Vec::new()),
                failing: ids.iter().map(|s| s.to_string()).collect(),
            }
        }

        pub fn killed(&self) -> Vec<String> {
            self.killed.lock().clone()
        }
    }

    #[async_trait]
    impl ContainerGateway for RecordingGateway {
        async fn kill(&self, container_id: &str) -> anyhow::Result<()> {
            self.killed.lock().push(container_id.to_string());
            if self.failing.iter().any(|id| id == container_id) {
                anyhow::bail!("no such container: {}", container_id);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingGateway;
    use super::*;

    #[tokio::test]
    async fn test_noop_gateway_always_succeeds() {
        let gateway: SharedGateway = Arc::new(NoopGateway);
        assert!(gateway.kill("deadbeef").await.is_ok());
    }

    #[tokio::test]
    async fn test_recording_gateway_reports_failures() {
        let gateway = RecordingGateway::failing(&["cafebabe"]);
        assert!(gateway.kill("deadbeef").await.is_ok());
        assert!(gateway.kill("cafebabe").await.is_err());
        assert_eq!(gateway.killed(), vec!["deadbeef", "cafebabe"]);
    }
}
