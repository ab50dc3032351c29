//! On-disk route store
//!
//! The store is a pretty-printed JSON array of routes. Writes go to a
//! temporary file in the same directory which is then renamed over the
//! store, so a crash mid-write leaves the previous generation intact.

use crate::error::StoreError;
use crate::route::Route;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct RouteStore {
    path: PathBuf,
}

impl RouteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read routes back. A missing store yields an empty list.
    pub fn load(&self) -> Result<Vec<Route>, StoreError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No route store found, starting empty");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let routes: Vec<Route> =
            serde_json::from_slice(&data).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        debug!(path = %self.path.display(), count = routes.len(), "Loaded route store");
        Ok(routes)
    }

    pub fn save(&self, routes: &[Route]) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec_pretty(routes)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&encoded).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        debug!(path = %self.path.display(), count = routes.len(), "Saved route store");
        Ok(())
    }
}
