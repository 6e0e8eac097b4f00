//! Application state shared across request handlers.

use std::sync::Arc;

use crate::jobs::JobManager;
use crate::store::KeyValueStore;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    manager: Arc<JobManager>,
}

impl AppState {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { manager }),
        }
    }

    pub fn manager(&self) -> &JobManager {
        &self.inner.manager
    }

    /// The record store backing the manager.
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        self.inner.manager.job_store().backend()
    }
}
