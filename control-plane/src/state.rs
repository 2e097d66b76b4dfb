//! Shared application state

use std::sync::Arc;

use trainforge_scheduler::Scheduler;

use crate::storage::ArchiveStore;

/// State handed to every request handler
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub archives: ArchiveStore,
}
