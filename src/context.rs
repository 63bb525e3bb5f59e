use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::audit::AuditLog;
use crate::core::clock::Clock;
use crate::core::executor::CommandExecutor;
use crate::core::lock::LockManager;
use crate::core::notifications::NotificationChannel;
use crate::core::store::JobStore;

/// Collaborators shared by the state machine and the orchestrator.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn JobStore>,
    pub executor: Arc<dyn CommandExecutor>,
    pub locks: Arc<dyn LockManager>,
    pub notifier: Option<Arc<dyn NotificationChannel>>,
    pub clock: Arc<dyn Clock>,
    pub audit: AuditLog,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn CommandExecutor>,
        locks: Arc<dyn LockManager>,
        notifier: Option<Arc<dyn NotificationChannel>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let audit = AuditLog::new(store.clone(), clock.clone());
        Self {
            config: Arc::new(config),
            store,
            executor,
            locks,
            notifier,
            clock,
            audit,
        }
    }
}
