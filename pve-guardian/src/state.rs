use crate::config::AppConfig;
use crate::models::settings::KvStore;
use crate::offsite::{OffsiteProvider, WebDavProvider};
use crate::remote::{Connector, SshConnector};
use crate::services::coordinator::TaskCoordinator;
use crate::services::notifier::{self, Notifier};
use std::sync::Arc;

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: KvStore,
    pub coordinator: Arc<TaskCoordinator>,
    pub connector: Arc<dyn Connector>,
    pub offsite: Arc<dyn OffsiteProvider>,
    pub notifier: Arc<dyn Notifier>,
}

impl AppState {
    pub fn new(config: AppConfig, store: KvStore) -> Self {
        let offsite = Arc::new(WebDavProvider::new(config.offsite.clone()));
        let notifier = notifier::from_config(&config.notify);
        Self::with_backends(config, store, Arc::new(SshConnector), offsite, notifier)
    }

    pub fn with_backends(
        config: AppConfig,
        store: KvStore,
        connector: Arc<dyn Connector>,
        offsite: Arc<dyn OffsiteProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            coordinator: Arc::new(TaskCoordinator::new()),
            connector,
            offsite,
            notifier,
        }
    }
}
