use std::sync::Arc;

use crate::config::ControlConfig;
use crate::lifecycle::{LifecycleController, LifecycleSettings};
use crate::store::InstanceStore;
use crate::supervisor::{CommandSupervisor, ProcessSupervisor};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<LifecycleController>,
    pub config: Arc<ControlConfig>,
}

impl AppState {
    pub fn new(controller: Arc<LifecycleController>, config: ControlConfig) -> Self {
        Self {
            controller,
            config: Arc::new(config),
        }
    }

    /// Opens (or creates) the instance store and wires the command supervisor.
    pub async fn init(config: ControlConfig) -> anyhow::Result<Self> {
        let store = match config.instances_path() {
            Some(path) => {
                let store = InstanceStore::open(path.clone()).await?;
                tracing::info!(
                    path = %path.display(),
                    agents = store.count(tnet_process::ServiceKind::Agent),
                    proxies = store.count(tnet_process::ServiceKind::Proxy),
                    "instance store loaded"
                );
                store
            }
            None => {
                tracing::info!("TNET_DATA_ROOT not set; instances are kept in memory only");
                InstanceStore::in_memory()
            }
        };

        let supervisor: Arc<dyn ProcessSupervisor> = Arc::new(CommandSupervisor::new(
            config.binary.clone(),
            config.early_exit,
            config.term_grace,
        ));
        let controller = LifecycleController::new(
            Arc::new(store),
            supervisor,
            LifecycleSettings::from(&config),
        );

        Ok(Self::new(Arc::new(controller), config))
    }
}
