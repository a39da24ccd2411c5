use crate::{
    components::{discoverer::Discoverer, prober::Prober, watcher::Watcher},
    configs::MonitorConfig,
    error::AppResult,
    store::{Store, DB_FILENAME},
};
use std::{path::Path, sync::Arc};
use tokio::{
    fs,
    sync::{Mutex, RwLock},
};
use tokio_util::sync::CancellationToken;

/// Owns the store, the configuration and the lifetime of every background
/// task. The HTTP layer and the embedding program talk to the monitor
/// through this handle; there is no process-wide instance.
pub struct Monitor {
    config_path: String,
    config: RwLock<MonitorConfig>,
    store: Store,
    cancel: CancellationToken,
    pipeline: Mutex<CancellationToken>,
}

impl Monitor {
    /// Creates the working directory, opens the database (fatal on failure)
    /// and starts the writer, the zone discoverer and the probe watcher.
    pub async fn start(
        config: MonitorConfig,
        config_path: impl Into<String>,
    ) -> AppResult<Arc<Self>> {
        fs::create_dir_all(&config.work_dir).await?;
        let db_path = Path::new(&config.work_dir).join(DB_FILENAME);
        let (store, writer) = Store::open(&db_path).await?;
        info!("Database {} is opened successfully", db_path.display());

        let cancel = CancellationToken::new();
        tokio::spawn(writer.run(cancel.clone()));

        let monitor = Arc::new(Self {
            config_path: config_path.into(),
            config: RwLock::new(config),
            store,
            cancel: cancel.clone(),
            pipeline: Mutex::new(cancel.child_token()),
        });
        monitor.spawn_pipeline().await;
        Ok(monitor)
    }

    /// Starts a discoverer + watcher generation under a fresh child token so
    /// a reload can replace it without touching the writer.
    async fn spawn_pipeline(&self) {
        let config = self.config.read().await.clone();
        let token = self.cancel.child_token();
        *self.pipeline.lock().await = token.clone();

        let discoverer = Discoverer::new(
            self.store.clone(),
            config.zones.clone(),
            config.retransfer_delay(),
            config.tls_timeout(),
        );
        tokio::spawn(discoverer.run(token.clone()));

        let watcher = Watcher::new(
            self.store.clone(),
            Prober::new(config.tls_timeout()),
            config.max_threads,
            config.watcher_delay(),
        );
        tokio::spawn(watcher.run(token));
    }

    /// Re-reads the same configuration file and restarts the probe pipeline
    /// with the new thread count and delays. A failed read keeps the
    /// previous configuration. The database path cannot change at reload.
    pub async fn reload(&self) {
        let config = match MonitorConfig::load_config(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to reload the configuration: {}", e);
                return;
            }
        };

        *self.config.write().await = config;
        self.pipeline.lock().await.cancel();
        self.spawn_pipeline().await;
        info!("Configuration reloaded, probe pipeline restarted");
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.store.close().await;
        info!("Monitor stopped");
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A prober configured with the current TLS timeout, for on-demand
    /// checks.
    pub async fn prober(&self) -> Prober {
        Prober::new(self.config.read().await.tls_timeout())
    }
}
