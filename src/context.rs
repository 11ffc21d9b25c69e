//! Wiring: one place that turns a config into live stores.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::api::{CrewApi, HttpApi};
use crate::channel::{Connector, WsConnector};
use crate::config::CrewdeckConfig;
use crate::model::ExecutionRecord;
use crate::notify::NotificationQueue;
use crate::storage;
use crate::store::{CrewStore, ExecutionStore, Synced};

/// Everything a command needs, built once per process.
pub struct AppContext {
    pub config: CrewdeckConfig,
    pub api: Arc<dyn CrewApi>,
    pub notifications: NotificationQueue,
    pub executions: ExecutionStore,
    pub crews: CrewStore,
}

impl AppContext {
    /// Open storage, build the HTTP and websocket transports, and load the
    /// stores from disk.
    pub async fn open(config: CrewdeckConfig) -> Result<Self> {
        let api = HttpApi::new(&config.api).context("failed to build HTTP client")?;
        let connector = WsConnector::new(config.api.ws_url.clone());
        Self::with_transport(config, Arc::new(api), Arc::new(connector)).await
    }

    /// Same as [`open`](Self::open) with caller-supplied transports.
    pub async fn with_transport(
        config: CrewdeckConfig,
        api: Arc<dyn CrewApi>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        info!(db_path = %config.storage.db_path.display(), "opening database");
        let pool = storage::open_pool(&config.storage.db_path)?;
        let notifications = NotificationQueue::new(config.notifications.default_duration_ms);
        let fallback = config.behavior.fallback;

        let executions = ExecutionStore::new(
            api.clone(),
            connector,
            notifications.clone(),
            fallback,
            Some(pool.clone()),
        );
        let crews = CrewStore::new(api.clone(), fallback, Some(pool));
        executions.load().await?;
        crews.load().await?;

        Ok(Self {
            config,
            api,
            notifications,
            executions,
            crews,
        })
    }

    /// Launch a crew by id or name and count the launch against it.
    pub async fn execute(&self, crew: &str, params: Value) -> Result<Synced<ExecutionRecord>> {
        let found = self.crews.find_crew(crew).await;
        let (crew_id, crew_name) = match &found {
            Some(c) => (c.id.as_str(), Some(c.name.as_str())),
            None => {
                warn!(%crew, "crew not in local list, launching by id");
                (crew, None)
            }
        };
        let launched = self.executions.execute(crew_id, crew_name, params).await?;
        self.crews.record_execution(crew_id).await;
        Ok(launched)
    }

    /// Close the live channel and drop pending notifications.
    pub async fn shutdown(&self) {
        self.executions.shutdown().await;
        self.notifications.clear();
    }
}
