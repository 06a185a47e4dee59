use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::api_client::ApiClient;
use crate::config::{Config, ServerDefinition};
use crate::error::ProcessError;
use crate::monitor::{MonitorState, MonitoringEngine};
use crate::palworld::Palworld;
use crate::process::{ProcessEvent, ProcessState, ServerProcess};

/// Runtime of one managed server: its process, its monitor, and the task that
/// forwards process exits to the monitor.
pub struct ManagedServer {
    definition: ServerDefinition,
    process: Arc<ServerProcess>,
    monitor: MonitoringEngine<Palworld>,
    exit_listener: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    #[serde(flatten)]
    pub definition: ServerDefinition,
    pub process_state: ProcessState,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub monitor_state: MonitorState,
    pub subscribers: usize,
    pub online: bool,
}

impl ManagedServer {
    /// Attach a process handle and an API client to a stored definition.
    /// Must be called from within a tokio runtime.
    pub fn new(definition: ServerDefinition, api_timeout: Duration) -> Self {
        let process = Arc::new(
            ServerProcess::new(definition.id.clone(), definition.executable())
                .with_working_dir(&definition.folder_path),
        );

        let client = definition.api_url().and_then(|url| {
            match ApiClient::new(&url, api_timeout) {
                Ok(client) => Some(match definition.credentials() {
                    Some((user, pass)) => client.with_basic_auth(user, pass),
                    None => client,
                }),
                Err(e) => {
                    tracing::warn!("Server '{}' has an unusable API URL: {}", definition.id, e);
                    None
                }
            }
        });

        let monitor = MonitoringEngine::new(
            definition.clone(),
            Palworld::new(&definition),
            client,
            process.clone(),
        );

        let exit_listener = tokio::spawn(forward_exits(process.subscribe_events(), monitor.clone()));

        Self {
            definition,
            process,
            monitor,
            exit_listener,
        }
    }

    /// Build and initialize. A settings file that cannot be read is logged and
    /// the defaults are kept.
    pub async fn load(definition: ServerDefinition, api_timeout: Duration) -> Arc<Self> {
        let server = Self::new(definition, api_timeout);
        if let Err(e) = server.monitor.initialize().await {
            tracing::warn!("Failed to initialize server '{}': {:#}", server.definition.id, e);
        }
        Arc::new(server)
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &ServerDefinition {
        &self.definition
    }

    pub fn process(&self) -> &ServerProcess {
        &self.process
    }

    pub fn monitor(&self) -> &MonitoringEngine<Palworld> {
        &self.monitor
    }

    pub async fn start(&self) -> Result<(), ProcessError> {
        self.process.start().await
    }

    pub async fn stop(&self) -> Result<(), ProcessError> {
        self.process.stop().await
    }

    pub async fn restart(&self) -> Result<(), ProcessError> {
        self.process.stop().await?;
        self.process.start().await
    }

    pub fn summary(&self) -> ServerSummary {
        ServerSummary {
            definition: self.definition.clone(),
            process_state: self.process.state(),
            pid: self.process.pid(),
            uptime_secs: self.process.uptime().map(|d| d.as_secs()),
            monitor_state: self.monitor.state(),
            subscribers: self.monitor.subscriber_count(),
            online: self.monitor.snapshot().is_online(),
        }
    }

    /// Stop monitoring, stop the process, release everything. Safe to repeat.
    pub async fn dispose(&self) {
        self.monitor.shutdown();
        self.process.dispose().await;
        self.exit_listener.abort();
        tracing::info!("Disposed server '{}'", self.definition.id);
    }
}

async fn forward_exits(mut events: broadcast::Receiver<ProcessEvent>, monitor: MonitoringEngine<Palworld>) {
    loop {
        match events.recv().await {
            Ok(ProcessEvent::Exited { .. }) => monitor.process_stopped().await,
            Ok(ProcessEvent::Started { .. }) => monitor.process_started(),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<Config>>,
    pub config_path: PathBuf,
    pub servers: Arc<DashMap<String, Arc<ManagedServer>>>,
}

impl AppState {
    pub fn new(config: Config, config_path: PathBuf) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
            servers: Arc::new(DashMap::new()),
        }
    }

    pub async fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.config.read().await.agent.api_timeout_secs.max(1))
    }

    /// Build a runtime for every stored definition.
    pub async fn load_servers(&self) {
        let (definitions, timeout) = {
            let config = self.config.read().await;
            (
                config.servers.clone(),
                Duration::from_secs(config.agent.api_timeout_secs.max(1)),
            )
        };
        for definition in definitions {
            let server = ManagedServer::load(definition, timeout).await;
            self.servers.insert(server.id().to_string(), server);
        }
    }

    pub fn server(&self, id: &str) -> Option<Arc<ManagedServer>> {
        self.servers.get(id).map(|s| s.value().clone())
    }

    /// Swap in a runtime for a new or changed definition, disposing the old one.
    pub async fn replace_server(&self, definition: ServerDefinition) -> Arc<ManagedServer> {
        let timeout = self.api_timeout().await;
        let server = ManagedServer::load(definition, timeout).await;
        if let Some(old) = self.servers.insert(server.id().to_string(), server.clone()) {
            old.dispose().await;
        }
        server
    }

    pub async fn remove_server(&self, id: &str) {
        if let Some((_, server)) = self.servers.remove(id) {
            server.dispose().await;
        }
    }

    pub async fn dispose_all(&self) {
        let servers: Vec<Arc<ManagedServer>> = self.servers.iter().map(|s| s.value().clone()).collect();
        for server in servers {
            server.dispose().await;
        }
    }
}
