//! Process context
//!
//! [`Orca`] is built once at process start and owns every component:
//!
//! 1. Secrets (env var first, keyring fallback)
//! 2. Message bus, optionally forwarded to an external [`StatusPublisher`]
//! 3. Endpoint lifecycle manager with its idle monitor
//! 4. Harmony client
//! 5. Tool orchestrator (catalog loaded during init)
//! 6. Task orchestrator
//!
//! # Graceful Shutdown
//!
//! On SIGINT/SIGTERM (`serve`) or an explicit [`Orca::shutdown`]:
//! 1. Publishes `DaemonStopping` and refuses new task starts
//! 2. Waits up to `shutdown_grace_secs` for running task loops
//! 3. Asks the remaining loops to stop and waits for them to finalize
//! 4. Stops the idle monitor and queue consumers
//! 5. Closes the bus and lets the forwarder relay the final statuses

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use sdk::errors::EngineError;
use sdk::queue::{StatusPublisher, TaskQueue};

use crate::config::Config;
use crate::harmony::{HarmonyClient, ModelClient};
use crate::lifecycle::LifecycleManager;
use crate::message_bus::{Event, MessageBus};
use crate::orchestrator::{run_queue_consumer, ShutdownReport, TaskOrchestrator};
use crate::secrets::{SecretCache, SecretManager};
use crate::tools::ToolOrchestrator;

/// Upper bound on relaying buffered events during shutdown
const FORWARDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Result type for daemon operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// The assembled engine
pub struct Orca {
    config: Config,
    secrets: Arc<SecretManager>,
    bus: Arc<MessageBus>,
    lifecycle: Arc<LifecycleManager>,
    model: Arc<HarmonyClient>,
    tools: Arc<ToolOrchestrator>,
    orchestrator: TaskOrchestrator,

    /// Shutdown flag shared with background loops
    shutdown_flag: Arc<AtomicBool>,

    /// Idle monitor and queue consumers
    background: Vec<JoinHandle<()>>,

    /// Relays bus events to the external publisher; drained last
    forwarder: Option<JoinHandle<()>>,
}

impl Orca {
    /// Build every component from `config`.
    pub async fn init(config: Config) -> Result<Self> {
        Self::init_with_publisher(config, None).await
    }

    /// Like [`init`](Self::init), forwarding status events to `publisher`.
    ///
    /// # Errors
    /// `Config` on an invalid configuration, `Conflict` when the strict
    /// tool catalog finds a name collision.
    pub async fn init_with_publisher(
        config: Config,
        publisher: Option<Arc<dyn StatusPublisher>>,
    ) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            endpoints = config.endpoints.len(),
            tool_backends = config.tools.backends.len(),
            "Initializing engine"
        );

        let secrets = Arc::new(SecretManager::new(&config.core.keyring_service));
        let cache = SecretCache::new(Arc::clone(&secrets));

        let bus = Arc::new(MessageBus::new());
        let mut background = Vec::new();
        let mut forwarder = None;
        if let Some(publisher) = publisher {
            forwarder = Some(bus.spawn_forwarder(publisher).await);
            tracing::debug!("Status forwarder attached");
        }

        let lifecycle = Arc::new(
            LifecycleManager::from_config(&config, &cache)?.with_message_bus(Arc::clone(&bus)),
        );
        let model = Arc::new(HarmonyClient::from_config(&config, &cache)?);

        let tools = Arc::new(ToolOrchestrator::from_config(&config, &cache).await?);
        bus.publish(Event::CatalogLoaded {
            tools: tools.catalog_size(),
            backends: config.tools.backends.len(),
        })
        .await;
        for backend in tools.unreachable_backends() {
            tracing::warn!(backend = %backend, "Tool backend unreachable at startup");
        }

        let endpoint_defaults: HashMap<_, _> = config
            .endpoints
            .iter()
            .map(|e| (e.key.clone(), e.default_settings()))
            .collect();

        let orchestrator = TaskOrchestrator::new(
            config.orchestrator.clone(),
            endpoint_defaults,
            Arc::clone(&model) as Arc<dyn ModelClient>,
            Arc::clone(&lifecycle),
            Arc::clone(&tools),
            Arc::clone(&bus),
        );

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        background.push(Arc::clone(&lifecycle).spawn_idle_monitor(
            config.orchestrator.idle_check_interval(),
            Arc::clone(&shutdown_flag),
        ));

        bus.publish(Event::DaemonStarted).await;
        tracing::info!(tools = tools.catalog_size(), "Engine ready");

        Ok(Self {
            config,
            secrets,
            bus,
            lifecycle,
            model,
            tools,
            orchestrator,
            shutdown_flag,
            background,
            forwarder,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn secrets(&self) -> &Arc<SecretManager> {
        &self.secrets
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn model(&self) -> &Arc<HarmonyClient> {
        &self.model
    }

    pub fn tools(&self) -> &Arc<ToolOrchestrator> {
        &self.tools
    }

    pub fn orchestrator(&self) -> &TaskOrchestrator {
        &self.orchestrator
    }

    /// Consume start requests from `key` until shutdown.
    pub fn start_queue_consumer(&mut self, queue: Arc<dyn TaskQueue>, key: impl Into<String>) {
        let handle = run_queue_consumer(
            self.orchestrator.clone(),
            queue,
            key.into(),
            Arc::clone(&self.shutdown_flag),
        );
        self.background.push(handle);
    }

    /// Signals the background loops to stop
    pub fn signal_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown_signaled(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    /// Block until the shutdown flag is set
    pub async fn wait_for_shutdown(&self) {
        while !self.is_shutdown_signaled() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Drain in-flight tasks and stop the background loops.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        tracing::info!("Starting graceful shutdown");
        self.bus.publish(Event::DaemonStopping).await;

        let grace = self.config.orchestrator.shutdown_grace();
        let report = self.orchestrator.shutdown(grace).await;
        if report.cancelled > 0 {
            tracing::warn!(
                cancelled = report.cancelled,
                "Tasks still running after {}s were asked to stop",
                grace.as_secs()
            );
        } else {
            tracing::info!(drained = report.drained, "All in-flight tasks finished");
        }

        self.signal_shutdown();
        for handle in self.background.drain(..) {
            handle.abort();
        }

        // The forwarder ends once it has relayed the final task statuses
        self.bus.close().await;
        if let Some(mut forwarder) = self.forwarder.take() {
            if tokio::time::timeout(FORWARDER_DRAIN_TIMEOUT, &mut forwarder)
                .await
                .is_err()
            {
                tracing::warn!("Status forwarder did not drain in time");
                forwarder.abort();
            }
        }

        tracing::info!("Graceful shutdown completed");
        report
    }

    /// Set the shutdown flag on SIGINT or SIGTERM
    #[cfg(unix)]
    pub fn setup_signal_handler(shutdown_flag: Arc<AtomicBool>) -> JoinHandle<()> {
        use tokio::signal::unix::{signal, SignalKind};

        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    if tokio::signal::ctrl_c().await.is_ok() {
                        shutdown_flag.store(true, Ordering::Relaxed);
                    }
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT signal"),
            }
            shutdown_flag.store(true, Ordering::Relaxed);
        })
    }

    #[cfg(not(unix))]
    pub fn setup_signal_handler(shutdown_flag: Arc<AtomicBool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl-C");
                shutdown_flag.store(true, Ordering::Relaxed);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;

    fn offline_config() -> Config {
        let mut config = Config::default_config();
        // Nothing listens here; init must not need the endpoints to be up
        config.endpoints = vec![EndpointConfig::new("20b", "http://127.0.0.1:9", "gpt-oss-20b")];
        config.orchestrator.shutdown_grace_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_init_without_network() {
        let orca = Orca::init(offline_config()).await.unwrap();
        assert_eq!(orca.lifecycle().keys(), vec!["20b".to_string()]);
        assert_eq!(orca.tools().catalog_size(), 0);
        assert!(!orca.is_shutdown_signaled());
    }

    #[tokio::test]
    async fn test_init_rejects_invalid_config() {
        let mut config = offline_config();
        config.endpoints.clear();
        assert!(matches!(
            Orca::init(config).await,
            Err(EngineError::Config(_))
        ));
    }

    struct Recorder(std::sync::Mutex<Vec<(String, String)>>);

    #[async_trait::async_trait]
    impl StatusPublisher for Recorder {
        async fn publish(&self, channel: &str, payload: String) -> std::result::Result<(), EngineError> {
            self.0.lock().unwrap().push((channel.to_string(), payload));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_publishes_final_task_status() {
        let recorder = Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        let mut orca = Orca::init_with_publisher(
            offline_config(),
            Some(Arc::clone(&recorder) as Arc<dyn StatusPublisher>),
        )
        .await
        .unwrap();
        let id = orca
            .orchestrator()
            .create_task("t", "d", "20b", Default::default())
            .await
            .unwrap();
        orca.orchestrator().start_task(&id).await.unwrap();

        orca.shutdown().await;

        let status = orca.orchestrator().get_task_status(&id).unwrap().status;
        assert!(status.is_terminal());

        let channel = format!("orca:task:{}", id);
        let events = recorder.0.lock().unwrap();
        let (_, last) = events.iter().filter(|(c, _)| *c == channel).last().unwrap();
        let payload: serde_json::Value = serde_json::from_str(last).unwrap();
        assert_eq!(payload["status"], status.as_str());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_tasks() {
        let mut orca = Orca::init(offline_config()).await.unwrap();
        let id = orca
            .orchestrator()
            .create_task("t", "d", "20b", Default::default())
            .await
            .unwrap();

        let report = orca.shutdown().await;
        assert_eq!(report.cancelled, 0);
        assert!(orca.is_shutdown_signaled());
        assert!(matches!(
            orca.orchestrator().start_task(&id).await,
            Err(EngineError::Conflict(_))
        ));
    }
}
