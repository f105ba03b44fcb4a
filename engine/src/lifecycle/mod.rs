//! Endpoint Lifecycle Manager
//!
//! Owns the warm/cold state of every configured model endpoint:
//!
//! ```text
//! Stopped --wake--> Starting --ready--> Running --idle_timeout--> Idle
//!    ^                                     ^                        |
//!    |                                     +---------wake-----------+
//!    +------------sleep / sleep_after_idle-------------------------+
//! ```
//!
//! Transitions on one endpoint are serialized by an async mutex, so
//! concurrent tasks waking the same endpoint issue one scale-up between
//! them. Generation activity is tracked through [`EndpointLease`] guards;
//! an endpoint with a live lease never goes idle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use sdk::errors::EngineError;

use crate::config::{Config, EndpointConfig, RetryConfig};
use crate::message_bus::{Event, MessageBus};
use crate::retry::retry_with_backoff;
use crate::secrets::SecretCache;

pub mod provider;

pub use provider::{EndpointProvider, HttpEndpointProvider, ProviderError};

/// Lifecycle state of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    Stopped,
    Starting,
    Running,
    Idle,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointState::Stopped => "stopped",
            EndpointState::Starting => "starting",
            EndpointState::Running => "running",
            EndpointState::Idle => "idle",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub key: String,
    pub state: EndpointState,
    pub last_used: Option<DateTime<Utc>>,
    pub idle_timeout_secs: u64,
    pub provider: String,
    pub base_url: String,
    pub in_flight: usize,
}

/// Static description of an endpoint, registered once
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub key: String,
    pub base_url: String,
    pub idle_timeout: Duration,
    pub sleep_after_idle: Duration,
}

impl From<&EndpointConfig> for EndpointSpec {
    fn from(config: &EndpointConfig) -> Self {
        Self {
            key: config.key.clone(),
            base_url: config.base_url.clone(),
            idle_timeout: config.idle_timeout(),
            sleep_after_idle: config.sleep_after_idle(),
        }
    }
}

struct Runtime {
    state: EndpointState,
    last_used: Option<DateTime<Utc>>,
    last_activity: Instant,
    in_flight: usize,
}

struct Endpoint {
    spec: EndpointSpec,
    provider: Arc<dyn EndpointProvider>,
    /// Serializes state transitions and provider calls
    transition: Mutex<()>,
    runtime: StdMutex<Runtime>,
}

impl Endpoint {
    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn state(&self) -> EndpointState {
        self.runtime().state
    }

    fn touch(&self) {
        let mut rt = self.runtime();
        rt.last_activity = Instant::now();
        rt.last_used = Some(Utc::now());
    }

    fn status(&self) -> EndpointStatus {
        let rt = self.runtime();
        EndpointStatus {
            key: self.spec.key.clone(),
            state: rt.state,
            last_used: rt.last_used,
            idle_timeout_secs: self.spec.idle_timeout.as_secs(),
            provider: self.provider.name().to_string(),
            base_url: self.spec.base_url.clone(),
            in_flight: rt.in_flight,
        }
    }
}

/// RAII marker of generation activity on an endpoint
///
/// Holding a lease keeps the endpoint out of Idle. Dropping it records the
/// end of the activity, which restarts the idle clock.
pub struct EndpointLease {
    endpoint: Arc<Endpoint>,
}

impl EndpointLease {
    pub fn key(&self) -> &str {
        &self.endpoint.spec.key
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        let mut rt = self.endpoint.runtime();
        rt.in_flight = rt.in_flight.saturating_sub(1);
        rt.last_activity = Instant::now();
        rt.last_used = Some(Utc::now());
    }
}

/// A state change made by [`LifecycleManager::sweep_idle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub key: String,
    pub from: EndpointState,
    pub to: EndpointState,
}

/// Owner of all endpoint state
pub struct LifecycleManager {
    endpoints: HashMap<String, Arc<Endpoint>>,
    retry: RetryConfig,
    poll_interval: Duration,
    bus: Option<Arc<MessageBus>>,
}

impl LifecycleManager {
    pub fn new(retry: RetryConfig, poll_interval: Duration) -> Self {
        Self {
            endpoints: HashMap::new(),
            retry,
            poll_interval,
            bus: None,
        }
    }

    /// Publish state changes on `bus`
    pub fn with_message_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Register an endpoint. Every endpoint starts Stopped.
    pub fn register(&mut self, spec: EndpointSpec, provider: Arc<dyn EndpointProvider>) {
        tracing::debug!(endpoint = %spec.key, provider = provider.name(), "Registered endpoint");
        let endpoint = Endpoint {
            spec,
            provider,
            transition: Mutex::new(()),
            runtime: StdMutex::new(Runtime {
                state: EndpointState::Stopped,
                last_used: None,
                last_activity: Instant::now(),
                in_flight: 0,
            }),
        };
        self.endpoints
            .insert(endpoint.spec.key.clone(), Arc::new(endpoint));
    }

    /// Register every configured endpoint with an HTTP control plane provider
    pub fn from_config(config: &Config, secrets: &SecretCache) -> Result<Self, EngineError> {
        let mut manager = Self::new(
            config.retry.clone(),
            config.orchestrator.wake_poll_interval(),
        );
        for endpoint in &config.endpoints {
            let api_key = secrets.get_opt(endpoint.api_key_env.as_deref())?;
            let provider =
                HttpEndpointProvider::new(&endpoint.provider, endpoint.control_url(), api_key)?;
            manager.register(EndpointSpec::from(endpoint), Arc::new(provider));
        }
        Ok(manager)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.endpoints.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn contains(&self, key: &str) -> bool {
        self.endpoints.contains_key(key)
    }

    fn get(&self, key: &str) -> Result<&Arc<Endpoint>, EngineError> {
        self.endpoints
            .get(key)
            .ok_or_else(|| EngineError::NotFound(format!("endpoint '{}'", key)))
    }

    async fn set_state(&self, endpoint: &Endpoint, to: EndpointState) {
        let from = {
            let mut rt = endpoint.runtime();
            let from = rt.state;
            rt.state = to;
            if to == EndpointState::Running {
                rt.last_activity = Instant::now();
            }
            from
        };
        if from == to {
            return;
        }

        tracing::info!(endpoint = %endpoint.spec.key, %from, %to, "Endpoint state changed");
        if let Some(bus) = &self.bus {
            bus.publish(Event::EndpointStateChanged {
                key: endpoint.spec.key.clone(),
                from,
                to,
            })
            .await;
        }
    }

    /// Request that an endpoint be brought up.
    ///
    /// Idempotent: Starting and Running return at once without a provider
    /// call. Idle promotes straight to Running. Stopped issues a scale-up
    /// and moves to Starting, or to Running if the provider already
    /// reports ready.
    pub async fn wake(&self, key: &str) -> Result<EndpointState, EngineError> {
        let endpoint = self.get(key)?;
        let _guard = endpoint.transition.lock().await;

        match endpoint.state() {
            state @ (EndpointState::Starting | EndpointState::Running) => Ok(state),
            EndpointState::Idle => {
                self.set_state(endpoint, EndpointState::Running).await;
                Ok(EndpointState::Running)
            }
            EndpointState::Stopped => {
                tracing::info!(endpoint = key, "Waking endpoint");
                let provider = Arc::clone(&endpoint.provider);
                retry_with_backoff(
                    &self.retry,
                    "endpoint.scale_up",
                    |_| provider.scale_up(),
                    ProviderError::is_transient,
                )
                .await?;

                self.set_state(endpoint, EndpointState::Starting).await;
                self.check_ready(endpoint).await
            }
        }
    }

    /// Probe a Starting endpoint and promote it when ready.
    /// Caller holds the transition lock.
    async fn check_ready(&self, endpoint: &Endpoint) -> Result<EndpointState, EngineError> {
        if endpoint.state() != EndpointState::Starting {
            return Ok(endpoint.state());
        }

        match endpoint.provider.is_ready().await {
            Ok(true) => {
                self.set_state(endpoint, EndpointState::Running).await;
                Ok(EndpointState::Running)
            }
            Ok(false) => Ok(EndpointState::Starting),
            Err(ProviderError::Transient(e)) => {
                tracing::debug!(endpoint = %endpoint.spec.key, "Readiness probe failed: {}", e);
                Ok(EndpointState::Starting)
            }
            Err(e @ ProviderError::Rejected(_)) => {
                tracing::warn!(endpoint = %endpoint.spec.key, "Readiness probe rejected: {}", e);
                self.set_state(endpoint, EndpointState::Stopped).await;
                Err(e.into())
            }
        }
    }

    /// Wait until an endpoint is Running, polling readiness every
    /// `poll_interval`. A Stopped endpoint is woken; an Idle one promoted.
    ///
    /// `timeout` bounds the whole wait, including scale-up retries and
    /// readiness probes that hang.
    ///
    /// # Errors
    /// `ResourceUnavailable` when `timeout` elapses first.
    pub async fn wait_until_running(&self, key: &str, timeout: Duration) -> Result<(), EngineError> {
        let endpoint = self.get(key)?;
        let deadline = Instant::now() + timeout;

        let polled = self.poll_until_running(endpoint, deadline, timeout);
        match tokio::time::timeout_at(deadline, polled).await {
            Ok(result) => result,
            Err(_) => Err(not_running(key, timeout)),
        }
    }

    async fn poll_until_running(
        &self,
        endpoint: &Endpoint,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let key = endpoint.spec.key.as_str();
        loop {
            let state = match endpoint.state() {
                EndpointState::Running => EndpointState::Running,
                EndpointState::Stopped | EndpointState::Idle => self.wake(key).await?,
                EndpointState::Starting => {
                    let _guard = endpoint.transition.lock().await;
                    self.check_ready(endpoint).await?
                }
            };

            if state == EndpointState::Running {
                endpoint.touch();
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(not_running(key, timeout));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Wake an endpoint and wait for it to be Running, all within `timeout`
    pub async fn ensure_running(&self, key: &str, timeout: Duration) -> Result<(), EngineError> {
        self.wait_until_running(key, timeout).await
    }

    /// Put an endpoint to sleep. Stopped once the provider acknowledges.
    pub async fn sleep(&self, key: &str) -> Result<EndpointState, EngineError> {
        let endpoint = self.get(key)?;
        let _guard = endpoint.transition.lock().await;

        if endpoint.state() == EndpointState::Stopped {
            return Ok(EndpointState::Stopped);
        }

        let in_flight = endpoint.runtime().in_flight;
        if in_flight > 0 {
            tracing::warn!(endpoint = key, in_flight, "Sleeping endpoint with generations in flight");
        }

        let provider = Arc::clone(&endpoint.provider);
        retry_with_backoff(
            &self.retry,
            "endpoint.scale_down",
            |_| provider.scale_down(),
            ProviderError::is_transient,
        )
        .await?;

        self.set_state(endpoint, EndpointState::Stopped).await;
        Ok(EndpointState::Stopped)
    }

    /// Adopt an endpoint that is already up outside this process.
    ///
    /// A Stopped endpoint whose provider reports ready becomes Running.
    /// Other states are left alone.
    pub async fn refresh_state(&self, key: &str) -> Result<EndpointState, EngineError> {
        let endpoint = self.get(key)?;
        let _guard = endpoint.transition.lock().await;

        if endpoint.state() == EndpointState::Stopped
            && matches!(endpoint.provider.is_ready().await, Ok(true))
        {
            tracing::debug!(endpoint = key, "Adopting endpoint that is already up");
            self.set_state(endpoint, EndpointState::Running).await;
        }
        Ok(endpoint.state())
    }

    /// Provider readiness probe; never changes state
    pub async fn is_available(&self, key: &str) -> Result<bool, EngineError> {
        let endpoint = self.get(key)?;
        Ok(matches!(endpoint.provider.is_ready().await, Ok(true)))
    }

    pub fn status(&self, key: &str) -> Result<EndpointStatus, EngineError> {
        Ok(self.get(key)?.status())
    }

    /// Status of every endpoint, ordered by key
    pub fn statuses(&self) -> Vec<EndpointStatus> {
        let mut statuses: Vec<EndpointStatus> =
            self.endpoints.values().map(|e| e.status()).collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }

    /// Mark the start of generation activity.
    ///
    /// Only a warm (Running or Idle) endpoint can be leased; Idle is
    /// promoted back to Running.
    pub async fn lease(&self, key: &str) -> Result<EndpointLease, EngineError> {
        let endpoint = self.get(key)?;
        let _guard = endpoint.transition.lock().await;

        match endpoint.state() {
            EndpointState::Running => {}
            EndpointState::Idle => self.set_state(endpoint, EndpointState::Running).await,
            state @ (EndpointState::Stopped | EndpointState::Starting) => {
                return Err(EngineError::ResourceUnavailable(format!(
                    "endpoint '{}' is {}",
                    key, state
                )));
            }
        }

        {
            let mut rt = endpoint.runtime();
            rt.in_flight += 1;
            rt.last_activity = Instant::now();
            rt.last_used = Some(Utc::now());
        }

        Ok(EndpointLease {
            endpoint: Arc::clone(endpoint),
        })
    }

    /// One pass of the idle control loop.
    ///
    /// At most one transition per endpoint per pass:
    /// - Starting becomes Running once the provider reports ready
    /// - Running becomes Idle after `idle_timeout` without activity
    /// - Idle is put to sleep after a further `sleep_after_idle`
    ///
    /// Endpoints whose transition lock is held are skipped this pass.
    pub async fn sweep_idle(&self) -> Vec<Transition> {
        let mut transitions = Vec::new();

        for endpoint in self.endpoints.values() {
            let Ok(_guard) = endpoint.transition.try_lock() else {
                continue;
            };

            let (state, in_flight, idle_for) = {
                let rt = endpoint.runtime();
                (rt.state, rt.in_flight, rt.last_activity.elapsed())
            };

            let to = match state {
                EndpointState::Starting => match self.check_ready(endpoint).await {
                    Ok(EndpointState::Running) => Some(EndpointState::Running),
                    Ok(_) => None,
                    Err(_) => Some(EndpointState::Stopped),
                },
                EndpointState::Running
                    if in_flight == 0 && idle_for >= endpoint.spec.idle_timeout =>
                {
                    self.set_state(endpoint, EndpointState::Idle).await;
                    Some(EndpointState::Idle)
                }
                EndpointState::Idle
                    if in_flight == 0
                        && idle_for >= endpoint.spec.idle_timeout + endpoint.spec.sleep_after_idle =>
                {
                    let provider = Arc::clone(&endpoint.provider);
                    match retry_with_backoff(
                        &self.retry,
                        "endpoint.scale_down",
                        |_| provider.scale_down(),
                        ProviderError::is_transient,
                    )
                    .await
                    {
                        Ok(()) => {
                            self.set_state(endpoint, EndpointState::Stopped).await;
                            Some(EndpointState::Stopped)
                        }
                        Err(e) => {
                            tracing::warn!(endpoint = %endpoint.spec.key, "Idle sleep failed: {}", e);
                            None
                        }
                    }
                }
                _ => None,
            };

            if let Some(to) = to {
                transitions.push(Transition {
                    key: endpoint.spec.key.clone(),
                    from: state,
                    to,
                });
            }
        }

        transitions
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `interval` until
    /// `shutdown` is set.
    pub fn spawn_idle_monitor(
        self: Arc<Self>,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    tracing::debug!("Idle monitor stopping");
                    break;
                }
                let transitions = self.sweep_idle().await;
                if !transitions.is_empty() {
                    tracing::debug!(count = transitions.len(), "Idle sweep made transitions");
                }
            }
        })
    }
}

fn not_running(key: &str, timeout: Duration) -> EngineError {
    tracing::warn!(endpoint = key, ?timeout, "Endpoint did not become ready in time");
    EngineError::ResourceUnavailable(format!(
        "endpoint '{}' not running after {}s",
        key,
        timeout.as_secs_f64()
    ))
}
