//! Service Framework
//!
//! Lifecycle plumbing for the engine's background work:
//! - [`Service`] trait implemented by long-running tasks
//! - [`ServiceManager`] that spawns them and stops them on shutdown
//! - Shutdown is a broadcast; every service gets its own receiver

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// Service Trait
// ============================================================================

/// A background task owned by a [`ServiceManager`]
///
/// `start` runs the service's main loop and must return once the shutdown
/// receiver fires.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Run until shutdown is signalled
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError>;

    /// Name used for registration and logging
    fn name(&self) -> &'static str;

    /// Current status
    fn status(&self) -> ServiceStatus;
}

// ============================================================================
// Service Status
// ============================================================================

/// Status of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Registered, main loop not entered yet
    Starting,

    /// Main loop running
    Running,

    /// Shutdown received, finishing outstanding work
    Stopping,

    /// Main loop exited cleanly
    Stopped,

    /// Main loop exited with an error
    Failed(String),
}

impl ServiceStatus {
    /// Check if the service is in a healthy state
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceStatus::Running)
    }

    /// Check if the service has stopped (normally or due to failure)
    pub fn is_stopped(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed(_))
    }
}

// ============================================================================
// Service Error
// ============================================================================

/// Errors that can occur in services
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Service failed during initialization phase
    #[error("Service initialization failed: {0}")]
    InitializationFailed(String),

    /// Service encountered an error during execution
    #[error("Service runtime error: {0}")]
    RuntimeError(String),

    /// A service with the same name is registered, or the manager is running
    #[error("Service already running")]
    AlreadyRunning,

    /// The requested service was not found in the registry
    #[error("Service not found: {0}")]
    NotFound(String),
}

// ============================================================================
// Service Config
// ============================================================================

/// Configuration for the service manager
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How long shutdown waits for services before giving up on them
    pub shutdown_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Service Manager
// ============================================================================

struct ServiceHandle {
    service: Arc<dyn Service>,
    task: Option<JoinHandle<Result<(), ServiceError>>>,
    started_at: Option<Instant>,
}

/// Starts registered services and stops them together
pub struct ServiceManager {
    config: ServiceConfig,
    services: RwLock<HashMap<&'static str, ServiceHandle>>,
    shutdown_tx: broadcast::Sender<()>,
    running: RwLock<bool>,
}

impl ServiceManager {
    /// Create a new service manager
    pub fn new(config: ServiceConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            services: RwLock::new(HashMap::new()),
            shutdown_tx,
            running: RwLock::new(false),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ServiceConfig::default())
    }

    /// Register a service; names must be unique
    pub fn register(&self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let name = service.name();
        let mut services = self.services.write();

        if services.contains_key(name) {
            return Err(ServiceError::AlreadyRunning);
        }

        services.insert(
            name,
            ServiceHandle {
                service,
                task: None,
                started_at: None,
            },
        );

        tracing::debug!(service = name, "Service registered");
        Ok(())
    }

    /// Spawn every registered service
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_all(&self) -> Result<(), ServiceError> {
        {
            let mut running = self.running.write();
            if *running {
                return Err(ServiceError::AlreadyRunning);
            }
            *running = true;
        }

        let names: Vec<&'static str> = self.services.read().keys().copied().collect();
        for name in names {
            self.start_service(name)?;
        }

        tracing::info!(services = self.services.read().len(), "Background services started");
        Ok(())
    }

    /// Spawn one registered service
    pub fn start_service(&self, name: &'static str) -> Result<(), ServiceError> {
        let mut services = self.services.write();
        let handle = services
            .get_mut(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
        if handle.task.as_ref().map_or(false, |task| !task.is_finished()) {
            return Err(ServiceError::AlreadyRunning);
        }

        let service = Arc::clone(&handle.service);
        let shutdown_rx = self.shutdown_tx.subscribe();
        handle.task = Some(tokio::spawn(async move { service.start(shutdown_rx).await }));
        handle.started_at = Some(Instant::now());

        tracing::debug!(service = name, "Service started");
        Ok(())
    }

    /// Signal shutdown and wait for every service, bounded by the timeout
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        tracing::info!("Initiating graceful shutdown");

        let _ = self.shutdown_tx.send(());

        // Lock is released before awaiting
        let tasks: Vec<(&'static str, JoinHandle<Result<(), ServiceError>>)> = {
            let mut services = self.services.write();
            services
                .iter_mut()
                .filter_map(|(name, handle)| handle.task.take().map(|task| (*name, task)))
                .collect()
        };

        let deadline = Instant::now() + self.config.shutdown_timeout;

        for (name, task) in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());

            match tokio::time::timeout(remaining, task).await {
                Ok(Ok(Ok(()))) => {
                    tracing::debug!(service = name, "Service stopped gracefully");
                },
                Ok(Ok(Err(e))) => {
                    tracing::warn!(service = name, error = %e, "Service stopped with error");
                },
                Ok(Err(e)) => {
                    tracing::error!(service = name, error = %e, "Service task panicked");
                },
                Err(_) => {
                    tracing::warn!(service = name, "Service shutdown timed out");
                },
            }
        }

        *self.running.write() = false;
        tracing::info!("Shutdown complete");
        Ok(())
    }

    /// Whether `start_all` has run without a matching `shutdown`
    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    /// Status of every registered service
    pub fn status(&self) -> HashMap<&'static str, ServiceStatus> {
        self.services
            .read()
            .iter()
            .map(|(name, handle)| (*name, handle.service.status()))
            .collect()
    }

    /// Status of one service
    pub fn service_status(&self, name: &str) -> Option<ServiceStatus> {
        self.services.read().get(name).map(|h| h.service.status())
    }

    /// Time since a service was spawned
    pub fn service_uptime(&self, name: &str) -> Option<Duration> {
        self.services
            .read()
            .get(name)
            .and_then(|h| h.started_at.map(|started| started.elapsed()))
    }

    /// Check if all services are healthy
    pub fn is_healthy(&self) -> bool {
        self.services
            .read()
            .values()
            .all(|h| h.service.status().is_healthy())
    }
}

// ============================================================================
// Tests
// ============================================================================
