//! Engine builder and facade
//!
//! [`RollupEngine`] wires the rule registry, accumulator, collector, analyzer
//! and collaborators together from a [`Config`]. Collaborators can be swapped
//! through [`RollupEngineBuilder`].

use std::sync::Arc;

use tracing::{debug, info};

use crate::aggregation::{
    Collector, CollectorService, EventAggregator, EventAnalyzer, FlushReport, FlushScope,
    IngestReport, LiveAccumulator, QueryRequest, QueryResult,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, StorageBackend};
use crate::error::{Error, Result, ValidationError};
use crate::metastore::{InMemoryMetastore, Metastore, ProjectApiKeys};
use crate::metrics;
use crate::rule::{AggregationRule, RuleId, RuleRegistry};
use crate::services::{ServiceConfig, ServiceManager, ServiceStatus};
use crate::storage::{BucketStore, LocalDiskBucketStore, MemoryBucketStore};
use crate::types::Event;

/// Builder for a rollup engine with custom collaborators
pub struct RollupEngineBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    metastore: Option<Arc<dyn Metastore>>,
    store: Option<Arc<dyn BucketStore>>,
}

impl RollupEngineBuilder {
    /// Create a builder with the default configuration
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            clock: None,
            metastore: None,
            store: None,
        }
    }

    /// Set engine configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use a custom time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a custom metastore instead of the in-memory one
    pub fn with_metastore(mut self, metastore: Arc<dyn Metastore>) -> Self {
        self.metastore = Some(metastore);
        self
    }

    /// Use a custom bucket store instead of the configured backend
    pub fn with_store(mut self, store: Arc<dyn BucketStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate the configuration and assemble the engine
    pub fn build(self) -> Result<RollupEngine> {
        let config = self.config;
        config.validate()?;
        metrics::set_enabled(config.monitoring.metrics_enabled);

        let store: Arc<dyn BucketStore> = match self.store {
            Some(store) => store,
            None => match config.storage.backend {
                StorageBackend::Memory => Arc::new(MemoryBucketStore::new()),
                StorageBackend::LocalDisk => {
                    Arc::new(LocalDiskBucketStore::open(&config.storage.data_dir)?)
                },
            },
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metastore = self
            .metastore
            .unwrap_or_else(|| Arc::new(InMemoryMetastore::new()));

        let accumulator = Arc::new(LiveAccumulator::new(config.engine.unique_precision));
        let stored_generation = store.max_generation()?;
        accumulator.resume_after(stored_generation);

        let registry = Arc::new(RuleRegistry::new());
        let aggregator = EventAggregator::new(
            Arc::clone(&registry),
            Arc::clone(&accumulator),
            Arc::clone(&metastore),
        );
        let collector = Arc::new(Collector::new(
            Arc::clone(&registry),
            Arc::clone(&accumulator),
            Arc::clone(&store),
            Arc::clone(&clock),
        ));
        let analyzer = EventAnalyzer::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&metastore),
            Arc::clone(&clock),
        )
        .with_frame_limits(config.engine.max_frames, config.engine.default_frame);

        let services = ServiceManager::new(ServiceConfig::default());
        if config.collector.enabled {
            let service = CollectorService::new(Arc::clone(&collector), config.collector.clone());
            services
                .register(Arc::new(service))
                .map_err(|e| Error::Service(e.to_string()))?;
        }

        info!(
            store = store.engine_id(),
            unique_precision = config.engine.unique_precision,
            resumed_generation = stored_generation,
            "Rollup engine ready"
        );

        Ok(RollupEngine {
            config,
            registry,
            accumulator,
            store,
            metastore,
            aggregator,
            collector,
            analyzer,
            services,
        })
    }
}

impl Default for RollupEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Rule-driven rollup engine
pub struct RollupEngine {
    config: Config,
    registry: Arc<RuleRegistry>,
    accumulator: Arc<LiveAccumulator>,
    store: Arc<dyn BucketStore>,
    metastore: Arc<dyn Metastore>,
    aggregator: EventAggregator,
    collector: Arc<Collector>,
    analyzer: EventAnalyzer,
    services: ServiceManager,
}

impl RollupEngine {
    /// Start building an engine
    pub fn builder() -> RollupEngineBuilder {
        RollupEngineBuilder::new()
    }

    /// Engine configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Rule registry
    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// Metastore collaborator
    pub fn metastore(&self) -> &Arc<dyn Metastore> {
        &self.metastore
    }

    /// Bucket store collaborator
    pub fn store(&self) -> &Arc<dyn BucketStore> {
        &self.store
    }

    /// Number of buckets not flushed yet
    pub fn live_slots(&self) -> usize {
        self.accumulator.len()
    }

    /// Create a project and issue its API keys
    pub fn create_project(&self, project: &str) -> Result<ProjectApiKeys> {
        Ok(self.metastore.create_project(project)?)
    }

    /// Register a rule for its project
    ///
    /// Numeric aggregations are refused when the metastore declares the
    /// value field with a non-numeric type.
    pub fn register_rule(&self, rule: AggregationRule) -> Result<Arc<AggregationRule>> {
        let project = rule.project().to_string();
        if !self.metastore.project_exists(&project) {
            return Err(Error::ProjectNotFound(project));
        }

        let aggregation = rule.aggregation();
        if aggregation.requires_numeric() {
            let field = rule.value_script().and_then(|script| script.field_name());
            if let Some(field) = field {
                if let Some(field_type) = self.metastore.field_type(&project, field) {
                    if !field_type.is_numeric() {
                        return Err(ValidationError::FieldTypeMismatch {
                            field: field.to_string(),
                            expected: "numeric".to_string(),
                            actual: field_type.to_string(),
                        }
                        .into());
                    }
                }
            }
        }

        let rule = self.registry.register(rule)?;
        info!(
            project = %project,
            rule_id = %rule.id(),
            rule = %rule.describe(),
            "Rule registered"
        );
        Ok(rule)
    }

    /// Remove a rule with its live and stored buckets
    pub fn remove_rule(&self, project: &str, rule_id: &RuleId) -> Result<Arc<AggregationRule>> {
        let rule = self
            .registry
            .remove(project, rule_id)
            .ok_or_else(|| Error::RuleNotFound {
                project: project.to_string(),
                rule: rule_id.to_string(),
            })?;
        let live = self.accumulator.discard_rule(project, rule_id);
        let stored = self.store.delete_rule(project, rule_id)?;
        metrics::update_live_slots(self.accumulator.len());
        info!(project, rule_id = %rule_id, live, stored, "Rule removed");
        Ok(rule)
    }

    /// Fold one event into every rule of its project
    pub fn ingest(&self, event: &Event) -> Result<IngestReport> {
        self.aggregator.aggregate(event)
    }

    /// Fold a batch of events; stops at the first unknown project
    pub fn ingest_batch(&self, events: &[Event]) -> Result<IngestReport> {
        let report = self.aggregator.aggregate_all(events)?;
        debug!(
            events = events.len(),
            updated = report.updated,
            "Batch ingested"
        );
        Ok(report)
    }

    /// Flush closed buckets of every rule
    pub fn flush(&self) -> FlushReport {
        self.collector.process_registered(FlushScope::Closed)
    }

    /// Flush every live bucket, open ones included
    pub fn flush_all(&self) -> FlushReport {
        self.collector.process_registered(FlushScope::All)
    }

    /// Answer a rollup query
    pub fn analyze(&self, request: &QueryRequest) -> Result<QueryResult> {
        self.analyzer.analyze(request)
    }

    /// Start the background collector
    ///
    /// Must be called from within a tokio runtime. Does nothing when the
    /// collector is disabled.
    pub fn start_background(&self) -> Result<()> {
        if !self.config.collector.enabled {
            debug!("Background collector disabled");
            return Ok(());
        }
        self.services
            .start_all()
            .map_err(|e| Error::Service(e.to_string()))
    }

    /// Status of the background collector, if it is registered
    pub fn collector_status(&self) -> Option<ServiceStatus> {
        self.services.service_status("collector")
    }

    /// Stop background work
    ///
    /// The collector flushes open buckets on its way out when configured to.
    /// Without a running collector the same flush happens here.
    pub async fn shutdown(&self) -> Result<FlushReport> {
        if self.services.is_running() {
            self.services
                .shutdown()
                .await
                .map_err(|e| Error::Service(e.to_string()))?;
            return Ok(FlushReport::default());
        }

        if self.config.collector.flush_open_buckets_on_shutdown {
            let collector = Arc::clone(&self.collector);
            return tokio::task::spawn_blocking(move || collector.process_registered(FlushScope::All))
                .await
                .map_err(|e| Error::Service(format!("flush task failed: {}", e)));
        }
        Ok(FlushReport::default())
    }
}
