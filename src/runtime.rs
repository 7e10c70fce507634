//! Pipeline runtime
//!
//! Explicitly constructed process-wide wiring: builds every component over
//! the shared repository, fabric, cache, and connector registry, binds
//! workers to their queues per role, and owns the init -> start -> stop
//! lifecycle. Workers suspend on I/O but never hold a slow job past the
//! stage timeout; shutdown drains the queues within a bounded budget.

use crate::adapter::AdapterRuntime;
use crate::alerts::AlertManager;
use crate::analyzer::UnifiedAnalyzer;
use crate::catalog;
use crate::config::PipelineConfig;
use crate::connectors::SharedRegistry;
use crate::context::ContextLoader;
use crate::error::{PostureError, Result};
use crate::events::{analyze_queue, link_queue, process_queue, AnalyzeRequest, ANALYSIS_TOPIC};
use crate::fabric::{EnqueueOptions, SharedTopicBus, SharedWorkQueue, TopicBus, WorkQueue};
use crate::heartbeat::HeartbeatManager;
use crate::linker::Linker;
use crate::processor::EntityProcessor;
use crate::repository::{IntegrationStore, Repository, SharedRepository};
use crate::scheduler::Scheduler;
use crate::types::{now_ms, AnalysisType, EntityType};
use dashmap::DashSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Worker roles selectable from the CLI. `serve` with no role runs them all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    Scheduler,
    Adapter,
    Processor,
    Linker,
    Analyzer,
    Alerts,
    Heartbeat,
}

impl Role {
    pub fn all() -> Vec<Role> {
        vec![
            Role::Scheduler,
            Role::Adapter,
            Role::Processor,
            Role::Linker,
            Role::Analyzer,
            Role::Alerts,
            Role::Heartbeat,
        ]
    }
}

pub struct PipelineRuntime {
    config: PipelineConfig,
    repo: SharedRepository,
    queue: SharedWorkQueue,
    bus: SharedTopicBus,
    registry: SharedRegistry,

    pub scheduler: Arc<Scheduler>,
    pub adapter: Arc<AdapterRuntime>,
    pub processor: Arc<EntityProcessor>,
    pub linker: Arc<Linker>,
    pub alert_manager: Arc<AlertManager>,
    pub heartbeat: Arc<HeartbeatManager>,
    loader: Arc<ContextLoader>,

    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    analyzer_tenants: Arc<DashSet<String>>,
}

impl PipelineRuntime {
    pub fn new(
        config: PipelineConfig,
        repo: SharedRepository,
        queue: SharedWorkQueue,
        bus: SharedTopicBus,
        cache: crate::cache::SharedCache,
        registry: SharedRegistry,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Scheduler::new(repo.clone(), queue.clone(), config.clone()));
        let adapter = Arc::new(AdapterRuntime::new(
            repo.clone(),
            queue.clone(),
            bus.clone(),
            registry.clone(),
            scheduler.clone(),
            config.clone(),
        ));
        let processor = Arc::new(EntityProcessor::new(repo.clone(), bus.clone()));
        let linker = Arc::new(Linker::new(repo.clone(), bus.clone(), registry.clone()));
        let alert_manager = Arc::new(AlertManager::new(repo.clone()));
        let heartbeat = Arc::new(HeartbeatManager::new(
            repo.clone(),
            cache,
            config.heartbeat.clone(),
        ));
        let loader = Arc::new(ContextLoader::new(repo.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config,
            repo,
            queue,
            bus,
            registry,
            scheduler,
            adapter,
            processor,
            linker,
            alert_manager,
            heartbeat,
            loader,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            analyzer_tenants: Arc::new(DashSet::new()),
        })
    }

    /// Validate indexes, load the license catalog, seed the heartbeat cache.
    pub async fn init(&self) -> Result<()> {
        self.repo.ensure_indexes().await?;
        if !self.repo.health_check().await? {
            return Err(PostureError::Store("store health check failed".to_string()));
        }
        catalog::init(&HashMap::new());
        self.heartbeat.seed().await?;
        info!("pipeline runtime initialized");
        Ok(())
    }

    /// Spawn the worker loops for the selected roles.
    pub async fn start(self: &Arc<Self>, roles: &[Role]) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        for role in roles {
            match role {
                Role::Scheduler => tasks.push(self.spawn_scheduler()),
                Role::Adapter => {
                    for task in self.spawn_adapters().await? {
                        tasks.push(task);
                    }
                }
                Role::Processor => {
                    tasks.push(self.spawn_processor_bridge());
                    tasks.push(self.spawn_processor_worker());
                }
                Role::Linker => {
                    tasks.push(self.spawn_linker_bridge());
                    for task in self.spawn_linker_workers() {
                        tasks.push(task);
                    }
                }
                Role::Analyzer => {
                    tasks.push(self.spawn_analyzer_bridge());
                    tasks.push(self.spawn_analyzer_worker());
                }
                Role::Alerts => tasks.push(self.spawn_alert_worker()),
                Role::Heartbeat => {
                    tasks.push(self.spawn_heartbeat_stale_loop());
                    tasks.push(self.spawn_heartbeat_flush_loop());
                }
            }
        }
        info!(roles = roles.len(), workers = tasks.len(), "pipeline workers started");
        Ok(())
    }

    /// Graceful stop: stop intake, drain the queues within the configured
    /// budget, flush the heartbeat manager, and join the workers.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);

        let deadline = now_ms() + self.config.drain_timeout_ms as i64;
        let drained = loop {
            if self.queue.is_drained().await? {
                break true;
            }
            if now_ms() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        };

        self.heartbeat.stop().await?;

        let mut tasks = self.tasks.lock().await;
        let handles: Vec<JoinHandle<()>> = tasks.drain(..).collect();
        for task in &handles {
            task.abort();
        }
        let _ = futures::future::join_all(handles).await;

        if !drained {
            warn!("queues did not drain before the shutdown budget");
            return Err(PostureError::DrainTimeout(self.config.drain_timeout_ms));
        }
        info!("pipeline runtime stopped");
        Ok(())
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let runtime = self.clone();
        let mut shutdown = self.shutdown_rx();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(runtime.config.scheduler_tick_ms));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = runtime.scheduler.tick().await {
                            error!(error = %e, "scheduler tick failed");
                        }
                    }
                }
            }
        })
    }

    /// One worker per `(integration, entity type)` bound through the
    /// capability table, sharing the global adapter concurrency budget.
    async fn spawn_adapters(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let permits = Arc::new(Semaphore::new(self.config.adapter_concurrency));
        let mut tasks = Vec::new();
        for integration in self.repo.list_integrations().await? {
            if self.registry.get(&integration.slug).is_none() {
                warn!(slug = %integration.slug, "integration has no registered capability, skipping");
                continue;
            }
            for supported in &integration.supported_types {
                tasks.push(self.spawn_adapter_worker(
                    integration.slug.clone(),
                    supported.entity_type,
                    permits.clone(),
                ));
            }
        }
        Ok(tasks)
    }

    fn spawn_adapter_worker(
        self: &Arc<Self>,
        slug: String,
        entity_type: EntityType,
        permits: Arc<Semaphore>,
    ) -> JoinHandle<()> {
        let runtime = self.clone();
        let mut shutdown = self.shutdown_rx();
        tokio::spawn(async move {
            let queue_name = crate::events::sync_queue(&slug, entity_type);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    message = runtime.queue.dequeue(&queue_name, 500) => {
                        let Ok(Some(message)) = message else { continue };
                        let Ok(permit) = permits.clone().acquire_owned().await else { break };
                        let budget = Duration::from_millis(runtime.config.timeouts.adapter_ms);
                        let result = timeout(budget, runtime.adapter.handle_message(&message)).await;
                        drop(permit);
                        runtime.settle(&queue_name, &message.id, result).await;
                    }
                }
            }
        })
    }

    fn spawn_processor_bridge(self: &Arc<Self>) -> JoinHandle<()> {
        self.spawn_topic_bridge("fetched.*", move |_event| (process_queue(), 0))
    }

    fn spawn_processor_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let runtime = self.clone();
        let mut shutdown = self.shutdown_rx();
        tokio::spawn(async move {
            let queue_name = process_queue();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    message = runtime.queue.dequeue(&queue_name, 500) => {
                        let Ok(Some(message)) = message else { continue };
                        let budget = Duration::from_millis(runtime.config.timeouts.processor_ms);
                        let result = timeout(budget, async {
                            let event = serde_json::from_value(message.payload.clone())?;
                            runtime.processor.handle_fetched(&event).await.map(|_| ())
                        })
                        .await;
                        runtime.settle(&queue_name, &message.id, result).await;
                    }
                }
            }
        })
    }

    fn spawn_linker_bridge(self: &Arc<Self>) -> JoinHandle<()> {
        self.spawn_topic_bridge("processed.*", move |event| {
            let slug = event["integration_slug"].as_str().unwrap_or_default();
            (link_queue(slug), 0)
        })
    }

    fn spawn_linker_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.registry
            .slugs()
            .into_iter()
            .map(|slug| {
                let runtime = self.clone();
                let mut shutdown = runtime.shutdown_rx();
                tokio::spawn(async move {
                    let queue_name = link_queue(&slug);
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            message = runtime.queue.dequeue(&queue_name, 500) => {
                                let Ok(Some(message)) = message else { continue };
                                let budget = Duration::from_millis(runtime.config.timeouts.linker_ms);
                                let result = timeout(budget, async {
                                    let event = serde_json::from_value(message.payload.clone())?;
                                    runtime.linker.handle_processed(&event).await.map(|_| ())
                                })
                                .await;
                                runtime.settle(&queue_name, &message.id, result).await;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Debounce bridge: `linked.*` events for one `(tenant, data source)`
    /// within the window coalesce into a single queued analyzer run.
    fn spawn_analyzer_bridge(self: &Arc<Self>) -> JoinHandle<()> {
        let runtime = self.clone();
        let mut shutdown = self.shutdown_rx();
        tokio::spawn(async move {
            let Ok(mut subscription) = runtime.bus.subscribe("linked.*").await else {
                return;
            };
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = subscription.next() => {
                        let Some(event) = event else { break };
                        let payload = event.payload;
                        let tenant_id = payload["tenant_id"].as_str().unwrap_or_default().to_string();
                        let data_source_id = payload["data_source_id"].as_str().unwrap_or_default().to_string();
                        if tenant_id.is_empty() || data_source_id.is_empty() {
                            continue;
                        }
                        let queue_name = analyze_queue(&tenant_id);
                        match runtime
                            .queue
                            .has_pending_for(&queue_name, &data_source_id, "analyze")
                            .await
                        {
                            Ok(true) => continue,
                            Ok(false) => {}
                            Err(e) => {
                                error!(error = %e, "analyzer dedup query failed");
                                continue;
                            }
                        }
                        let request = AnalyzeRequest {
                            sync_id: payload["sync_id"].as_str().unwrap_or_default().to_string(),
                            tenant_id: tenant_id.clone(),
                            data_source_id: data_source_id.clone(),
                            integration_slug: payload["integration_slug"]
                                .as_str()
                                .unwrap_or_default()
                                .to_string(),
                        };
                        runtime.analyzer_tenants.insert(tenant_id.clone());
                        let enqueue = runtime
                            .queue
                            .enqueue(
                                &queue_name,
                                serde_json::to_value(&request).unwrap_or_default(),
                                EnqueueOptions {
                                    priority: 0,
                                    delay_ms: runtime.config.analyzer_debounce_ms,
                                    data_source_id: Some(data_source_id),
                                    action: Some("analyze".to_string()),
                                },
                            )
                            .await;
                        if let Err(e) = enqueue {
                            error!(error = %e, "failed to enqueue analyzer run");
                        }
                    }
                }
            }
        })
    }

    fn spawn_analyzer_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let runtime = self.clone();
        let mut shutdown = self.shutdown_rx();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let mut handled = false;
                let tenants: Vec<String> = runtime
                    .analyzer_tenants
                    .iter()
                    .map(|t| t.key().clone())
                    .collect();
                for tenant_id in tenants {
                    let queue_name = analyze_queue(&tenant_id);
                    let Ok(Some(message)) = runtime.queue.dequeue(&queue_name, 0).await else {
                        continue;
                    };
                    handled = true;
                    let budget = Duration::from_millis(runtime.config.timeouts.analyzer_ms);
                    let result = timeout(budget, runtime.run_analysis(&message.payload)).await;
                    runtime.settle(&queue_name, &message.id, result).await;
                }
                if !handled {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                    }
                }
            }
        })
    }

    async fn run_analysis(&self, payload: &serde_json::Value) -> Result<()> {
        let request: AnalyzeRequest = serde_json::from_value(payload.clone())?;
        let context = self
            .loader
            .load(
                &request.tenant_id,
                &request.data_source_id,
                &request.integration_slug,
            )
            .await?;
        let analysis_types = self
            .registry
            .get(&request.integration_slug)
            .map(|c| c.analyses.clone())
            .unwrap_or_else(AnalysisType::all);
        let event = UnifiedAnalyzer::new().run(&context, &request.sync_id, &analysis_types, now_ms());
        self.bus
            .publish(ANALYSIS_TOPIC, serde_json::to_value(&event)?)
            .await?;
        Ok(())
    }

    /// Single consumer for `analysis.unified`: runs for one scope are
    /// serialized by construction.
    fn spawn_alert_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let runtime = self.clone();
        let mut shutdown = self.shutdown_rx();
        tokio::spawn(async move {
            let Ok(mut subscription) = runtime.bus.subscribe(ANALYSIS_TOPIC).await else {
                return;
            };
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = subscription.next() => {
                        let Some(event) = event else { break };
                        let budget = Duration::from_millis(runtime.config.timeouts.alerts_ms);
                        let outcome = timeout(budget, async {
                            let analysis = serde_json::from_value(event.payload)?;
                            runtime.alert_manager.handle_analysis(&analysis).await
                        })
                        .await;
                        match outcome {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => error!(error = %e, "alert reconciliation failed"),
                            Err(_) => error!("alert reconciliation timed out"),
                        }
                    }
                }
            }
        })
    }

    fn spawn_heartbeat_stale_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let runtime = self.clone();
        let mut shutdown = self.shutdown_rx();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                runtime.config.heartbeat.stale_scan_interval_ms,
            ));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = runtime.heartbeat.check_stale().await {
                            error!(error = %e, "heartbeat stale check failed");
                        }
                    }
                }
            }
        })
    }

    fn spawn_heartbeat_flush_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let runtime = self.clone();
        let mut shutdown = self.shutdown_rx();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                runtime.config.heartbeat.flush_interval_ms,
            ));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = runtime.heartbeat.flush_once().await {
                            error!(error = %e, "heartbeat flush failed");
                        }
                    }
                }
            }
        })
    }

    /// Forward matching topic events into a work queue chosen per event.
    fn spawn_topic_bridge(
        self: &Arc<Self>,
        pattern: &'static str,
        route: impl Fn(&serde_json::Value) -> (String, i64) + Send + 'static,
    ) -> JoinHandle<()> {
        let runtime = self.clone();
        let mut shutdown = self.shutdown_rx();
        tokio::spawn(async move {
            let Ok(mut subscription) = runtime.bus.subscribe(pattern).await else {
                return;
            };
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = subscription.next() => {
                        let Some(event) = event else { break };
                        let (queue_name, priority) = route(&event.payload);
                        let enqueue = runtime
                            .queue
                            .enqueue(&queue_name, event.payload, EnqueueOptions {
                                priority,
                                ..Default::default()
                            })
                            .await;
                        if let Err(e) = enqueue {
                            error!(queue = %queue_name, error = %e, "bridge enqueue failed");
                        }
                    }
                }
            }
        })
    }

    /// Ack on success; redeliver with a short delay on failure or timeout.
    async fn settle(
        &self,
        queue_name: &str,
        message_id: &str,
        result: std::result::Result<Result<()>, tokio::time::error::Elapsed>,
    ) {
        let retry_delay_ms = 5_000;
        match result {
            Ok(Ok(())) => {
                if let Err(e) = self.queue.ack(queue_name, message_id).await {
                    error!(queue = %queue_name, error = %e, "ack failed");
                }
            }
            Ok(Err(e)) => {
                warn!(queue = %queue_name, error = %e, "handler failed, redelivering");
                if let Err(e) = self.queue.nack(queue_name, message_id, retry_delay_ms).await {
                    error!(queue = %queue_name, error = %e, "nack failed");
                }
            }
            Err(_) => {
                warn!(queue = %queue_name, "handler timed out, redelivering");
                if let Err(e) = self.queue.nack(queue_name, message_id, retry_delay_ms).await {
                    error!(queue = %queue_name, error = %e, "nack failed");
                }
            }
        }
    }
}
