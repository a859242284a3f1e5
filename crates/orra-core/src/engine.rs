use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use orra_plancache::PlanCache;
use orra_providers::{Embedder, PlanGenerator, PlanValidator};
use orra_store::{IdempotencyStore, KvStore, LogStore};
use orra_types::Result;
use orra_wire::{Envelope, ServiceMessage};

use crate::compensation::CompensationService;
use crate::config::EngineConfig;
use crate::connections::{ConnectionManager, ConnectionSettings};
use crate::events::EventHub;
use crate::orchestrator::{Orchestrator, Shared};
use crate::projects::ProjectStore;
use crate::registry::ServiceRegistry;
use crate::webhook::WebhookNotifier;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// The assembled engine: stores, managers and background loops. One instance
/// owns all orchestration state for its projects.
pub struct Engine {
    pub config: EngineConfig,
    pub kv: KvStore,
    pub log: LogStore,
    pub idempotency: IdempotencyStore,
    pub projects: ProjectStore,
    pub registry: ServiceRegistry,
    pub connections: Arc<ConnectionManager>,
    pub plan_cache: PlanCache,
    pub orchestrator: Arc<Orchestrator>,
    pub compensations: CompensationService,
    pub webhooks: WebhookNotifier,
    pub events: EventHub,
    shutdown: CancellationToken,
}

impl Engine {
    /// Wire every component, start the background loops and resume any
    /// orchestration the previous process left unfinished.
    pub async fn start(
        config: EngineConfig,
        kv: KvStore,
        generator: Arc<dyn PlanGenerator>,
        embedder: Arc<dyn Embedder>,
        validator: Arc<dyn PlanValidator>,
    ) -> Result<Arc<Self>> {
        let shutdown = CancellationToken::new();
        let events = EventHub::new();
        let log = LogStore::new(kv.clone());
        let idempotency = IdempotencyStore::new(kv.clone(), config.idempotency_retention_ms);
        let projects = ProjectStore::new(kv.clone());
        let registry = ServiceRegistry::new(kv.clone());
        let connections = ConnectionManager::new(
            ConnectionSettings {
                heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
                heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms),
                queue_max_depth: config.queue_max_depth,
            },
            events.clone(),
        );
        let plan_cache = PlanCache::new(
            kv.clone(),
            embedder,
            config.plan_cache_similarity_threshold,
            config.plan_cache_ttl_ms,
            config.plan_cache_max_entries_per_project,
        );
        let (webhooks, _webhook_handle) = WebhookNotifier::start(
            config.webhook_max_attempts,
            config.webhook_workers,
            shutdown.clone(),
        );

        let shared = Arc::new(Shared {
            config: config.clone(),
            kv: kv.clone(),
            log: log.clone(),
            projects: projects.clone(),
            registry: registry.clone(),
            connections: Arc::clone(&connections),
            plan_cache: plan_cache.clone(),
            generator,
            validator,
            webhooks: webhooks.clone(),
            events: events.clone(),
            shutdown: shutdown.clone(),
        });
        let orchestrator = Orchestrator::new(Arc::clone(&shared));

        Arc::clone(&connections).spawn_heartbeat(shutdown.clone());
        plan_cache.clone().spawn_sweeper(MAINTENANCE_INTERVAL);
        Self::spawn_idempotency_sweeper(idempotency.clone(), shutdown.clone());

        let engine = Arc::new(Self {
            config,
            kv,
            log,
            idempotency,
            projects,
            registry,
            connections,
            plan_cache,
            orchestrator,
            compensations: CompensationService::new(shared.kv.clone()),
            webhooks,
            events,
            shutdown,
        });

        let resumed = engine.orchestrator.recover().await?;
        if resumed > 0 {
            tracing::info!(target: "orra.core", resumed, "resumed orchestrations after restart");
        }
        Ok(engine)
    }

    fn spawn_idempotency_sweeper(store: IdempotencyStore, shutdown: CancellationToken) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {
                        if let Err(err) = store.sweep_expired().await {
                            tracing::warn!(
                                target: "orra.core",
                                error = %err,
                                "idempotency sweep failed"
                            );
                        }
                    }
                }
            }
        });
    }

    /// Ingest one framed envelope from a service connection. Every envelope
    /// is ACKed; only first sightings are processed (services retry unacked
    /// envelopes on reconnect).
    pub async fn handle_envelope(&self, project_id: &str, service_id: &str, envelope: Envelope) {
        self.connections
            .send(
                project_id,
                service_id,
                orra_wire::EngineMessage::Ack {
                    id: envelope.id.clone(),
                },
            )
            .await;
        if !self
            .connections
            .note_envelope(project_id, service_id, &envelope.id)
            .await
        {
            tracing::debug!(
                target: "orra.conn",
                service_id,
                envelope_id = %envelope.id,
                "duplicate envelope re-acked"
            );
            return;
        }
        match envelope.payload {
            ServiceMessage::Pong { id } => {
                self.connections.handle_pong(service_id, &id).await;
            }
            message => self.orchestrator.route(service_id, message).await,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cooperative shutdown: background loops stop at their next check.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
