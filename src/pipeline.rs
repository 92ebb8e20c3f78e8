//! Pipeline assembly
//!
//! Wires the webhook entry point and the four stage workers onto one bus.

use crate::analysis::{ConversationAnalyzer, KeywordAnalyzer};
use crate::config::{RelayConfig, WorkerConfig};
use crate::context::ContextAssembler;
use crate::dlq::{DlqHandler, MemoryDlqHandler};
use crate::error::Result;
use crate::events::{pipeline_schemas, PipelineEvent};
use crate::ingest::WebhookHandler;
use crate::platform::ProcessorRegistry;
use crate::provider::EventProvider;
use crate::schema::MemorySchemaRegistry;
use crate::services::Services;
use crate::store::EventBus;
use crate::worker::{
    DeliveryStage, EventHandler, NormalizeStage, ReplyStage, ResponseStage, Worker,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The assembled conversation pipeline
pub struct Pipeline {
    bus: EventBus,
    webhooks: WebhookHandler,
    dlq: Arc<dyn DlqHandler>,
    normalize: Arc<Worker<NormalizeStage>>,
    respond: Arc<Worker<ResponseStage>>,
    reply: Arc<Worker<ReplyStage>>,
    deliver: Arc<Worker<DeliveryStage>>,
    purge_interval: Duration,
}

/// Builder for [`Pipeline`]
pub struct PipelineBuilder {
    provider: Arc<dyn EventProvider>,
    services: Services,
    config: RelayConfig,
    processors: ProcessorRegistry,
    analyzer: Option<Arc<dyn ConversationAnalyzer>>,
    dlq: Option<Arc<dyn DlqHandler>>,
}

impl PipelineBuilder {
    pub fn new(provider: Arc<dyn EventProvider>, services: Services) -> Self {
        Self {
            provider,
            services,
            config: RelayConfig::default(),
            processors: ProcessorRegistry::with_defaults(),
            analyzer: None,
            dlq: None,
        }
    }

    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn processors(mut self, processors: ProcessorRegistry) -> Self {
        self.processors = processors;
        self
    }

    /// Replace the keyword analyzer used for contact memory
    pub fn analyzer(mut self, analyzer: Arc<dyn ConversationAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn dlq(mut self, dlq: Arc<dyn DlqHandler>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;

        let registry = MemorySchemaRegistry::with_schemas(pipeline_schemas())?;
        let bus = EventBus::from_arc(self.provider).with_schema_registry(Arc::new(registry));
        let dlq: Arc<dyn DlqHandler> = match self.dlq {
            Some(dlq) => dlq,
            None => Arc::new(MemoryDlqHandler::default()),
        };
        let analyzer: Arc<dyn ConversationAnalyzer> = match self.analyzer {
            Some(analyzer) => analyzer,
            None => Arc::new(KeywordAnalyzer::new(self.config.analysis.clone())),
        };
        let workers = self.config.workers.clone();
        let purge_interval = self.config.context.purge_interval();
        let services = self.services;

        let normalize = NormalizeStage::new(services.clone(), bus.clone(), self.config.ingest.clone());
        let respond = ResponseStage::new(
            services.clone(),
            bus.clone(),
            analyzer,
            self.config.context.clone(),
            self.config.contact_memory.clone(),
        );
        let reply = ReplyStage::new(services.clone(), bus.clone());
        let deliver = DeliveryStage::new(services.clone(), self.config.delivery.clone());

        let normalize = stage_worker(normalize, &bus, &dlq, &workers);
        let respond = stage_worker(respond, &bus, &dlq, &workers);
        let reply = stage_worker(reply, &bus, &dlq, &workers);
        let deliver = stage_worker(deliver, &bus, &dlq, &workers);

        let webhooks = WebhookHandler::new(bus.clone(), self.processors, services.tenants);

        Ok(Pipeline {
            bus,
            webhooks,
            dlq,
            normalize,
            respond,
            reply,
            deliver,
            purge_interval,
        })
    }
}

fn stage_worker<H: EventHandler>(
    handler: H,
    bus: &EventBus,
    dlq: &Arc<dyn DlqHandler>,
    config: &WorkerConfig,
) -> Arc<Worker<H>> {
    Arc::new(Worker::new(
        Arc::new(handler),
        bus.clone(),
        Arc::clone(dlq),
        config.clone(),
    ))
}

impl Pipeline {
    pub fn builder(provider: Arc<dyn EventProvider>, services: Services) -> PipelineBuilder {
        PipelineBuilder::new(provider, services)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Entry point for raw platform webhooks
    pub fn webhooks(&self) -> &WebhookHandler {
        &self.webhooks
    }

    pub fn dlq(&self) -> &Arc<dyn DlqHandler> {
        &self.dlq
    }

    /// Context builder shared with the response stage
    pub fn contexts(&self) -> &Arc<ContextAssembler> {
        self.respond.handler().assembler()
    }

    /// Drop cached prompts and contexts after settings or knowledge change
    pub async fn invalidate_organization(&self, organization_id: Uuid) {
        self.contexts().invalidate_organization(organization_id).await;
    }

    /// Drop cached contexts after a contact record changes
    pub async fn invalidate_contact(&self, contact_id: Uuid) {
        self.contexts().invalidate_contact(contact_id).await;
    }

    /// Create every stage's durable consumer without starting the loops
    ///
    /// Events published before a durable consumer exists may not reach it.
    pub async fn ensure_consumers(&self) -> Result<()> {
        self.ensure(&self.normalize).await?;
        self.ensure(&self.respond).await?;
        self.ensure(&self.reply).await?;
        self.ensure(&self.deliver).await?;
        Ok(())
    }

    async fn ensure<H: EventHandler>(&self, worker: &Worker<H>) -> Result<()> {
        self.bus
            .subscribe_durable(worker.handler().name(), H::Event::TOPIC, &worker.subscribe_options())
            .await?;
        Ok(())
    }

    /// Start every worker and the cache sweeper; all stop when `shutdown` fires
    pub fn start(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        handles.extend(Arc::clone(&self.normalize).spawn(shutdown.clone()));
        handles.extend(Arc::clone(&self.respond).spawn(shutdown.clone()));
        handles.extend(Arc::clone(&self.reply).spawn(shutdown.clone()));
        handles.extend(Arc::clone(&self.deliver).spawn(shutdown.clone()));
        handles.push(self.spawn_cache_purge(shutdown));

        tracing::info!(
            provider = self.bus.provider_name(),
            workers = handles.len(),
            "Pipeline started"
        );
        handles
    }

    fn spawn_cache_purge(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let contexts = Arc::clone(self.contexts());
        let mut ticker = tokio::time::interval(self.purge_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::spawn(async move {
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = contexts.purge_expired().await;
                        if purged > 0 {
                            tracing::debug!(purged, "Purged expired cache entries");
                        }
                    }
                }
            }
        })
    }
}
