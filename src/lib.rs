//! # a3s-relay
//!
//! Asynchronous conversation pipeline for customer messaging channels.
//!
//! ## Overview
//!
//! `a3s-relay` turns raw platform webhooks (WhatsApp, Instagram, Facebook
//! Messenger, email) into grounded AI replies delivered back on the same
//! channel. Every stage is a worker on a pluggable event bus, so stages scale
//! and retry independently:
//!
//! ```text
//! webhook ──► WebhookReceived ──► normalize ──► MessageCreated
//!         ──► respond ──► AiResponseReceived ──► reply ──► MessageDelivery
//!         ──► deliver (chunked, paced) ──► Sent / Failed
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_relay::{Pipeline, TenantHint};
//! use a3s_relay::provider::memory::MemoryProvider;
//! use a3s_relay::services::memory::MemoryServices;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> a3s_relay::Result<()> {
//! let memory = MemoryServices::new();
//! let pipeline = Pipeline::builder(Arc::new(MemoryProvider::default()), memory.services())
//!     .build()?;
//! pipeline.ensure_consumers().await?;
//!
//! let shutdown = CancellationToken::new();
//! let workers = pipeline.start(shutdown.clone());
//!
//! let body = br#"{"object":"page","entry":[]}"#;
//! pipeline
//!     .webhooks()
//!     .handle_bytes("facebook", TenantHint::RoutingKey("1234".into()), body)
//!     .await
//!     .ok();
//!
//! shutdown.cancel();
//! for worker in workers {
//!     worker.await.ok();
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Providers
//!
//! - **memory**: in-process bus for tests and single-process deployments
//! - **nats**: NATS JetStream with durable pull consumers
//!
//! ## Architecture
//!
//! - **EventProvider** trait: bus abstraction every backend implements
//! - **EventHandler** trait + **Worker**: subscribe, handle, ack/nak, dead-letter
//! - **Services**: narrow collaborator traits (storage, channels, model)
//! - **ContextAssembler**: cached, grounded prompt construction

pub mod analysis;
pub mod cache;
pub mod chunking;
pub mod config;
pub mod contact_memory;
pub mod context;
pub mod dlq;
pub mod domain;
pub mod error;
pub mod events;
pub mod graph;
pub mod ingest;
pub mod pipeline;
pub mod platform;
pub mod provider;
pub mod schema;
pub mod services;
pub mod store;
pub mod types;
pub mod worker;

// Re-export core types
pub use config::RelayConfig;
pub use dlq::{DeadLetterEvent, DlqHandler, MemoryDlqHandler};
pub use error::{RelayError, Result};
pub use events::{AiResponseReceived, MessageCreated, MessageDelivery, PipelineEvent, WebhookReceived};
pub use ingest::{TenantHint, WebhookHandler};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use provider::{EventProvider, PendingEvent, ProviderInfo, Subscription};
pub use schema::{EventSchema, MemorySchemaRegistry, SchemaRegistry};
pub use store::EventBus;
pub use types::{Event, PublishOptions, ReceivedEvent, SubscribeOptions};
pub use worker::{EventHandler, Worker};

// Re-export providers for convenience
pub use provider::memory::{MemoryConfig, MemoryProvider};
pub use provider::nats::{NatsClient, NatsConfig, NatsProvider, NatsSubscription, StorageType};
