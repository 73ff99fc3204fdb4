//! # a2a-proxy — transparent A2A proxying over Azure Service Bus
//!
//! A proxy instance hosts a subset of AI agents behind fully-qualified
//! local addresses and bridges the rest over a topic-based message bus.
//! Clients address any agent as if it were local; the proxy decides
//! whether to dispatch over HTTP (locally hosted) or to publish onto the
//! owning group's request topic and await the correlated reply.
//!
//! ## Architecture
//!
//! - [`routing::Router`] — local vs. remote dispatch and reply stitching
//! - [`pending::PendingRequestManager`] — correlation-id keyed one-shot
//!   promises with timeout sweeping and shutdown fan-out
//! - [`bus::BusClient`] — the abstract broker surface
//!   ([`bus::AzureBusClient`] over the Service Bus REST API,
//!   [`bus::InMemoryBus`] for tests and local development)
//! - [`bus::MessagePublisher`] / [`bus::SubscriberOrchestrator`] — typed
//!   envelopes onto group-sharded topics, durable filtered subscriptions,
//!   supervised receive loops
//! - [`topics::TopicManager`] — declarative reconciliation of the
//!   per-group topic triple (coordinator only)
//! - [`registry::AgentRegistry`] — identity → locality + endpoint lookup
//! - [`sessions::SessionManager`] — TTL-bounded session records persisted
//!   one file per session
//! - [`http::proxy_router`] — the external axum surface
//! - [`app::AppContext`] — lifecycle-scoped wiring of all of the above
//!
//! ## Topic namespace
//!
//! For every agent group `G` the coordinator manages the triple
//! `a2a.G.requests`, `a2a.G.responses`, and `a2a.G.deadletter`;
//! notifications share the single `a2a-notifications` topic. Messages
//! published with the same session key (the correlation id by default)
//! are delivered in FIFO order to one consumer.
//!
//! ## Quick start
//!
//! ```no_run
//! use a2a_proxy::app::AppContext;
//! use a2a_proxy::config::ConfigLoader;
//! use a2a_proxy::http::proxy_router;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let loader = ConfigLoader::new("config")?;
//!     let config = loader.load_proxy_config("proxy-config.yaml")?;
//!     let agents = loader.resolve_agents(&config, "agent-registry.yaml")?;
//!
//!     let port = config.proxy.port;
//!     let ctx = AppContext::bootstrap(config, agents).await?;
//!     let app = proxy_router(ctx.clone());
//!
//!     let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
//!     axum::serve(listener, app).await?;
//!     ctx.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod bus;
pub mod config;
pub mod error;
pub mod http;
pub mod pending;
pub mod registry;
pub mod routing;
pub mod sessions;
pub mod topics;
pub mod types;

/// Re-exports of the most frequently used types.
pub mod prelude {
    pub use crate::app::AppContext;
    pub use crate::bus::{
        BusAdmin, BusClient, BusMessage, InMemoryBus, MessagePublisher, MessageType,
        SubscriberOrchestrator, SubscriptionSpec,
    };
    pub use crate::config::{ConfigLoader, ProxyConfig, SessionSettings, TopicGroupConfig};
    pub use crate::error::{JsonRpcError, ProxyError, ProxyResult};
    pub use crate::pending::PendingRequestManager;
    pub use crate::registry::AgentRegistry;
    pub use crate::routing::Router;
    pub use crate::sessions::{FileSessionStore, SessionInfo, SessionManager};
    pub use crate::topics::{TopicManager, TopicStatus};
    pub use crate::types::{AgentInfo, MessageEnvelope, ProxyRole};
}

pub use error::{ProxyError, ProxyResult};
