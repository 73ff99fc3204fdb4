//! Application context — explicit wiring of every subsystem.
//!
//! One [`AppContext`] is created at startup, threaded into every HTTP
//! handler and subscriber task, and torn down on shutdown. There are no
//! process-wide mutable globals.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::bus::{
    AzureBusAdmin, AzureBusClient, BusAdmin, BusClient, MessagePublisher, SubscriberOrchestrator,
};
use crate::config::ProxyConfig;
use crate::error::ProxyResult;
use crate::pending::PendingRequestManager;
use crate::registry::AgentRegistry;
use crate::routing::Router;
use crate::sessions::{FileSessionStore, SessionManager};
use crate::topics::TopicManager;
use crate::types::{AgentInfo, ProxyRole};

/// Everything a running proxy holds, created at startup and torn down on
/// shutdown.
pub struct AppContext {
    /// Parsed configuration.
    pub config: ProxyConfig,
    /// Agent identity → locality lookup.
    pub registry: Arc<AgentRegistry>,
    /// Proxy-level session store.
    pub sessions: Arc<SessionManager>,
    /// In-flight request correlator.
    pub pending: Arc<PendingRequestManager>,
    /// Bus client; `None` in local-only mode.
    pub bus: Option<Arc<dyn BusClient>>,
    /// Typed publisher; present iff the bus is.
    pub publisher: Option<Arc<MessagePublisher>>,
    /// Request router.
    pub router: Arc<Router>,
    /// Topic lifecycle manager; coordinator only.
    pub topic_manager: Option<Arc<TopicManager>>,
    /// Subscription orchestrator; present iff the bus is.
    pub subscriber: Option<Arc<SubscriberOrchestrator>>,
    /// Startup instant, for uptime reporting.
    pub started_at: DateTime<Utc>,
}

impl AppContext {
    /// Build and start the full stack with the Azure bus implementations.
    ///
    /// A bus initialization failure is logged at WARN and the proxy
    /// continues in local-only mode; a coordinator topic-management
    /// failure is logged at WARN and startup continues.
    pub async fn bootstrap(
        config: ProxyConfig,
        agents: std::collections::HashMap<String, AgentInfo>,
    ) -> ProxyResult<Arc<Self>> {
        let (bus, admin): (Option<Arc<dyn BusClient>>, Option<Arc<dyn BusAdmin>>) =
            match &config.servicebus {
                Some(settings) => {
                    let client = AzureBusClient::new(settings.clone())
                        .map(|c| Arc::new(c) as Arc<dyn BusClient>);
                    let admin = AzureBusAdmin::new(settings)
                        .map(|a| Arc::new(a) as Arc<dyn BusAdmin>);
                    match (client, admin) {
                        (Ok(client), Ok(admin)) => (Some(client), Some(admin)),
                        (Err(e), _) | (_, Err(e)) => {
                            warn!(
                                error = %e,
                                "Failed to initialize Service Bus, continuing in local-only mode"
                            );
                            (None, None)
                        }
                    }
                }
                None => {
                    info!("Service Bus not configured, running in local-only mode");
                    (None, None)
                }
            };
        Self::assemble(config, agents, bus, admin).await
    }

    /// Build and start the full stack over explicit bus implementations.
    /// Tests inject the in-memory broker here.
    pub async fn assemble(
        config: ProxyConfig,
        agents: std::collections::HashMap<String, AgentInfo>,
        bus: Option<Arc<dyn BusClient>>,
        admin: Option<Arc<dyn BusAdmin>>,
    ) -> ProxyResult<Arc<Self>> {
        let proxy_id = config.proxy.id.clone();
        info!(proxy_id = %proxy_id, role = %config.proxy.role, "Starting A2A proxy");

        let registry = Arc::new(AgentRegistry::new(agents));
        info!(agent_count = registry.count().await, "Agent registry initialized");

        let session_settings = config.sessions.clone().unwrap_or_default();
        let store = Arc::new(FileSessionStore::new(session_settings.store_path.clone()).await?);
        let sessions = Arc::new(SessionManager::new(session_settings, store));
        sessions.start().await;

        let pending = Arc::new(PendingRequestManager::new());
        pending.start().await;

        // Bring the bus up; failure demotes the proxy to local-only mode.
        let bus = match bus {
            Some(bus) => match bus.start().await {
                Ok(()) => Some(bus),
                Err(e) => {
                    warn!(
                        error = %e,
                        "Service Bus startup failed, continuing in local-only mode"
                    );
                    None
                }
            },
            None => None,
        };

        let publisher = bus
            .as_ref()
            .map(|bus| Arc::new(MessagePublisher::new(Arc::clone(bus))));

        // Coordinator proxies reconcile the topic namespace before anyone
        // subscribes. Failures leave the proxy functional for whatever
        // topics already exist.
        let topic_manager = match (&admin, config.proxy.role) {
            (Some(admin), ProxyRole::Coordinator) => {
                let manager = Arc::new(TopicManager::new(Arc::clone(admin)));
                if bus.is_some() && !config.agent_groups.is_empty() {
                    let results = manager.ensure_topics_exist(&config.agent_groups).await;
                    let failed: Vec<&str> = results
                        .values()
                        .filter(|r| !r.is_successful())
                        .map(|r| r.group_name.as_str())
                        .collect();
                    if !failed.is_empty() {
                        warn!(
                            groups = ?failed,
                            "Topic management failed for some groups, continuing"
                        );
                    }
                }
                Some(manager)
            }
            _ => None,
        };

        let subscriber = match (&bus, &publisher) {
            (Some(bus), Some(publisher)) => {
                let orchestrator = Arc::new(SubscriberOrchestrator::new(
                    proxy_id.clone(),
                    config.subscriptions.clone(),
                    Arc::clone(bus),
                    Arc::clone(&registry),
                    Arc::clone(publisher),
                    Arc::clone(&pending),
                ));
                if let Some(admin) = &admin {
                    let provisioned = orchestrator.provision(admin.as_ref()).await;
                    info!(provisioned, "Subscriptions provisioned");
                }
                orchestrator.start().await?;
                Some(orchestrator)
            }
            _ => None,
        };

        let router = Arc::new(Router::new(
            proxy_id,
            Arc::clone(&registry),
            publisher.clone(),
            Arc::clone(&pending),
        ));
        info!("Message router initialized");

        Ok(Arc::new(Self {
            config,
            registry,
            sessions,
            pending,
            bus,
            publisher,
            router,
            topic_manager,
            subscriber,
            started_at: Utc::now(),
        }))
    }

    /// Tear everything down: receivers stop, pending requests fan out
    /// shutdown errors, the session sweeper is joined.
    pub async fn shutdown(&self) {
        info!("Shutting down A2A proxy");
        if let Some(bus) = &self.bus {
            bus.stop().await;
        }
        self.pending.stop().await;
        self.sessions.stop().await;
        info!("Shutdown complete");
    }

    /// Seconds since startup.
    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
