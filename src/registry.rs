//! Agent registry — identity → locality + endpoint lookup.
//!
//! A pure in-memory mapping loaded from configuration, plus a cached
//! concurrent health prober. The registry never mutates agents after load
//! except through explicit `add`/`remove`/`refresh`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::ConfigLoader;
use crate::error::{ProxyError, ProxyResult};
use crate::types::AgentInfo;

/// Default TTL of the health-status cache.
pub const DEFAULT_HEALTH_CACHE_TTL: Duration = Duration::from_secs(30);

/// Health classification of an agent probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentHealth {
    /// Probe returned 200.
    Healthy,
    /// Probe returned a non-200 status.
    Unhealthy,
    /// Probe failed at the network level.
    Unreachable,
    /// Agent has no FQDN to probe.
    Unknown,
}

struct HealthCache {
    statuses: HashMap<String, AgentHealth>,
    last_check: Option<Instant>,
}

/// Registry for agent information with cached health probing.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentInfo>>,
    config_dir: Option<PathBuf>,
    registry_filename: String,
    http: reqwest::Client,
    health: RwLock<HealthCache>,
    health_cache_ttl: Duration,
}

impl AgentRegistry {
    /// Create a registry from a pre-loaded agent map.
    pub fn new(agents: HashMap<String, AgentInfo>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(
                crate::types::DEFAULT_CARD_FETCH_TIMEOUT_SECS,
            ))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            agents: RwLock::new(agents),
            config_dir: None,
            registry_filename: "agent-registry.yaml".to_string(),
            http,
            health: RwLock::new(HealthCache {
                statuses: HashMap::new(),
                last_check: None,
            }),
            health_cache_ttl: DEFAULT_HEALTH_CACHE_TTL,
        }
    }

    /// Create a registry that can `refresh` itself from a config directory.
    pub fn with_config_source(
        agents: HashMap<String, AgentInfo>,
        config_dir: PathBuf,
        registry_filename: impl Into<String>,
    ) -> Self {
        let mut registry = Self::new(agents);
        registry.config_dir = Some(config_dir);
        registry.registry_filename = registry_filename.into();
        registry
    }

    /// Override the health-cache TTL (mostly for tests).
    pub fn with_health_cache_ttl(mut self, ttl: Duration) -> Self {
        self.health_cache_ttl = ttl;
        self
    }

    /// Look up an agent by id.
    pub async fn get(&self, agent_id: &str) -> Option<AgentInfo> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// All agents belonging to a group.
    pub async fn get_by_group(&self, group: &str) -> Vec<AgentInfo> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.group == group)
            .cloned()
            .collect()
    }

    /// Snapshot of the whole registry.
    pub async fn all(&self) -> HashMap<String, AgentInfo> {
        self.agents.read().await.clone()
    }

    /// Add (or replace) an agent. Invalidates its cached health.
    pub async fn add(&self, info: AgentInfo) {
        let id = info.id.clone();
        self.agents.write().await.insert(id.clone(), info);
        self.health.write().await.statuses.remove(&id);
    }

    /// Remove an agent by id.
    pub async fn remove(&self, agent_id: &str) {
        self.agents.write().await.remove(agent_id);
        self.health.write().await.statuses.remove(agent_id);
    }

    /// Number of registered agents.
    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Distinct group names.
    pub async fn groups(&self) -> Vec<String> {
        let agents = self.agents.read().await;
        let mut groups: Vec<String> = agents
            .values()
            .map(|a| a.group.clone())
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        groups.sort();
        groups
    }

    /// Re-read the agent registry from the configured source.
    pub async fn refresh(&self) -> ProxyResult<()> {
        let Some(dir) = &self.config_dir else {
            return Err(ProxyError::Config(
                "registry has no config source to refresh from".to_string(),
            ));
        };
        let loader = ConfigLoader::new(dir.clone())?;
        let new_agents = loader.load_agent_registry(&self.registry_filename)?;
        let count = new_agents.len();
        *self.agents.write().await = new_agents;
        self.health.write().await.statuses.clear();
        info!(agent_count = count, "Agent registry refreshed");
        Ok(())
    }

    /// Health status of all agents.
    ///
    /// Probes run concurrently and results are cached for the configured
    /// TTL; concurrent callers may observe a stale but consistent snapshot.
    pub async fn health_status(&self) -> HashMap<String, AgentHealth> {
        {
            let cache = self.health.read().await;
            if let Some(last) = cache.last_check {
                if last.elapsed() < self.health_cache_ttl {
                    return cache.statuses.clone();
                }
            }
        }

        let agents = self.agents.read().await.clone();
        let probes = agents
            .values()
            .map(|agent| self.probe_agent(agent.clone()));
        let results: Vec<(String, AgentHealth)> = join_all(probes).await;

        let mut cache = self.health.write().await;
        cache.statuses = results.into_iter().collect();
        cache.last_check = Some(Instant::now());
        cache.statuses.clone()
    }

    async fn probe_agent(&self, agent: AgentInfo) -> (String, AgentHealth) {
        let Some(fqdn) = &agent.fqdn else {
            return (agent.id, AgentHealth::Unknown);
        };
        let url = format!("http://{}{}", fqdn, agent.health_endpoint);
        let health = match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => AgentHealth::Healthy,
            Ok(resp) => {
                debug!(agent_id = %agent.id, status = %resp.status(), "Agent health probe failed");
                AgentHealth::Unhealthy
            }
            Err(e) => {
                debug!(agent_id = %agent.id, error = %e, "Agent unreachable");
                AgentHealth::Unreachable
            }
        };
        (agent.id, health)
    }

    /// Fetch the agent's card from its card endpoint. On any failure a
    /// minimal fallback card is returned carrying the error detail.
    pub async fn fetch_agent_card(&self, agent: &AgentInfo) -> serde_json::Value {
        let Some(fqdn) = &agent.fqdn else {
            return fallback_card(agent, "agent has no local endpoint");
        };
        let url = format!("http://{}{}", fqdn, agent.agent_card_endpoint);
        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(card) => card,
                Err(e) => {
                    warn!(agent_id = %agent.id, error = %e, "Agent card was not valid JSON");
                    fallback_card(agent, &format!("invalid card JSON: {e}"))
                }
            },
            Ok(resp) => {
                warn!(agent_id = %agent.id, status = %resp.status(), "Agent card fetch failed");
                fallback_card(agent, &format!("card fetch returned {}", resp.status()))
            }
            Err(e) => {
                warn!(agent_id = %agent.id, error = %e, "Agent card fetch failed");
                fallback_card(agent, &format!("failed to fetch agent card: {e}"))
            }
        }
    }
}

fn fallback_card(agent: &AgentInfo, error: &str) -> serde_json::Value {
    serde_json::json!({
        "name": format!("Agent {}", agent.id),
        "description": format!("Agent {} (card fetch failed)", agent.id),
        "url": agent
            .fqdn
            .as_ref()
            .map(|f| format!("http://{f}"))
            .unwrap_or_default(),
        "version": "1.0.0",
        "capabilities": agent.a2a_capabilities,
        "error": error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_agents() -> HashMap<String, AgentInfo> {
        let writer = AgentInfo::new("writer", "proxy-1", "blog")
            .unwrap()
            .with_fqdn("writer.local:8002");
        let critic = AgentInfo::new("critic", "proxy-2", "review").unwrap();
        [("writer".to_string(), writer), ("critic".to_string(), critic)]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn lookup_and_groups() {
        let registry = AgentRegistry::new(sample_agents());
        assert_eq!(registry.count().await, 2);
        assert!(registry.get("writer").await.is_some());
        assert!(registry.get("missing").await.is_none());
        assert_eq!(registry.get_by_group("review").await.len(), 1);
        assert_eq!(registry.groups().await, vec!["blog", "review"]);
    }

    #[tokio::test]
    async fn add_and_remove() {
        let registry = AgentRegistry::new(HashMap::new());
        let agent = AgentInfo::new("editor", "proxy-1", "blog").unwrap();
        registry.add(agent).await;
        assert_eq!(registry.count().await, 1);
        registry.remove("editor").await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn health_marks_missing_fqdn_unknown() {
        let registry = AgentRegistry::new(sample_agents());
        let health = registry.health_status().await;
        assert_eq!(health["critic"], AgentHealth::Unknown);
    }
}
