//! Configuration surface — YAML files, one per proxy.
//!
//! Two files make up a deployment: the proxy config (identity, bus
//! settings, subscriptions, hosted agents, session limits, coordinator
//! group definitions) and the agent registry (group → agents). The agent
//! registry can also be embedded inline in the proxy config under
//! `agentRegistry`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ProxyError, ProxyResult};
use crate::types::{AgentInfo, ProxyRole, AGENT_CARD_PATH, HEALTH_PATH};

// ---------------------------------------------------------------------------
// Service Bus settings
// ---------------------------------------------------------------------------

/// Connection settings for the Service Bus namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBusSettings {
    /// Namespace, bare (`my-ns`) or fully qualified.
    pub namespace: String,
    /// Shared-access connection string. When absent, ambient (managed
    /// identity) credentials are used.
    #[serde(default)]
    pub connection_string: Option<String>,
    /// Default message TTL in seconds applied at send time.
    #[serde(default = "default_message_ttl")]
    pub default_message_ttl: i64,
    /// Maximum broker delivery attempts before dead-lettering.
    #[serde(default = "default_max_retry")]
    pub max_retry_count: u32,
    /// Receive long-poll timeout in seconds.
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout: u64,
}

fn default_message_ttl() -> i64 {
    3600
}

fn default_max_retry() -> u32 {
    3
}

fn default_receive_timeout() -> u64 {
    30
}

impl ServiceBusSettings {
    /// Fully qualified namespace host for credential-based auth.
    pub fn fully_qualified_namespace(&self) -> String {
        if self.namespace.ends_with(".servicebus.windows.net") {
            self.namespace.clone()
        } else {
            format!("{}.servicebus.windows.net", self.namespace)
        }
    }
}

// ---------------------------------------------------------------------------
// Topic group config
// ---------------------------------------------------------------------------

/// Per-group topic properties managed by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicGroupConfig {
    /// Group name; becomes the middle segment of the topic triple.
    pub name: String,
    /// Free-form description shown by the admin surface.
    #[serde(default)]
    pub description: String,
    /// Maximum topic size in megabytes.
    #[serde(default = "default_max_size_mb", alias = "maxMessageSizeMB")]
    pub max_message_size_mb: u32,
    /// Message TTL for the topics, seconds.
    #[serde(default = "default_message_ttl", alias = "messageTTLSeconds")]
    pub message_ttl_seconds: i64,
    /// Whether topics are partitioned across brokers.
    #[serde(default = "default_true")]
    pub enable_partitioning: bool,
    /// Duplicate-detection history window, minutes.
    #[serde(default = "default_dup_window")]
    pub duplicate_detection_window_minutes: u32,
}

fn default_max_size_mb() -> u32 {
    1
}

fn default_dup_window() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Session settings
// ---------------------------------------------------------------------------

/// Limits and sweep cadence for the proxy-level session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    /// TTL applied when the caller doesn't supply one, seconds.
    #[serde(default = "default_session_ttl")]
    pub default_ttl_seconds: i64,
    /// Hard ceiling any requested TTL is clamped to, seconds.
    #[serde(default = "default_session_max_ttl")]
    pub max_ttl_seconds: i64,
    /// Background sweep cadence, seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    /// Per-agent session cap, enforced loudly on create.
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_agent: usize,
    /// Directory for the file-backed session store.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

fn default_session_ttl() -> i64 {
    3600
}

fn default_session_max_ttl() -> i64 {
    86400
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_max_sessions() -> usize {
    100
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/sessions")
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_ttl_seconds: default_session_ttl(),
            max_ttl_seconds: default_session_max_ttl(),
            cleanup_interval_seconds: default_cleanup_interval(),
            max_sessions_per_agent: default_max_sessions(),
            store_path: default_store_path(),
        }
    }
}

impl SessionSettings {
    /// Clamp a requested TTL into `[1, max_ttl_seconds]`.
    pub fn clamp_ttl(&self, ttl_seconds: i64) -> i64 {
        ttl_seconds.clamp(1, self.max_ttl_seconds)
    }
}

// ---------------------------------------------------------------------------
// Proxy config
// ---------------------------------------------------------------------------

/// A `{group, filter}` subscription request from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Agent group (or the literal `notifications`).
    pub group: String,
    /// SQL filter predicate installed broker-side, e.g. `toAgent = 'writer'`.
    #[serde(default)]
    pub filter: String,
}

/// Identity block of the proxy config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyIdentity {
    /// Unique proxy identifier.
    pub id: String,
    /// Coordinator or follower.
    pub role: ProxyRole,
    /// HTTP listen port.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

/// Complete parsed proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Identity of this proxy instance.
    pub proxy: ProxyIdentity,
    /// Bus connection settings; absent means local-only mode.
    #[serde(default)]
    pub servicebus: Option<ServiceBusSettings>,
    /// group → ordered agent ids hosted behind this proxy.
    #[serde(default)]
    pub hosted_agents: HashMap<String, Vec<String>>,
    /// Request/notification subscriptions this proxy consumes.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
    /// Session store limits.
    #[serde(default)]
    pub sessions: Option<SessionSettings>,
    /// Coordinator-managed topic groups.
    #[serde(default)]
    pub agent_groups: Vec<TopicGroupConfig>,
    /// Inline agent registry, same shape as the standalone registry file.
    #[serde(default)]
    pub agent_registry: Option<AgentRegistryConfig>,
}

impl ProxyConfig {
    /// Validate the invariants serde cannot express.
    pub fn validate(&self) -> ProxyResult<()> {
        if self.proxy.id.is_empty() {
            return Err(ProxyError::Config("proxy id is required".to_string()));
        }
        if self.proxy.port == 0 {
            return Err(ProxyError::Config(
                "port must be between 1 and 65535".to_string(),
            ));
        }
        for sub in &self.subscriptions {
            if sub.group.is_empty() {
                return Err(ProxyError::Config(
                    "subscription config missing group".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Find a coordinator-managed group by name.
    pub fn find_group(&self, name: &str) -> Option<&TopicGroupConfig> {
        self.agent_groups.iter().find(|g| g.name == name)
    }
}

// ---------------------------------------------------------------------------
// Agent registry file
// ---------------------------------------------------------------------------

/// A single agent entry in the registry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    /// Agent identifier.
    pub id: String,
    /// Proxy that hosts this agent.
    pub proxy_id: String,
    /// host:port, present for locally reachable agents.
    #[serde(default)]
    pub fqdn: Option<String>,
    /// Health probe path.
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,
    /// Agent card path.
    #[serde(default = "default_card_endpoint")]
    pub agent_card_endpoint: String,
    /// Capability tags.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Opaque A2A capability mapping.
    #[serde(default)]
    pub a2a_capabilities: HashMap<String, serde_json::Value>,
}

fn default_health_endpoint() -> String {
    HEALTH_PATH.to_string()
}

fn default_card_endpoint() -> String {
    AGENT_CARD_PATH.to_string()
}

/// A group's agent list in the registry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentGroupEntry {
    /// Agents belonging to the group, in configured order.
    pub agents: Vec<AgentEntry>,
}

/// The agent registry file: version header plus group → agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistryConfig {
    /// Schema version of the registry file.
    pub version: String,
    /// Timestamp the file was last regenerated.
    #[serde(default)]
    pub last_updated: String,
    /// group name → agents.
    pub groups: HashMap<String, AgentGroupEntry>,
}

impl AgentRegistryConfig {
    /// Flatten the file layout into `agentId → AgentInfo`.
    pub fn into_agents(self) -> ProxyResult<HashMap<String, AgentInfo>> {
        let mut agents = HashMap::new();
        for (group_name, group) in self.groups {
            for entry in group.agents {
                let mut info = AgentInfo::new(entry.id, entry.proxy_id, group_name.clone())?;
                info.fqdn = entry.fqdn;
                info.health_endpoint = entry.health_endpoint;
                info.agent_card_endpoint = entry.agent_card_endpoint;
                info.capabilities = entry.capabilities;
                info.a2a_capabilities = entry.a2a_capabilities;
                agents.insert(info.id.clone(), info);
            }
        }
        Ok(agents)
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Loads and parses the YAML configuration files from a directory.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Create a loader rooted at `config_dir`. Fails if the directory does
    /// not exist.
    pub fn new(config_dir: impl Into<PathBuf>) -> ProxyResult<Self> {
        let config_dir = config_dir.into();
        if !config_dir.is_dir() {
            return Err(ProxyError::Config(format!(
                "configuration directory '{}' does not exist",
                config_dir.display()
            )));
        }
        Ok(Self { config_dir })
    }

    /// The directory this loader reads from.
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Load and validate the proxy configuration.
    pub fn load_proxy_config(&self, filename: &str) -> ProxyResult<ProxyConfig> {
        let path = self.config_dir.join(filename);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            ProxyError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        let config: ProxyConfig = serde_yaml::from_str(&raw)
            .map_err(|e| ProxyError::Config(format!("failed to parse proxy config: {e}")))?;
        config.validate()?;
        info!(
            proxy_id = %config.proxy.id,
            role = %config.proxy.role,
            port = config.proxy.port,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Load the standalone agent registry file.
    pub fn load_agent_registry(&self, filename: &str) -> ProxyResult<HashMap<String, AgentInfo>> {
        let path = self.config_dir.join(filename);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            ProxyError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        let registry: AgentRegistryConfig = serde_yaml::from_str(&raw)
            .map_err(|e| ProxyError::Config(format!("failed to parse agent registry: {e}")))?;
        registry.into_agents()
    }

    /// Resolve the agent set: the inline `agentRegistry` block wins, the
    /// standalone file is the fallback.
    pub fn resolve_agents(
        &self,
        config: &ProxyConfig,
        registry_filename: &str,
    ) -> ProxyResult<HashMap<String, AgentInfo>> {
        if let Some(inline) = &config.agent_registry {
            return inline.clone().into_agents();
        }
        self.load_agent_registry(registry_filename)
    }
}
