//! Tests for configuration loading — YAML parsing, defaults, inline
//! registry resolution, validation failures.

use a2a_proxy::config::ConfigLoader;
use a2a_proxy::types::ProxyRole;
use tempfile::TempDir;

const PROXY_YAML: &str = r#"
proxy:
  id: proxy-1
  role: coordinator
  port: 8001
servicebus:
  namespace: my-ns
sessions:
  defaultTtlSeconds: 1800
  maxTtlSeconds: 7200
  maxSessionsPerAgent: 10
hostedAgents:
  blog:
    - writer
subscriptions:
  - group: blog
    filter: "toAgent = 'writer'"
  - group: notifications
    filter: ""
agentGroups:
  - name: blog
    description: "blog writing agents"
    maxMessageSizeMB: 2
    messageTTLSeconds: 7200
    enablePartitioning: false
    duplicateDetectionWindowMinutes: 5
agentRegistry:
  version: "1"
  lastUpdated: "2026-06-01"
  groups:
    blog:
      agents:
        - id: writer
          proxyId: proxy-1
          fqdn: writer.local:8002
"#;

const REGISTRY_YAML: &str = r#"
version: "1"
lastUpdated: "2026-06-01"
groups:
  review:
    agents:
      - id: critic
        proxyId: proxy-2
"#;

fn write(dir: &TempDir, name: &str, contents: &str) {
    std::fs::write(dir.path().join(name), contents).unwrap();
}

#[test]
fn loads_full_proxy_config() {
    let dir = TempDir::new().unwrap();
    write(&dir, "proxy-config.yaml", PROXY_YAML);

    let loader = ConfigLoader::new(dir.path()).unwrap();
    let config = loader.load_proxy_config("proxy-config.yaml").unwrap();

    assert_eq!(config.proxy.id, "proxy-1");
    assert_eq!(config.proxy.role, ProxyRole::Coordinator);
    assert_eq!(config.proxy.port, 8001);

    let sb = config.servicebus.as_ref().unwrap();
    assert_eq!(sb.namespace, "my-ns");
    assert!(sb.connection_string.is_none());
    assert_eq!(sb.default_message_ttl, 3600);

    let sessions = config.sessions.as_ref().unwrap();
    assert_eq!(sessions.default_ttl_seconds, 1800);
    assert_eq!(sessions.max_sessions_per_agent, 10);

    assert_eq!(config.hosted_agents["blog"], vec!["writer"]);
    assert_eq!(config.subscriptions.len(), 2);

    let group = config.find_group("blog").unwrap();
    assert_eq!(group.message_ttl_seconds, 7200);
    assert!(!group.enable_partitioning);
    assert!(config.find_group("ghost").is_none());
}

#[test]
fn inline_registry_takes_precedence() {
    let dir = TempDir::new().unwrap();
    write(&dir, "proxy-config.yaml", PROXY_YAML);
    write(&dir, "agent-registry.yaml", REGISTRY_YAML);

    let loader = ConfigLoader::new(dir.path()).unwrap();
    let config = loader.load_proxy_config("proxy-config.yaml").unwrap();
    let agents = loader.resolve_agents(&config, "agent-registry.yaml").unwrap();

    // The inline block wins over the standalone file.
    assert!(agents.contains_key("writer"));
    assert!(!agents.contains_key("critic"));
}

#[test]
fn standalone_registry_used_when_no_inline_block() {
    let dir = TempDir::new().unwrap();
    write(
        &dir,
        "proxy-config.yaml",
        r#"
proxy:
  id: proxy-2
  role: follower
"#,
    );
    write(&dir, "agent-registry.yaml", REGISTRY_YAML);

    let loader = ConfigLoader::new(dir.path()).unwrap();
    let config = loader.load_proxy_config("proxy-config.yaml").unwrap();
    assert_eq!(config.proxy.role, ProxyRole::Follower);
    assert_eq!(config.proxy.port, 8080);

    let agents = loader.resolve_agents(&config, "agent-registry.yaml").unwrap();
    assert!(agents.contains_key("critic"));
}

#[test]
fn missing_directory_rejected() {
    assert!(ConfigLoader::new("/definitely/not/a/real/dir").is_err());
}

#[test]
fn missing_file_rejected() {
    let dir = TempDir::new().unwrap();
    let loader = ConfigLoader::new(dir.path()).unwrap();
    assert!(loader.load_proxy_config("nope.yaml").is_err());
}

#[test]
fn malformed_yaml_rejected() {
    let dir = TempDir::new().unwrap();
    write(&dir, "proxy-config.yaml", "proxy: [not: valid");
    let loader = ConfigLoader::new(dir.path()).unwrap();
    assert!(loader.load_proxy_config("proxy-config.yaml").is_err());
}

#[test]
fn empty_proxy_id_rejected() {
    let dir = TempDir::new().unwrap();
    write(
        &dir,
        "proxy-config.yaml",
        r#"
proxy:
  id: ""
  role: follower
"#,
    );
    let loader = ConfigLoader::new(dir.path()).unwrap();
    assert!(loader.load_proxy_config("proxy-config.yaml").is_err());
}

#[test]
fn registry_entry_with_empty_id_rejected() {
    let dir = TempDir::new().unwrap();
    write(
        &dir,
        "agent-registry.yaml",
        r#"
version: "1"
lastUpdated: "2026-06-01"
groups:
  blog:
    agents:
      - id: ""
        proxyId: proxy-1
"#,
    );
    let loader = ConfigLoader::new(dir.path()).unwrap();
    assert!(loader.load_agent_registry("agent-registry.yaml").is_err());
}
