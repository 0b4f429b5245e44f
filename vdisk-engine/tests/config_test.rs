//! Integration tests for engine configuration and startup.

use std::io::Write;
use std::sync::Arc;

use serde_json::json;
use vdisk_engine::{Engine, EngineConfig, MockProxy, PoolType, RecoveryStrategy};

const FULL_CONFIG: &str = r#"
cluster:
  nodes:
    - name: host1
      tags: [node1, main]
    - name: host2
      tags: [node2]
  partition: [host1]
pools:
  - name: images
    type: filesystem
    params:
      path: /srv/images
  - name: vg
    type: lvm
    access: [host2]
    params:
      volume_group: vg0
  - name: br
    type: linux_bridge
    params:
      switch: "host1:br0 host2:br0"
images:
  default_format: raw
  default_size: 1G
  suffix_length: 6
recovery: rollback
logging:
  level: debug
  format: json
"#;

/// Test configuration loading from a YAML file.
#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(FULL_CONFIG.as_bytes()).unwrap();

    let config = EngineConfig::load(file.path()).unwrap();
    assert_eq!(config.cluster.nodes.len(), 2);
    assert_eq!(config.cluster.nodes[0].tags, vec!["node1".to_string(), "main".to_string()]);
    assert_eq!(config.pools[2].pool_type, PoolType::LinuxBridge);
    assert_eq!(config.images.suffix_length, 6);
    assert_eq!(config.recovery, RecoveryStrategy::Rollback);
    assert_eq!(config.logging.format, "json");
    assert!(config.validate().is_ok());
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = EngineConfig::load(dir.path().join("absent.yaml")).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
}

#[test]
fn test_yaml_round_trip() {
    let config = EngineConfig::from_yaml(FULL_CONFIG).unwrap();
    let yaml = config.to_yaml().unwrap();
    assert_eq!(EngineConfig::from_yaml(&yaml).unwrap(), config);
}

#[test]
fn test_empty_document_uses_defaults() {
    let config = EngineConfig::from_yaml("{}").unwrap();
    assert_eq!(config, EngineConfig::default());
    assert!(config.validate().is_ok());
}

#[tokio::test]
async fn test_startup_creates_declared_pools() {
    let config = EngineConfig::from_yaml(FULL_CONFIG).unwrap();
    let engine = Engine::startup(&config, Arc::new(MockProxy::new())).await.unwrap();
    let resources = engine.resources();

    let pools = resources.list_pools().await;
    assert_eq!(pools.len(), 3);

    // The wildcard is resolved to every cluster node, not the partition
    let images = resources.query_pool("images").await.unwrap();
    let access = resources.get_pool_info(&images, Some("meta.access.nodes")).await.unwrap();
    assert_eq!(access, json!({"nodes": ["host1", "host2"]}));

    let vg = resources.query_pool("vg").await.unwrap();
    let access = resources.get_pool_info(&vg, Some("meta.access")).await.unwrap();
    assert_eq!(access, json!({"access": {"nodes": ["host2"]}}));

    let br = resources.query_pool("br").await.unwrap();
    let host2 = resources.customize_pool_config(&br, "host2").await.unwrap();
    assert_eq!(host2.spec.bridge.unwrap().switch.len(), 1);
}

#[tokio::test]
async fn test_startup_rejects_invalid_config() {
    let mut config = EngineConfig::from_yaml(FULL_CONFIG).unwrap();
    config.pools[1].access = vec!["host7".into()];

    let err = Engine::startup(&config, Arc::new(MockProxy::new())).await.err().unwrap();
    assert_eq!(err.category(), vdisk_engine::ErrorCategory::InvalidRequest);
}
