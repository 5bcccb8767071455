//! Configuration system tests
//!
//! Tests loading, validation and the mapping to runtime settings

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use peerwire::config::{generate_default_config, init_config, NodeConfig};
use peerwire::error::{Error, ErrorCode};

/// Test fixture for configuration testing
struct ConfigFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("node.toml");
        Self {
            _temp_dir: temp_dir,
            config_path,
        }
    }

    fn write_config(&self, content: &str) {
        fs::write(&self.config_path, content).unwrap();
    }

    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }
}

// ─────────────────────────────────────────────────────────────────
// Valid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_minimal_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[group]\nidentifier = \"minimal\"\n");

    let config = NodeConfig::load(Some(fixture.path())).unwrap();
    assert_eq!(config.group.identifier, "minimal");
    assert_eq!(config.group.instances_per_node, 1);
    assert_eq!(config.discovery.local_port, 7100);
}

#[test]
fn test_full_config_maps_to_runtime_settings() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[instance]
name = "trainer-1"
local_position = 1

[group]
identifier = "experiment"
node_name = "rack-3"
node_ip = "10.0.0.3"
instances_per_node = 4
number_of_nodes = 2
is_discovery_leader_node = false

[discovery]
local_port = 7300
global_address = "10.0.0.1:7400"
ping_interval_ms = 50
timeout_ms = 20000

[timeouts]
payload_retry_ms = 25
close_abort_ms = 3000
poll_interval_ms = 2

[forwarding]
enabled = false

[fault_injection]
drop_probability = 0.05

[logging]
level = "debug"
"#,
    );

    let config = NodeConfig::load(Some(fixture.path())).unwrap();
    let runtime = config.communicator_config();

    assert_eq!(runtime.instance_name, "trainer-1");
    assert_eq!(runtime.node_name, "rack-3");
    assert_eq!(runtime.local_position, 1);
    assert_eq!(runtime.instances_per_node, 4);
    assert_eq!(runtime.number_of_nodes, 2);
    assert!(!runtime.is_discovery_leader_node);
    assert!(!runtime.forward_register_peer);
    assert_eq!(runtime.local_discovery_port, 7300);
    assert_eq!(runtime.global_discovery_address, "10.0.0.1:7400");
    assert_eq!(runtime.ping_interval, Duration::from_millis(50));
    assert_eq!(runtime.poll_interval, Duration::from_millis(2));
    assert_eq!(runtime.timeouts.payload_retry, Duration::from_millis(25));
    assert_eq!(runtime.timeouts.close_abort, Duration::from_secs(3));
    assert!(runtime.fault_injection.is_enabled());

    assert_eq!(runtime.localhost_group_identifier(), "experiment/rack-3");
    assert_eq!(runtime.multi_node_group_identifier(), "experiment/multi-node");
}

#[test]
fn test_generated_default_file_loads() {
    let fixture = ConfigFixture::new();
    fixture.write_config(&generate_default_config());

    let config = NodeConfig::load(Some(fixture.path())).unwrap();
    assert!(config.forwarding.enabled);
    assert_eq!(config.fault_injection.drop_probability, 0.0);
}

#[test]
fn test_init_config_writes_file_once() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("node.toml");
    let path_str = path.to_str().unwrap();

    let written = init_config(Some(path_str), false).unwrap();
    assert_eq!(written, path);
    assert!(fs::read_to_string(&path).unwrap().contains("[discovery]"));

    assert!(init_config(Some(path_str), false).is_err());
    assert!(init_config(Some(path_str), true).is_ok());
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_missing_explicit_file() {
    let err = NodeConfig::load(Some("/nonexistent/peerwire/node.toml")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigNotFound);
}

#[test]
fn test_invalid_toml_syntax() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[group\nidentifier = ");

    let err = NodeConfig::load(Some(fixture.path())).unwrap_err();
    assert!(matches!(err, Error::ConfigParse { .. }));
}

#[test]
fn test_wrong_value_type() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[discovery]\nlocal_port = \"seven\"\n");

    let err = NodeConfig::load(Some(fixture.path())).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigParseError);
}

#[test]
fn test_multi_node_requires_global_address() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[group]\nnumber_of_nodes = 3\n\n[discovery]\nglobal_address = \"\"\n");

    match NodeConfig::load(Some(fixture.path())).unwrap_err() {
        Error::ConfigValidation { field, .. } => {
            assert_eq!(field.as_deref(), Some("discovery.global_address"));
        }
        other => panic!("expected ConfigValidation, got {other:?}"),
    }
}

#[test]
fn test_zero_timeout_rejected() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[timeouts]\npayload_abort_ms = 0\n");

    match NodeConfig::load(Some(fixture.path())).unwrap_err() {
        Error::ConfigValidation { field, .. } => {
            assert_eq!(field.as_deref(), Some("timeouts.payload_abort_ms"));
        }
        other => panic!("expected ConfigValidation, got {other:?}"),
    }
}

#[test]
fn test_drop_probability_out_of_range() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[fault_injection]\ndrop_probability = 1.5\n");

    let err = NodeConfig::load(Some(fixture.path())).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigValidation);
}
