//! Loaders for node configuration and pipeline specs.
//!
//! - Node settings: one TOML file deserialized into [`ManagerConfig`].
//! - Pipeline specs: `.json`, `.yaml` or `.yml` files deserialized into
//!   [`PipelineSpec`], one at a time or a whole directory at once.

use crate::config::error::ConfigError;
use crate::config::error::ConfigResult;
use dcp_protocol::config_models::ManagerConfig;
use dcp_protocol::pipeline_models::PipelineSpec;
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

/// Loads a node configuration from a TOML file.
///
/// Only `role` and `participantId` are required. The `broker`,
/// `fileServer` and `transfer` sections fall back to their defaults.
///
/// # Arguments
///
/// * `path` - Path of the TOML file
///
/// # Errors
///
/// Returns `ConfigError` if:
/// - The file cannot be read
/// - The file is not valid TOML or misses required fields
/// - The participant id is empty
///
/// # Example
///
/// ```rust,no_run
/// use dcp_core::config::loader::load_config;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = load_config(Path::new("node.toml")).await?;
/// println!("Node {} ({:?})", config.participant_id, config.role);
/// # Ok(())
/// # }
/// ```
pub async fn load_config(path: &Path) -> ConfigResult<ManagerConfig> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;

    let config: ManagerConfig =
        toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        })?;

    if config.participant_id.trim().is_empty() {
        return Err(ConfigError::InvalidConfig {
            path: path.to_path_buf(),
            reason: "participantId must not be empty".to_string(),
        });
    }
    if config.transfer.chunk_size == 0 {
        return Err(ConfigError::InvalidConfig {
            path: path.to_path_buf(),
            reason: "transfer.chunkSize must be greater than zero".to_string(),
        });
    }

    Ok(config)
}

/// Loads one pipeline spec. The format is chosen by extension.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed, or if its
/// extension is not `json`, `yaml` or `yml`.
pub fn load_pipeline_spec(path: &Path) -> ConfigResult<PipelineSpec> {
    let ext = path.extension().and_then(|s| s.to_str());
    if !matches!(ext, Some("json" | "yaml" | "yml")) {
        return Err(ConfigError::InvalidConfig {
            path: path.to_path_buf(),
            reason: "Pipeline specs must be .json, .yaml or .yml files".to_string(),
        });
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;

    if ext == Some("json") {
        serde_json::from_str(&content).map_err(|source| ConfigError::JsonParse {
            path: path.to_path_buf(),
            source,
        })
    } else {
        serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Loads every pipeline spec directly inside `dir`, keyed by file stem.
///
/// Files with other extensions are skipped. A missing directory yields an
/// empty map.
///
/// # Errors
///
/// Returns the first `ConfigError` met while walking or parsing.
pub fn load_pipeline_specs(dir: &Path) -> ConfigResult<BTreeMap<String, PipelineSpec>> {
    let mut specs = BTreeMap::new();
    if !dir.exists() {
        return Ok(specs);
    }

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|source| ConfigError::DirectoryWalk {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();

        let ext = path.extension().and_then(|s| s.to_str());
        if !matches!(ext, Some("json" | "yaml" | "yml")) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        specs.insert(name.to_string(), load_pipeline_spec(path)?);
    }

    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcp_protocol::config_models::{NodeRole, DEFAULT_CHUNK_SIZE};
    use dcp_protocol::pipeline_models::{ControllerType, InputSource};
    use std::fs;
    use tempfile::tempdir;

    const SPEC_YAML: &str = r#"
steps:
  - controller:
      type: local
    computations:
      - meta: { id: sum }
        computation: { type: process, command: ["./sum"] }
    inputMap:
      start: { value: 1 }
  - controller:
      type: decentralized
    computations:
      - meta: { id: sum }
        computation: { type: process, command: ["./sum"] }
    inputMap:
      start: { fromCache: { step: 0, variable: sum } }
owner: site-a
limitOutputToOwner: true
"#;

    #[tokio::test]
    async fn test_load_config_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(
            &path,
            r#"
role = "peer"
participantId = "site-a"

[fileServer]
host = "central.example.org"
"#,
        )
        .unwrap();

        let config = load_config(&path).await.unwrap();

        assert_eq!(config.role, NodeRole::Peer);
        assert_eq!(config.participant_id, "site-a");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.file_server.host, "central.example.org");
        assert_eq!(config.file_server.port, 3300);
        assert_eq!(config.transfer.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.transfer.get_retry_limit, 300);
    }

    #[tokio::test]
    async fn test_load_config_missing_file() {
        let dir = tempdir().unwrap();
        let result = load_config(&dir.path().join("absent.toml")).await;
        assert!(matches!(result, Err(ConfigError::FileRead { .. })));
    }

    #[tokio::test]
    async fn test_load_config_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(&path, "role = [invalid toml").unwrap();

        let result = load_config(&path).await;
        if let Err(ConfigError::TomlParse { path, .. }) = result {
            assert!(path.ends_with("node.toml"));
        } else {
            panic!("Expected TomlParse error");
        }
    }

    #[tokio::test]
    async fn test_load_config_rejects_empty_participant() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(&path, "role = \"central\"\nparticipantId = \"  \"\n").unwrap();

        let result = load_config(&path).await;
        assert!(matches!(result, Err(ConfigError::InvalidConfig { .. })));
    }

    #[test]
    fn test_load_yaml_spec() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sum.yaml");
        fs::write(&path, SPEC_YAML).unwrap();

        let spec = load_pipeline_spec(&path).unwrap();

        assert_eq!(spec.steps.len(), 2);
        assert_eq!(spec.steps[1].controller.controller_type, ControllerType::Decentralized);
        assert!(matches!(
            spec.steps[1].input_map.get("start"),
            Some(InputSource::FromCache { .. })
        ));
        assert_eq!(spec.owner.as_deref(), Some("site-a"));
        assert!(spec.limit_output_to_owner);
    }

    #[test]
    fn test_load_json_spec_and_unknown_extension() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("one.json");
        fs::write(
            &json_path,
            r#"{"steps":[{"controller":{"type":"local"},"computations":[{"meta":{"id":"x"},"computation":{"type":"docker","dockerImage":"x:latest"}}]}]}"#,
        )
        .unwrap();
        let spec = load_pipeline_spec(&json_path).unwrap();
        assert_eq!(spec.steps.len(), 1);
        assert!(!spec.limit_output_to_owner);

        let txt_path = dir.path().join("notes.txt");
        fs::write(&txt_path, "steps: []").unwrap();
        assert!(matches!(
            load_pipeline_spec(&txt_path),
            Err(ConfigError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_load_pipeline_specs_from_directory() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("sum.yaml"), SPEC_YAML).unwrap();
        fs::write(dir.path().join("README.md"), "# not a spec").unwrap();

        let specs = load_pipeline_specs(dir.path()).unwrap();
        assert_eq!(specs.keys().collect::<Vec<_>>(), ["sum"]);

        let missing = load_pipeline_specs(&dir.path().join("absent")).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_invalid_yaml_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.yml");
        fs::write(&path, "steps:\n  - controller: [yaml").unwrap();

        if let Err(ConfigError::YamlParse { path, .. }) = load_pipeline_spec(&path) {
            assert!(path.ends_with("broken.yml"));
        } else {
            panic!("Expected YamlParse error");
        }
    }
}
