//! Configuration and document loading for Stepwave.
//!
//! Reads `config.toml` from the data directory (`~/.stepwave/` in production)
//! into [`GlobalConfig`], falling back to defaults when the file is missing
//! or malformed. Also loads workflow templates and step definitions from
//! YAML or JSON files for the CLI.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use stepwave_types::config::GlobalConfig;
use stepwave_types::workflow::{StepDefinition, WorkflowTemplate};

/// Resolve the data directory.
///
/// `STEPWAVE_DATA_DIR` wins; otherwise `~/.stepwave`, and `./.stepwave` when
/// no home directory is known.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STEPWAVE_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".stepwave");
    }

    PathBuf::from(".stepwave")
}

/// Load global configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`GlobalConfig::default()`].
/// - Unreadable or unparseable file: logs a warning and returns the default.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
    };

    match toml::from_str::<GlobalConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            GlobalConfig::default()
        }
    }
}

/// Errors loading a template or definition document.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml_ng::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Parse a document by extension: `.json` as JSON, anything else as YAML.
async fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T, DocumentError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DocumentError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(&content).map_err(|source| DocumentError::Json {
            path: path.to_path_buf(),
            source,
        })
    } else {
        serde_yaml_ng::from_str(&content).map_err(|source| DocumentError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Load a workflow template file.
pub async fn load_template(path: &Path) -> Result<WorkflowTemplate, DocumentError> {
    load_document(path).await
}

/// A definitions file holds either one definition or a list of them.
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum DefinitionDocument {
    Many(Vec<StepDefinition>),
    One(Box<StepDefinition>),
}

/// Load one or more step definitions from a file.
pub async fn load_definitions(path: &Path) -> Result<Vec<StepDefinition>, DocumentError> {
    Ok(match load_document::<DefinitionDocument>(path).await? {
        DefinitionDocument::Many(defs) => defs,
        DefinitionDocument::One(def) => vec![*def],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_global_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.engine.max_retries, 3);
        assert_eq!(config.engine.stale_threshold_ms, 30_000);
    }

    #[tokio::test]
    async fn load_global_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[engine]
max_retries = 7
heartbeat_interval_ms = 2500
"#,
        )
        .await
        .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.engine.max_retries, 7);
        assert_eq!(config.engine.heartbeat_interval_ms, 2_500);
        assert_eq!(config.engine.lease_ttl_ms, 60_000);
    }

    #[tokio::test]
    async fn load_global_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.engine.max_retries, 3);
    }

    #[tokio::test]
    async fn load_template_from_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tpl.yaml");
        tokio::fs::write(
            &path,
            r#"
id: nightly
name: Nightly
internal_json:
  x: 10
waves:
  1:
    check:
      definition_id: check-x
  2:
    report:
      definition_id: report
"#,
        )
        .await
        .unwrap();

        let tpl = load_template(&path).await.unwrap();
        assert_eq!(tpl.id, "nightly");
        assert_eq!(tpl.waves.len(), 2);
        assert_eq!(tpl.internal_json["x"], 10);
    }

    #[tokio::test]
    async fn load_definitions_single_and_list() {
        let tmp = TempDir::new().unwrap();

        let one = tmp.path().join("one.json");
        tokio::fs::write(
            &one,
            r#"{"id": "double", "name": "Double", "kind": {"type": "function", "body": "x * 2"}}"#,
        )
        .await
        .unwrap();
        let defs = load_definitions(&one).await.unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].id, "double");

        let many = tmp.path().join("many.yml");
        tokio::fs::write(
            &many,
            r#"
- id: check-x
  name: Check X
  kind:
    type: control
    expression: "if x > 5: continue report;"
- id: report
  name: Report
  kind:
    type: function
    body: "'done'"
"#,
        )
        .await
        .unwrap();
        let defs = load_definitions(&many).await.unwrap();
        assert_eq!(defs.len(), 2);
        assert!(defs[0].is_control());
    }

    #[tokio::test]
    async fn load_document_reports_path_on_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.json");
        tokio::fs::write(&path, "{ nope").await.unwrap();

        let err = load_template(&path).await.unwrap_err();
        assert!(matches!(err, DocumentError::Json { .. }));
        assert!(err.to_string().contains("broken.json"));

        let missing = load_template(&tmp.path().join("absent.yaml")).await.unwrap_err();
        assert!(matches!(missing, DocumentError::Read { .. }));
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: restored immediately; no other test reads this variable's value.
        unsafe {
            std::env::set_var("STEPWAVE_DATA_DIR", "/tmp/test-stepwave");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-stepwave"));
        unsafe {
            std::env::remove_var("STEPWAVE_DATA_DIR");
        }
    }
}
