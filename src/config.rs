use std::collections::BTreeMap;
use std::fs;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::StudyCode;
use crate::error::PipelineError;

pub const DEFAULT_CONFIG_FILE: &str = "biobank-pipeline.json";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub inputs: InputsSection,
    #[serde(default)]
    pub processed_dir: Option<String>,
    #[serde(default)]
    pub output_dir: Option<String>,
    /// Tracking workbooks label studies by project name, not biobank code.
    #[serde(default)]
    pub study_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub lookup: Option<LookupSection>,
    #[serde(default)]
    pub dashboard: Option<Value>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct InputsSection {
    pub inventory_dir: String,
    pub tracking_dir: String,
    pub citations_file: String,
    pub studies_file: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LookupSection {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub cooldown_ms: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LookupOptions {
    pub enabled: bool,
    pub cooldown_ms: u64,
    pub timeout_secs: u64,
}

impl Default for LookupOptions {
    fn default() -> Self {
        // The bibliographic index enforces a cooldown between calls.
        Self {
            enabled: true,
            cooldown_ms: 400,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub inventory_dir: Utf8PathBuf,
    pub tracking_dir: Utf8PathBuf,
    pub citations_file: Utf8PathBuf,
    pub studies_file: Utf8PathBuf,
    pub processed_dir: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    pub study_labels: BTreeMap<String, StudyCode>,
    pub lookup: LookupOptions,
    pub dashboard: Value,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, PipelineError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.as_std_path().exists() {
            return Err(PipelineError::MissingConfig);
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| PipelineError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| PipelineError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, PipelineError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let mut study_labels = BTreeMap::new();
        for (label, code) in config.study_labels {
            study_labels.insert(label, code.parse()?);
        }

        let lookup = match config.lookup {
            Some(section) => {
                let defaults = LookupOptions::default();
                LookupOptions {
                    enabled: section.enabled.unwrap_or(defaults.enabled),
                    cooldown_ms: section.cooldown_ms.unwrap_or(defaults.cooldown_ms),
                    timeout_secs: section.timeout_secs.unwrap_or(defaults.timeout_secs),
                }
            }
            None => LookupOptions::default(),
        };

        Ok(ResolvedConfig {
            schema_version,
            inventory_dir: Utf8PathBuf::from(config.inputs.inventory_dir),
            tracking_dir: Utf8PathBuf::from(config.inputs.tracking_dir),
            citations_file: Utf8PathBuf::from(config.inputs.citations_file),
            studies_file: Utf8PathBuf::from(config.inputs.studies_file),
            processed_dir: Utf8PathBuf::from(
                config
                    .processed_dir
                    .unwrap_or_else(|| "data/processed".to_string()),
            ),
            output_dir: Utf8PathBuf::from(
                config.output_dir.unwrap_or_else(|| "public/data".to_string()),
            ),
            study_labels,
            lookup,
            dashboard: config.dashboard.unwrap_or(Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            schema_version: None,
            inputs: InputsSection {
                inventory_dir: "raw/inventory".to_string(),
                tracking_dir: "raw/tracking".to_string(),
                citations_file: "raw/citations.json".to_string(),
                studies_file: "raw/studies.json".to_string(),
            },
            processed_dir: None,
            output_dir: None,
            study_labels: BTreeMap::from([(
                "Prometheus".to_string(),
                "du17-04".to_string(),
            )]),
            lookup: None,
            dashboard: None,
        }
    }

    #[test]
    fn resolve_defaults() {
        let resolved = ConfigLoader::resolve_config(base_config()).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.processed_dir, Utf8PathBuf::from("data/processed"));
        assert_eq!(resolved.output_dir, Utf8PathBuf::from("public/data"));
        assert!(resolved.lookup.enabled);
        assert_eq!(resolved.lookup.cooldown_ms, 400);
    }

    #[test]
    fn resolve_normalizes_study_labels() {
        let resolved = ConfigLoader::resolve_config(base_config()).unwrap();
        assert_eq!(
            resolved.study_labels.get("Prometheus").map(|c| c.as_str()),
            Some("DU17-04")
        );
    }

    #[test]
    fn resolve_rejects_bad_label_code() {
        let mut config = base_config();
        config
            .study_labels
            .insert("Broken".to_string(), "   ".to_string());
        assert!(ConfigLoader::resolve_config(config).is_err());
    }
}
