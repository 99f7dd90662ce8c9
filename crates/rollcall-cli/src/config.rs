use anyhow::{Context, Result};
use rollcall_core::recorder::DEFAULT_SIMILARITY_THRESHOLD;
use rollcall_core::ModelPaths;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Name of the optional config file inside the data directory.
pub const CONFIG_FILE: &str = "rollcall.toml";

/// CLI configuration: defaults, then `rollcall.toml`, then `ROLLCALL_*` variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding `students.csv`, `attendance.csv` and `photos/`.
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Cosine similarity threshold for a positive identification.
    pub similarity_threshold: f32,
    /// Apply CLAHE contrast enhancement to photos before inference.
    pub clahe: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            model_dir: rollcall_core::default_model_dir(),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            clahe: false,
        }
    }
}

impl Config {
    /// Resolve the data directory, read its config file if present, and apply the environment.
    pub fn load(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = data_dir
            .or_else(|| std::env::var("ROLLCALL_DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));

        let mut config = Self::from_dir(&data_dir)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_dir(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::from_toml(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `ROLLCALL_*` variables; unparsable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(threshold) = var("ROLLCALL_SIMILARITY_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.similarity_threshold = threshold;
        }
        if let Some(clahe) = var("ROLLCALL_CLAHE") {
            self.clahe = clahe != "0";
        }
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.data_dir, PathBuf::from("."));
        assert_eq!(config.similarity_threshold, DEFAULT_SIMILARITY_THRESHOLD);
        assert!(!config.clahe);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = Config::from_toml("model_dir = \"/srv/models\"\nclahe = true\n").unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/srv/models"));
        assert!(config.clahe);
        assert_eq!(config.similarity_threshold, DEFAULT_SIMILARITY_THRESHOLD);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        assert!(Config::from_toml("threshold = 0.5").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml("similarity_threshold = 0.6").unwrap();
        config.apply_env(env(&[
            ("ROLLCALL_SIMILARITY_THRESHOLD", "0.55"),
            ("ROLLCALL_CLAHE", "1"),
            ("ROLLCALL_MODEL_DIR", "/m"),
        ]));
        assert_eq!(config.similarity_threshold, 0.55);
        assert!(config.clahe);
        assert_eq!(config.model_dir, PathBuf::from("/m"));
    }

    #[test]
    fn test_unparsable_env_is_ignored() {
        let mut config = Config::default();
        config.apply_env(env(&[("ROLLCALL_SIMILARITY_THRESHOLD", "high")]));
        assert_eq!(config.similarity_threshold, DEFAULT_SIMILARITY_THRESHOLD);
    }

    #[test]
    fn test_from_dir_reads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "similarity_threshold = 0.7\n").unwrap();
        let config = Config::from_dir(dir.path()).unwrap();
        assert_eq!(config.data_dir, dir.path());
        assert_eq!(config.similarity_threshold, 0.7);
    }
}
