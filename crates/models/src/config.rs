use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of input token ids (the tokenizer's id space).
    pub vocab_size: i64,
    /// Width of the recurrent state, per direction.
    pub hidden_size: i64,
    /// Number of stacked recurrent layers.
    pub num_layers: i64,
    /// Dropout applied to encoder outputs during training.
    pub dropout: f64,
    /// Number of classes for sequence classification tasks.
    pub num_labels: i64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30,
            hidden_size: 512,
            num_layers: 3,
            dropout: 0.1,
            num_labels: 1195, // remote homology folds
        }
    }
}

impl ModelConfig {
    /// Reads a JSON or YAML (by extension) model config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read model config at {:?}", path))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let config = if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse model config {:?}", path))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse model config {:?}", path))?
        };
        Ok(config)
    }

    /// Config stored next to pretrained weights, else the given config file,
    /// else defaults.
    pub fn resolve(config_file: Option<&Path>, from_pretrained: Option<&Path>) -> Result<Self> {
        match (from_pretrained, config_file) {
            (Some(dir), _) if dir.join(CONFIG_NAME).exists() => Self::from_file(&dir.join(CONFIG_NAME)),
            (_, Some(file)) => Self::from_file(file),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let config_json = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(CONFIG_NAME), config_json)?;
        Ok(())
    }
}
