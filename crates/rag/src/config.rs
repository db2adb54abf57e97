use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ultradoc_core::{ChunkConfig, HashEmbedderConfig};

use crate::error::{RagError, Result};
use crate::guardrails::GuardrailConfig;

pub const DEFAULT_CONFIG: &str = "ultradoc.toml";
pub const CONFIG_ENV: &str = "ULTRADOC_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Neighbours pulled from the index per question.
    pub top_k: usize,
    /// Leading neighbours used as guardrail evidence and returned as sources.
    pub answer_sources: usize,
    pub max_answer_chars: usize,
    pub source_snippet_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            answer_sources: 3,
            max_answer_chars: 500,
            source_snippet_chars: 200,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    /// Directory holding the persisted index. `None` keeps everything in memory.
    pub store_dir: Option<PathBuf>,
    pub chunk: ChunkConfig,
    pub embedder: HashEmbedderConfig,
    pub retrieval: RetrievalConfig,
    pub guardrails: GuardrailConfig,
}

impl RagConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|err| RagError::Config(err.to_string()))
    }

    /// Reads `path` when it exists; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Config file named by `ULTRADOC_CONFIG` (or `ultradoc.toml`), then env overrides.
    pub fn discover() -> Result<Self> {
        let path = env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
        let mut config = Self::load(Path::new(&path))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(dir) = env::var("ULTRADOC_STORE_DIR") {
            if !dir.trim().is_empty() {
                self.store_dir = Some(PathBuf::from(dir));
            }
        }
        if let Some(top_k) = env_parse("ULTRADOC_TOP_K") {
            self.retrieval.top_k = top_k;
        }
        if let Some(size) = env_parse("ULTRADOC_CHUNK_SIZE") {
            self.chunk.size = size;
        }
        if let Some(overlap) = env_parse("ULTRADOC_CHUNK_OVERLAP") {
            self.chunk.overlap = overlap;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.chunk.validate()?;
        if self.retrieval.top_k == 0 {
            return Err(RagError::Config("retrieval.top_k must be positive".to_string()));
        }
        if self.retrieval.answer_sources == 0 {
            return Err(RagError::Config(
                "retrieval.answer_sources must be positive".to_string(),
            ));
        }
        if !(self.guardrails.max_distance > 0.0) {
            return Err(RagError::Config(
                "guardrails.max_distance must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.guardrails.coverage_min) {
            return Err(RagError::Config(
                "guardrails.coverage_min must lie in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_calibrated_constants() {
        let config = RagConfig::default();
        assert_eq!(config.chunk.size, 500);
        assert_eq!(config.chunk.overlap, 100);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.guardrails.max_distance, 1.5);
        assert_eq!(config.guardrails.coverage_min, 0.2);
        assert_eq!(config.embedder.seed, 1337);
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = RagConfig::from_toml_str(
            r#"
            store_dir = "data/index"

            [chunk]
            size = 300

            [guardrails]
            coverage_min = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.store_dir, Some(PathBuf::from("data/index")));
        assert_eq!(config.chunk.size, 300);
        assert_eq!(config.chunk.overlap, 100);
        assert_eq!(config.guardrails.coverage_min, 0.5);
        assert_eq!(config.guardrails.max_distance, 1.5);
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        let config = RagConfig::from_toml_str("[chunk]\nsize = 50\noverlap = 50\n").unwrap();
        assert!(matches!(config.validate(), Err(RagError::Core(_))));
        assert!(matches!(
            RagConfig::from_toml_str("[chunk]\nsize = \"big\"\n"),
            Err(RagError::Config(_))
        ));
    }

    #[test]
    fn missing_file_means_defaults() {
        let config = RagConfig::load(Path::new("/definitely/not/here/ultradoc.toml")).unwrap();
        assert_eq!(config, RagConfig::default());
    }
}
