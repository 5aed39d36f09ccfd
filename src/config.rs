//! YAML configuration for the analyzer.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration. Defaults mirror the tuning the pipeline has been run
//! with in production: batches of 5, 10 concurrent inference calls, a 30 second
//! per-call timeout and a one hour, 1000 entry response cache.
//!
//! # Example
//!
//! ```yaml
//! inference:
//!   api_base: https://api.openai.com/v1
//!   filter_model: gpt-4o
//!   timeout_secs: 30
//! pipeline:
//!   batch_size: 5
//!   max_concurrency: 10
//! cache:
//!   max_entries: 1000
//!   ttl_secs: 3600
//! ```

use crate::cache::MAX_TTL;
use crate::error::{AnalyzerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub inference: InferenceConfig,
    pub pipeline: PipelineConfig,
    pub fetch: FetchConfig,
    pub cache: CacheConfig,
}

/// Settings for the OpenAI-compatible inference endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub api_base: String,
    /// Falls back to the `OPENAI_API_KEY` environment variable when unset.
    pub api_key: Option<String>,
    pub filter_model: String,
    pub summarize_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
    /// Send several articles in one prompt. When false every article is its
    /// own batch.
    pub multi_item: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            filter_model: "gpt-4o".to_string(),
            summarize_model: "gpt-4o-mini".to_string(),
            max_tokens: 512,
            temperature: 0.0,
            timeout_secs: 30,
            multi_item: true,
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The configured key, or `OPENAI_API_KEY` from the environment.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }
}

/// Batching, retry, and truncation settings for the filter and summarize phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Characters of article body included in a filter prompt.
    pub filter_char_budget: usize,
    /// Characters of article body included in a summarize prompt.
    pub summary_char_budget: usize,
    /// Length of the fallback excerpt used when summarization fails.
    pub excerpt_chars: usize,
    /// Relevant articles with shorter bodies are not summarized.
    pub min_content_chars: usize,
    /// Cap on how many relevant articles are passed to the summarizer.
    pub max_relevant_articles: Option<usize>,
    /// Reject obvious sports/entertainment content before inference.
    pub prefilter: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_concurrency: 10,
            max_retries: 2,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            filter_char_budget: 800,
            summary_char_budget: 2000,
            excerpt_chars: 280,
            min_content_chars: 0,
            max_relevant_articles: None,
            prefilter: false,
        }
    }
}

/// Settings for the source fetch phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Number of fetch workers.
    pub concurrency: usize,
    /// Capacity of the fetch job queue.
    pub queue_capacity: usize,
    pub timeout_secs: u64,
    pub max_articles_per_source: usize,
    pub max_age_days: i64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            queue_capacity: 64,
            timeout_secs: 15,
            max_articles_per_source: 20,
            max_age_days: 7,
            user_agent: concat!(
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 ",
                "(KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
            )
            .to_string(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: u64,
    pub ttl_secs: u64,
    /// Load the cache from / save it to this file across runs.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl_secs: 3600,
            snapshot_path: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl AnalyzerConfig {
    /// Parse a configuration from YAML text and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AnalyzerConfig = if yaml.trim().is_empty() {
            AnalyzerConfig::default()
        } else {
            serde_yaml::from_str(yaml).map_err(|e| AnalyzerError::Config(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_yaml(&yaml)?;
        info!("Loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.batch_size == 0 {
            return Err(AnalyzerError::Config("pipeline.batch_size must be > 0".into()));
        }
        if p.max_concurrency == 0 {
            return Err(AnalyzerError::Config(
                "pipeline.max_concurrency must be > 0".into(),
            ));
        }
        if self.fetch.concurrency == 0 {
            return Err(AnalyzerError::Config("fetch.concurrency must be > 0".into()));
        }
        if self.fetch.queue_capacity == 0 {
            return Err(AnalyzerError::Config(
                "fetch.queue_capacity must be > 0".into(),
            ));
        }
        if self.inference.timeout_secs == 0 {
            return Err(AnalyzerError::Config(
                "inference.timeout_secs must be > 0".into(),
            ));
        }
        if self.cache.ttl() > MAX_TTL {
            return Err(AnalyzerError::Config(format!(
                "cache.ttl_secs must be at most {}",
                MAX_TTL.as_secs()
            )));
        }
        Ok(())
    }
}
