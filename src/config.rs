use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::external::LLMConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Upper bound on whitespace-delimited words per chunk
    pub max_tokens: usize,
    pub overlap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub max_concurrent_requests: usize,
    /// Extra attempts for a chunk whose merge hit a store failure
    pub merge_retries: usize,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub graph_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub llm: LLMConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub processing: ProcessingConfig,
    pub output: OutputConfig,
}

fn var_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LLMConfig::default(),
            chunking: ChunkingConfig {
                max_tokens: 300,
                overlap: 45,
            },
            retrieval: RetrievalConfig { top_k: 5 },
            processing: ProcessingConfig {
                max_concurrent_requests: 4,
                merge_retries: 3,
                log_level: "info".to_string(),
            },
            output: OutputConfig {
                graph_path: PathBuf::from("./output/graph.json"),
            },
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let llm = LLMConfig {
            model: env::var("OLLAMA_LLM_MODEL").unwrap_or(defaults.llm.model),
            host: env::var("OLLAMA_HOST").unwrap_or(defaults.llm.host),
            port: var_or("OLLAMA_PORT", defaults.llm.port),
            temperature: var_or("OLLAMA_TEMPERATURE", defaults.llm.temperature),
            top_p: var_or("OLLAMA_TOP_P", defaults.llm.top_p),
            timeout_secs: var_or("LLM_TIMEOUT_SECS", defaults.llm.timeout_secs),
        };

        let chunking = ChunkingConfig {
            max_tokens: var_or("CHUNK_MAX_TOKENS", defaults.chunking.max_tokens),
            overlap: var_or("CHUNK_OVERLAP", defaults.chunking.overlap),
        };

        let retrieval = RetrievalConfig {
            top_k: var_or("RETRIEVAL_TOP_K", defaults.retrieval.top_k),
        };

        let processing = ProcessingConfig {
            max_concurrent_requests: var_or(
                "MAX_CONCURRENT_REQUESTS",
                defaults.processing.max_concurrent_requests,
            ),
            merge_retries: var_or("MERGE_RETRIES", defaults.processing.merge_retries),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.processing.log_level),
        };

        let output = OutputConfig {
            graph_path: env::var("GRAPH_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.output.graph_path),
        };

        let config = Self {
            llm,
            chunking,
            retrieval,
            processing,
            output,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            bail!("CHUNK_MAX_TOKENS must be positive");
        }
        if self.chunking.overlap >= self.chunking.max_tokens {
            bail!(
                "CHUNK_OVERLAP ({}) must be smaller than CHUNK_MAX_TOKENS ({})",
                self.chunking.overlap,
                self.chunking.max_tokens
            );
        }
        if self.retrieval.top_k == 0 {
            bail!("RETRIEVAL_TOP_K must be positive");
        }
        if self.processing.max_concurrent_requests == 0 {
            bail!("MAX_CONCURRENT_REQUESTS must be positive");
        }
        self.llm.get_url()?;
        Ok(())
    }
}
