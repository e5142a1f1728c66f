//! Runtime configuration for neural-gauge.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! The context window, batch size and thread count are fixed at load time;
//! changing them requires loading the model again.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::inference::llama_ffi::{ContextParams, ModelParams};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "neural-gauge", about = "Load a GGUF model and stream a greedy completion")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Model file; overrides `model.model_path` from the configuration.
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Prompt text.
    #[arg(short, long)]
    pub prompt: String,

    /// Maximum number of tokens to generate; overrides `generation.max_tokens`.
    #[arg(short = 'n', long)]
    pub max_tokens: Option<usize>,

    /// Print the generation outcome as JSON after streaming.
    #[arg(long)]
    pub json: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Model and execution-context settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Generation defaults.
    #[serde(default)]
    pub generation: GenerationConfig,
}

/// Model-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path to the GGUF model file.
    pub model_path: PathBuf,

    /// Layers offloaded to an accelerator. The core runs on the CPU, so this stays 0.
    pub n_gpu_layers: i32,

    /// Context size in tokens (prompt + generated).
    pub n_ctx: u32,

    /// Maximum tokens per decode call; bounds the prompt length in practice.
    pub n_batch: u32,

    /// Number of compute threads.
    pub n_threads: u32,

    /// Memory-map the model file.
    pub use_mmap: bool,

    /// Lock the model in RAM.
    pub use_mlock: bool,

    /// Prefix prompts with the beginning-of-sequence token.
    pub add_bos: bool,

    /// Let control-token markup in prompts map to control tokens.
    pub parse_special: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model.gguf"),
            n_gpu_layers: 0,
            n_ctx: 2048,
            n_batch: 512,
            n_threads: 4,
            use_mmap: true,
            use_mlock: false,
            add_bos: true,
            parse_special: false,
        }
    }
}

impl ModelConfig {
    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            n_gpu_layers: self.n_gpu_layers,
            use_mmap: self.use_mmap,
            use_mlock: self.use_mlock,
        }
    }

    pub fn context_params(&self) -> ContextParams {
        ContextParams {
            n_ctx: self.n_ctx,
            n_batch: self.n_batch,
            n_threads: self.n_threads,
        }
    }
}

/// Generation defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Default upper bound on generated tokens.
    pub max_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { max_tokens: 128 }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
