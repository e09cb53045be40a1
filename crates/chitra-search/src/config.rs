use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::snapshot::{EMBEDDINGS_FILE, FILENAMES_FILE};

/// Numeric precision of the device-resident scoring matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// float16 on CUDA devices, float32 everywhere else
    Auto,
    Float32,
    Float16,
}

impl Precision {
    /// Whether this mode asks for half precision on the given device.
    /// Half precision is a CUDA fast path; the CPU backend scores in f32.
    pub fn wants_f16(self, device: &str) -> bool {
        match self {
            Precision::Float32 => false,
            Precision::Float16 => true,
            Precision::Auto => device == "cuda",
        }
    }
}

impl std::str::FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Precision::Auto),
            "float32" => Ok(Precision::Float32),
            "float16" => Ok(Precision::Float16),
            other => Err(format!("unknown precision mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Directory holding the embeddings snapshot written by the offline job.
    pub embeddings_dir: PathBuf,
    /// Directory holding the exported text tower and tokenizer files.
    pub model_dir: PathBuf,
    pub model: String,
    pub pretrained: String,
    /// Tokenizer identifier; defaults to the model identifier when unset.
    pub tokenizer: Option<String>,
    pub device: String,
    pub precision: Precision,
    /// L2-normalize stored embeddings at load so dot product equals cosine.
    pub normalize_embeddings: bool,
    pub default_top_k: usize,
    pub min_query_len: usize,
    pub max_query_len: usize,
}

impl SearchConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if !self.embeddings_dir.exists() {
            return Err(format!(
                "embeddings directory not found: {}",
                self.embeddings_dir.display()
            ));
        }
        let embeddings_file = self.embeddings_dir.join(EMBEDDINGS_FILE);
        if !embeddings_file.exists() {
            return Err(format!(
                "embeddings file not found: {}",
                embeddings_file.display()
            ));
        }
        let filenames_file = self.embeddings_dir.join(FILENAMES_FILE);
        if !filenames_file.exists() {
            return Err(format!(
                "filenames file not found: {}",
                filenames_file.display()
            ));
        }
        if self.default_top_k == 0 {
            return Err("default_top_k must be > 0".into());
        }
        if self.min_query_len == 0 {
            return Err("min_query_len must be > 0".into());
        }
        if self.min_query_len > self.max_query_len {
            return Err("min_query_len must be <= max_query_len".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing fields.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chitra-search");

        let embeddings_dir = if let Ok(env_path) = std::env::var("CHITRA_EMBEDDINGS_DIR") {
            PathBuf::from(env_path)
        } else if Path::new("data/embeddings").exists() {
            PathBuf::from("data/embeddings")
        } else {
            data_dir.join("embeddings")
        };

        let model_dir = if let Ok(env_path) = std::env::var("CHITRA_MODEL_DIR") {
            PathBuf::from(env_path)
        } else if Path::new("models").exists() {
            PathBuf::from("models")
        } else {
            data_dir.join("models")
        };

        let precision = std::env::var("CHITRA_DTYPE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Precision::Auto);

        let normalize_embeddings = std::env::var("CHITRA_NORMALIZE")
            .map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(true);

        let default_top_k = std::env::var("CHITRA_TOP_K")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        Self {
            embeddings_dir,
            model_dir,
            model: std::env::var("CHITRA_MODEL").unwrap_or_else(|_| "ViT-B-32".to_string()),
            pretrained: std::env::var("CHITRA_PRETRAINED").unwrap_or_else(|_| "openai".to_string()),
            tokenizer: std::env::var("CHITRA_TOKENIZER").ok(),
            device: std::env::var("CHITRA_DEVICE").unwrap_or_else(|_| "cpu".to_string()),
            precision,
            normalize_embeddings,
            default_top_k,
            min_query_len: 2,
            max_query_len: 512,
        }
    }
}
