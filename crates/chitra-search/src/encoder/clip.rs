//! CLIP text tower over ONNX Runtime.
//!
//! Expects the HF-style text encoder export (`input_ids` + `attention_mask`
//! in, projected `text_embeds` out) plus a `tokenizer.json` next to it.

use anyhow::{anyhow, Result};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::Tokenizer;

use super::TextEncoder;
use crate::config::SearchConfig;

/// CLIP text context length (tokens per query, padded/truncated).
const CONTEXT_LENGTH: usize = 77;

#[derive(Clone)]
pub struct ClipConfig {
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    /// Fallback tokenizer used when the named one fails to load.
    pub default_tokenizer_path: PathBuf,
    pub max_length: usize,
}

impl ClipConfig {
    /// Resolve on-disk paths for the configured model/pretrained/tokenizer
    /// identifiers. The text tower lives under
    /// `<model_dir>/<model>-<pretrained>/` (falling back to
    /// `<model_dir>/<model>/`), as `textual.onnx` or `model.onnx`.
    pub fn resolve(config: &SearchConfig) -> Result<Self> {
        let tagged = config
            .model_dir
            .join(format!("{}-{}", config.model, config.pretrained));
        let base_path = if tagged.exists() {
            tagged
        } else {
            config.model_dir.join(&config.model)
        };

        let model_path = ["textual.onnx", "model.onnx"]
            .iter()
            .map(|f| base_path.join(f))
            .find(|p| p.exists())
            .ok_or_else(|| {
                anyhow!(
                    "no text encoder found under {} (expected textual.onnx or model.onnx)",
                    base_path.display()
                )
            })?;

        let default_tokenizer_path = base_path.join("tokenizer.json");
        let tokenizer_path = match &config.tokenizer {
            Some(name) => config.model_dir.join(name).join("tokenizer.json"),
            None => default_tokenizer_path.clone(),
        };

        Ok(Self {
            model_path,
            tokenizer_path,
            default_tokenizer_path,
            max_length: CONTEXT_LENGTH,
        })
    }
}

pub struct ClipTextEncoder {
    session: Arc<Mutex<Session>>,
    tokenizer: Arc<Tokenizer>,
    dimension: usize,
    max_length: usize,
    cache: Arc<RwLock<lru::LruCache<u64, Vec<f32>>>>,
}

impl ClipTextEncoder {
    pub fn load(config: &SearchConfig) -> Result<Self> {
        let clip = ClipConfig::resolve(config)?;
        Self::new(clip)
    }

    pub fn new(config: ClipConfig) -> Result<Self> {
        ort::init().with_name("clip_text_encoder").commit();

        if !config.model_path.exists() {
            return Err(anyhow!(
                "model file not found at: {}",
                config.model_path.display()
            ));
        }

        let model_bytes = std::fs::read(&config.model_path)
            .map_err(|e| anyhow!("failed to read model: {:?}", e))?;

        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let session = Session::builder()
            .map_err(|e| anyhow!("session builder: {:?}", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("optimization level: {:?}", e))?
            .with_intra_threads(num_threads)
            .map_err(|e| anyhow!("intra threads: {:?}", e))?
            .with_inter_threads(1)
            .map_err(|e| anyhow!("inter threads: {:?}", e))?
            .with_memory_pattern(true)
            .map_err(|e| anyhow!("memory pattern: {:?}", e))?
            .commit_from_memory(&model_bytes)
            .map_err(|e| anyhow!("failed to load model: {:?}", e))?;

        let tokenizer = load_tokenizer(&config.tokenizer_path, &config.default_tokenizer_path)?;

        let mut encoder = Self {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
            dimension: 0,
            max_length: config.max_length,
            cache: Arc::new(RwLock::new(lru::LruCache::new(
                std::num::NonZeroUsize::new(1000).unwrap(),
            ))),
        };

        // Probe once so the output dimension is known (and a broken export
        // fails at initialization instead of on the first query).
        let probe = encoder.encode_uncached("a photo")?;
        encoder.dimension = probe.len();
        tracing::info!(
            dimension = encoder.dimension,
            model = %config.model_path.display(),
            "text encoder ready"
        );

        Ok(encoder)
    }

    fn encode_uncached(&self, text: &str) -> Result<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("tokenization failed: {}", e))?;

        let mut token_ids: Vec<u32> = encoding.get_ids().to_vec();
        if token_ids.len() > self.max_length {
            token_ids.truncate(self.max_length);
        }

        let mut ids_vec = Vec::with_capacity(self.max_length);
        let mut mask_vec = Vec::with_capacity(self.max_length);
        for &id in &token_ids {
            ids_vec.push(id as i64);
            mask_vec.push(1i64);
        }
        for _ in token_ids.len()..self.max_length {
            ids_vec.push(0i64);
            mask_vec.push(0i64);
        }

        let shape = vec![1, self.max_length];
        let input_ids = Value::from_array((shape.clone(), ids_vec))
            .map_err(|e| anyhow!("input_ids tensor: {:?}", e))?;
        let attention_mask = Value::from_array((shape, mask_vec))
            .map_err(|e| anyhow!("attention_mask tensor: {:?}", e))?;

        let inputs = ort::inputs![
            "input_ids" => input_ids,
            "attention_mask" => attention_mask,
        ];

        let mut session = self.session.lock();
        let outputs = session
            .run(inputs)
            .map_err(|e| anyhow!("inference failed: {:?}", e))?;

        // Prefer the projected embedding; some exports name it differently
        let output_name = outputs
            .iter()
            .find(|(name, _)| *name == "text_embeds" || *name == "pooler_output")
            .map(|(name, _)| name.to_string())
            .or_else(|| outputs.iter().next().map(|(name, _)| name.to_string()))
            .ok_or_else(|| anyhow!("model produced no outputs"))?;

        let (out_shape, data) = outputs[output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("failed to extract output '{}': {:?}", output_name, e))?;

        if out_shape.len() != 2 {
            return Err(anyhow!(
                "unexpected output shape {:?} from '{}'; export the text tower with its projection head",
                out_shape,
                output_name
            ));
        }

        let dim = out_shape[1] as usize;
        let embedding = normalize(data[..dim].to_vec());
        Ok(embedding)
    }
}

impl TextEncoder for ClipTextEncoder {
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        let cache_key = hasher.finish();

        if let Some(cached) = self.cache.write().get(&cache_key) {
            return Ok(cached.clone());
        }

        let embedding = self.encode_uncached(text)?;
        self.cache.write().put(cache_key, embedding.clone());
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Load the named tokenizer, falling back to the model's own default.
/// The fallback is a variant selection, never silent: the original failure
/// is logged alongside which path was taken.
fn load_tokenizer(named: &Path, default: &Path) -> Result<Tokenizer> {
    match Tokenizer::from_file(named) {
        Ok(tokenizer) => {
            tracing::info!(tokenizer = %named.display(), "tokenizer initialized");
            Ok(tokenizer)
        }
        Err(e) if named != default => {
            tracing::warn!(
                requested = %named.display(),
                fallback = %default.display(),
                error = %e,
                "named tokenizer unavailable, falling back to model default"
            );
            Tokenizer::from_file(default)
                .map_err(|e| anyhow!("fallback tokenizer failed to load: {}", e))
        }
        Err(e) => Err(anyhow!("tokenizer failed to load: {}", e)),
    }
}

fn normalize(mut vec: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}
