//! Qwen2 / Qwen2.5 backend
//!
//! Bias on the Q/K/V projections, tied embeddings by default, ChatML prompt
//! format.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use serde::Deserialize;
use tracing::info;

use crate::decoder::{fetch_config, fetch_weights, hub_repo, mmap_weights, Decoder, DecoderConfig};
use crate::instrument::Instrumentation;
use crate::kv_cache::KvCache;
use crate::model::ShipBackend;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Subset of a Qwen2 `config.json`
#[derive(Debug, Clone, Deserialize)]
pub struct Qwen2Config {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_tie_word_embeddings")]
    pub tie_word_embeddings: bool,
}

fn default_rope_theta() -> f64 {
    1_000_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_max_position_embeddings() -> usize {
    32768
}

fn default_tie_word_embeddings() -> bool {
    true
}

impl From<&Qwen2Config> for DecoderConfig {
    fn from(c: &Qwen2Config) -> Self {
        Self {
            hidden_size: c.hidden_size,
            intermediate_size: c.intermediate_size,
            num_attention_heads: c.num_attention_heads,
            num_key_value_heads: c.num_key_value_heads,
            num_hidden_layers: c.num_hidden_layers,
            vocab_size: c.vocab_size,
            rope_theta: c.rope_theta,
            rms_norm_eps: c.rms_norm_eps,
            max_position_embeddings: c.max_position_embeddings,
            qkv_bias: true,
            tie_word_embeddings: c.tie_word_embeddings,
        }
    }
}

/// Instrumented Qwen2 decoder
pub struct ShipQwen2 {
    decoder: Decoder,
}

impl ShipQwen2 {
    /// Load from the HuggingFace hub
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading Qwen2 from: {}", model_id);
        let repo = hub_repo(model_id)?;
        let config: Qwen2Config = fetch_config(&repo)?;
        info!(
            "Model config: {} layers, {} heads ({} KV), {} hidden, {} vocab, tied={}",
            config.num_hidden_layers,
            config.num_attention_heads,
            config.num_key_value_heads,
            config.hidden_size,
            config.vocab_size,
            config.tie_word_embeddings
        );
        let vb = mmap_weights(&fetch_weights(&repo)?, dtype, device)?;
        Self::from_var_builder(&config, vb, device, dtype)
    }

    /// Build from already loaded weights
    pub fn from_var_builder(
        config: &Qwen2Config,
        vb: VarBuilder,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let decoder = Decoder::new(config.into(), vb, device, dtype)?;
        info!("Qwen2 loaded with {} layers", config.num_hidden_layers);
        Ok(Self { decoder })
    }
}

impl ShipBackend for ShipQwen2 {
    fn n_layers(&self) -> usize {
        self.decoder.config().num_hidden_layers
    }

    fn n_heads(&self) -> usize {
        self.decoder.config().num_attention_heads
    }

    fn d_model(&self) -> usize {
        self.decoder.config().hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.decoder.config().vocab_size
    }

    fn forward_with_kv_cache(
        &self,
        input_ids: &Tensor,
        kv_cache: &mut KvCache,
        instr: &mut Instrumentation,
    ) -> Result<Tensor> {
        self.decoder.forward(input_ids, kv_cache, instr)
    }

    fn chat_template(&self, prompt: &str, system_prompt: Option<&str>) -> Option<String> {
        let system = system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT);
        Some(format!(
            "<|im_start|>system\n{system}<|im_end|>\n<|im_start|>user\n{prompt}<|im_end|>\n<|im_start|>assistant\n"
        ))
    }
}
