//! LLaMA backend
//!
//! No bias on any projection. The output head is separate unless the
//! checkpoint sets `tie_word_embeddings` (Llama 3.2 1B/3B do).

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use serde::Deserialize;
use tracing::info;

use crate::decoder::{fetch_config, fetch_weights, hub_repo, mmap_weights, Decoder, DecoderConfig};
use crate::instrument::Instrumentation;
use crate::kv_cache::KvCache;
use crate::model::ShipBackend;

/// Subset of a LLaMA `config.json`
#[derive(Debug, Clone, Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    /// Absent in older checkpoints, meaning plain multi-head attention
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub attention_bias: bool,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl From<&LlamaConfig> for DecoderConfig {
    fn from(c: &LlamaConfig) -> Self {
        Self {
            hidden_size: c.hidden_size,
            intermediate_size: c.intermediate_size,
            num_attention_heads: c.num_attention_heads,
            num_key_value_heads: c.num_key_value_heads.unwrap_or(c.num_attention_heads),
            num_hidden_layers: c.num_hidden_layers,
            vocab_size: c.vocab_size,
            rope_theta: c.rope_theta,
            rms_norm_eps: c.rms_norm_eps,
            max_position_embeddings: c.max_position_embeddings,
            qkv_bias: c.attention_bias,
            tie_word_embeddings: c.tie_word_embeddings,
        }
    }
}

/// Instrumented LLaMA decoder
pub struct ShipLlama {
    decoder: Decoder,
}

impl ShipLlama {
    /// Load from the HuggingFace hub
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading LLaMA from: {}", model_id);
        let repo = hub_repo(model_id)?;
        let config: LlamaConfig = fetch_config(&repo)?;
        info!(
            "Model config: {} layers, {} heads ({} KV), {} hidden, {} vocab",
            config.num_hidden_layers,
            config.num_attention_heads,
            config.num_key_value_heads.unwrap_or(config.num_attention_heads),
            config.hidden_size,
            config.vocab_size
        );
        let vb = mmap_weights(&fetch_weights(&repo)?, dtype, device)?;
        Self::from_var_builder(&config, vb, device, dtype)
    }

    /// Build from already loaded weights
    pub fn from_var_builder(
        config: &LlamaConfig,
        vb: VarBuilder,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let decoder = Decoder::new(config.into(), vb, device, dtype)?;
        info!("LLaMA loaded with {} layers", config.num_hidden_layers);
        Ok(Self { decoder })
    }
}

impl ShipBackend for ShipLlama {
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
        let system = system_prompt.map_or_else(String::new, |s| {
            format!("<|start_header_id|>system<|end_header_id|>\n\n{s}<|eot_id|>")
        });
        Some(format!(
            "<|begin_of_text|>{system}<|start_header_id|>user<|end_header_id|>\n\n{prompt}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use serial_test::serial;

    const CONFIG_JSON: &str = r#"{
        "architectures": ["LlamaForCausalLM"],
        "hidden_size": 16,
        "intermediate_size": 32,
        "num_attention_heads": 4,
        "num_hidden_layers": 2,
        "vocab_size": 32,
        "max_position_embeddings": 64
    }"#;

    #[test]
    fn test_config_defaults() {
        let config: LlamaConfig = serde_json::from_str(CONFIG_JSON).unwrap();
        let decoder_config = DecoderConfig::from(&config);
        assert_eq!(decoder_config.num_key_value_heads, 4);
        assert_eq!(decoder_config.rope_theta, 10_000.0);
        assert!(!decoder_config.qkv_bias);
        assert!(!decoder_config.tie_word_embeddings);
    }

    #[test]
    #[serial]
    fn test_backend_metadata_and_forward() {
        let config: LlamaConfig = serde_json::from_str(CONFIG_JSON).unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = ShipLlama::from_var_builder(&config, vb, &Device::Cpu, DType::F32).unwrap();

        assert_eq!(model.n_layers(), 2);
        assert_eq!(model.n_heads(), 4);
        assert_eq!(model.d_model(), 16);
        assert_eq!(model.vocab_size(), 32);

        let ids = Tensor::new(&[1u32, 2, 3], &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap();
        let mut cache = model.new_kv_cache();
        let logits = model
            .forward_with_kv_cache(&ids, &mut cache, &mut Instrumentation::new())
            .unwrap();
        assert_eq!(logits.dims(), &[1, 32]);
    }

    #[test]
    fn test_chat_template() {
        let config: LlamaConfig = serde_json::from_str(CONFIG_JSON).unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = ShipLlama::from_var_builder(&config, vb, &Device::Cpu, DType::F32).unwrap();

        let text = model.chat_template("Where is the needle?", None).unwrap();
        assert!(text.starts_with("<|begin_of_text|><|start_header_id|>user"));
        assert!(text.ends_with("assistant<|end_header_id|>\n\n"));
    }
}
