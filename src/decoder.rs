//! Instrumented decoder-only transformer
//!
//! Shared by the LLaMA and Qwen2 backends, which differ only in Q/K/V bias
//! and in whether the output head is tied to the token embeddings.
//!
//! Each block is pre-norm: RMSNorm → attention (RoPE, grouped-query KV,
//! KV-cache) → residual → RMSNorm → SwiGLU MLP → residual. Inside attention
//! the post-softmax weights `[b, h, t, s]` and per-head outputs `[b, h, t, d]`
//! go through [`Instrumentation::process_heads`] before the heads are merged
//! and projected by `o_proj`.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear_b, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::info;

use crate::instrument::Instrumentation;
use crate::kv_cache::KvCache;
use crate::masks::causal_mask;

/// Architecture hyperparameters in a family-independent form
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    pub rope_theta: f64,
    pub rms_norm_eps: f64,
    pub max_position_embeddings: usize,
    /// Bias on the Q/K/V projections (Qwen2)
    pub qkv_bias: bool,
    /// Output head shares the embedding matrix
    pub tie_word_embeddings: bool,
}

impl DecoderConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.num_key_value_heads == 0 {
            bail!("attention head counts must be positive");
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            bail!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size,
                self.num_attention_heads
            );
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            bail!(
                "num_attention_heads {} is not a multiple of num_key_value_heads {}",
                self.num_attention_heads,
                self.num_key_value_heads
            );
        }
        Ok(())
    }
}

struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    fn new(config: &DecoderConfig, device: &Device, dtype: DType) -> Result<Self> {
        let head_dim = config.head_dim();
        let max_len = config.max_position_embeddings;
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / config.rope_theta.powf(i as f64 / head_dim as f64) as f32)
            .collect();
        let n_freq = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, n_freq), device)?;
        let positions = Tensor::arange(0u32, max_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_len, 1))?;
        // Angles in f32, tables in the model dtype
        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor, start_pos: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.narrow(0, start_pos, seq_len)?;
        let sin = self.sin.narrow(0, start_pos, seq_len)?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

/// Expand `[b, kv_heads, s, d]` to `[b, kv_heads * n_rep, s, d]`
fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, n_kv, seq_len, head_dim) = x.dims4()?;
    Ok(x.unsqueeze(2)?
        .expand((b, n_kv, n_rep, seq_len, head_dim))?
        .reshape((b, n_kv * n_rep, seq_len, head_dim))?)
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &DecoderConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        let q_dim = config.num_attention_heads * head_dim;
        let kv_dim = config.num_key_value_heads * head_dim;
        Ok(Self {
            q_proj: linear_b(hidden, q_dim, config.qkv_bias, vb.pp("q_proj"))?,
            k_proj: linear_b(hidden, kv_dim, config.qkv_bias, vb.pp("k_proj"))?,
            v_proj: linear_b(hidden, kv_dim, config.qkv_bias, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(q_dim, hidden, vb.pp("o_proj"))?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        start_pos: usize,
        layer: usize,
        kv_cache: &mut KvCache,
        instr: &mut Instrumentation,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = rotary.apply(&q, &k, start_pos)?;
        let (k, v) = kv_cache.append(layer, &k, &v)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let mask = causal_mask(seq_len, start_pos, x.device(), scores.dtype())?;
        let weights = candle_nn::ops::softmax_last_dim(&scores.broadcast_add(&mask)?)?;

        // [b, h, t, d]
        let heads = weights.matmul(&v)?;
        let heads = instr.process_heads(layer, &weights, &heads)?;

        let merged = heads.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&merged)?)
    }
}

/// SwiGLU feed-forward block
struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &DecoderConfig) -> Result<Self> {
        let (hidden, inter) = (config.hidden_size, config.intermediate_size);
        Ok(Self {
            gate_proj: linear_no_bias(hidden, inter, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden, inter, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(inter, hidden, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &DecoderConfig) -> Result<Self> {
        let (hidden, eps) = (config.hidden_size, config.rms_norm_eps);
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config)?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
            input_layernorm: candle_nn::rms_norm(hidden, eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: candle_nn::rms_norm(
                hidden,
                eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        start_pos: usize,
        layer: usize,
        kv_cache: &mut KvCache,
        instr: &mut Instrumentation,
    ) -> Result<Tensor> {
        let residual = x;
        let h = self.input_layernorm.forward(x)?;
        let h = self
            .self_attn
            .forward(&h, rotary, start_pos, layer, kv_cache, instr)?;
        let x = (residual + h)?;

        let h = self.post_attention_layernorm.forward(&x)?;
        let h = self.mlp.forward(&h)?;
        Ok((x + h)?)
    }
}

/// Decoder stack with embeddings, final norm and output head
pub struct Decoder {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    /// `None` when tied: logits = hidden @ embed_tokens^T
    lm_head: Option<Linear>,
    rotary: RotaryEmbedding,
    config: DecoderConfig,
}

impl Decoder {
    /// Build from a HuggingFace-layout `VarBuilder` (`model.*`, `lm_head`)
    pub fn new(
        config: DecoderConfig,
        vb: VarBuilder,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let n_layers = config.num_hidden_layers;
        let mut layers = Vec::with_capacity(n_layers);
        for i in 0..n_layers {
            if i == 0 || (i + 1) % 10 == 0 {
                info!("Loading layer {}/{}", i + 1, n_layers);
            }
            layers.push(DecoderLayer::load(
                vb_model.pp(format!("layers.{i}")),
                &config,
            )?);
        }

        let norm = candle_nn::rms_norm(
            config.hidden_size,
            config.rms_norm_eps,
            vb_model.pp("norm"),
        )?;
        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("lm_head"),
            )?)
        };
        let rotary = RotaryEmbedding::new(&config, device, dtype)?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            config,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Run new tokens through the stack, extending `kv_cache`
    ///
    /// `input_ids` is `[batch, new_len]`. Returns last-position logits
    /// `[batch, vocab]`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        kv_cache: &mut KvCache,
        instr: &mut Instrumentation,
    ) -> Result<Tensor> {
        if kv_cache.n_layers() != self.layers.len() {
            bail!(
                "KV cache has {} layers, model has {}",
                kv_cache.n_layers(),
                self.layers.len()
            );
        }
        let (_b, new_len) = input_ids.dims2()?;
        if new_len == 0 {
            bail!("input_ids is empty");
        }
        let start_pos = kv_cache.seq_len();
        if start_pos + new_len > self.config.max_position_embeddings {
            bail!(
                "sequence of {} positions exceeds max_position_embeddings {}",
                start_pos + new_len,
                self.config.max_position_embeddings
            );
        }

        let mut hidden = self.embed_tokens.forward(input_ids)?;
        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer
                .forward(&hidden, &self.rotary, start_pos, i, kv_cache, instr)
                .with_context(|| format!("layer {i}"))?;
        }

        let hidden = self.norm.forward(&hidden)?;
        let last = hidden.narrow(1, new_len - 1, 1)?.squeeze(1)?;
        match &self.lm_head {
            Some(head) => Ok(head.forward(&last)?),
            None => Ok(last.matmul(&self.embed_tokens.embeddings().t()?)?),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// Open a model repository on the HuggingFace hub
pub(crate) fn hub_repo(model_id: &str) -> Result<ApiRepo> {
    let api = Api::new()?;
    Ok(api.repo(Repo::new(model_id.to_string(), RepoType::Model)))
}

/// Download and parse `config.json`
pub(crate) fn fetch_config<T: DeserializeOwned>(repo: &ApiRepo) -> Result<T> {
    let path = repo
        .get("config.json")
        .context("Failed to download config.json")?;
    let text = std::fs::read_to_string(&path).context("Failed to read config.json")?;
    serde_json::from_str(&text).context("Failed to parse config.json")
}

/// Download the safetensors weights, sharded or single-file
pub(crate) fn fetch_weights(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    let Ok(index_path) = repo.get("model.safetensors.index.json") else {
        let path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;
        return Ok(vec![path]);
    };

    let text = std::fs::read_to_string(&index_path).context("Failed to read index")?;
    let index: SafetensorsIndex = serde_json::from_str(&text)?;
    let mut shards: Vec<String> = index.weight_map.into_values().collect();
    shards.sort();
    shards.dedup();

    info!("Downloading {} shard files...", shards.len());
    shards
        .iter()
        .map(|name| {
            repo.get(name)
                .with_context(|| format!("Failed to download {name}"))
        })
        .collect()
}

/// Memory-map downloaded weights into a `VarBuilder`
pub(crate) fn mmap_weights(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    info!("Loading weights from {} file(s)...", paths.len());
    // SAFETY: the files are hub cache entries that are not modified while mapped.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}
