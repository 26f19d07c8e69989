// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // ShipModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::trivially_copy_pass_by_ref)] // &usize for API consistency
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::unnecessary_wraps)] // Result for future error handling
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! ship-rs: Sparse Head Inference Probing
//!
//! Per-token top-k attention head sparsification and tensor recording for
//! decoder-only transformers, with a Needle-In-A-Haystack benchmark driver.
//!
//! ## Architecture
//!
//! - `sparsity`: Head selection (L2 / entropy scores) and head masking
//! - `recorder`: Dual-buffer (prefill / decode) tensor recorder
//! - `instrument`: Per-model sparsification config and recorders, applied
//!   inside every attention layer
//! - `error`: Typed errors of the instrumentation core
//! - `decoder`: Instrumented decoder stack shared by the backends
//! - `forward_llama`, `forward_qwen2`: LLaMA and Qwen2 backends
//! - `kv_cache`: KV-cache for prefill + decode generation
//! - `masks`: Cached causal attention masks
//! - `model`: High-level ShipModel wrapper (tokenizer, generation, KL)
//! - `niah`: Needle-In-A-Haystack prompt / pred / eval / vis stages

pub mod decoder;
pub mod error;
pub mod forward_llama;
pub mod forward_qwen2;
pub mod instrument;
pub mod kv_cache;
pub mod masks;
pub mod model;
pub mod niah;
pub mod recorder;
pub mod sparsity;

pub use decoder::{Decoder, DecoderConfig};
pub use error::SparsityError;
pub use forward_llama::{LlamaConfig, ShipLlama};
pub use forward_qwen2::{Qwen2Config, ShipQwen2};
pub use instrument::{Instrumentation, RecordSite};
pub use kv_cache::KvCache;
pub use masks::{causal_mask, clear_mask_cache};
pub use model::{
    kl_divergence, load_tokenizer, sample_from_logits, GenerationResult, ModelArchitecture,
    ShipBackend, ShipModel,
};
pub use niah::{NiahConfig, NiahResults, Stage};
pub use recorder::{Phase, Recorded, RetentionPolicy, TensorRecorder};
pub use sparsity::{
    apply_head_mask, head_scores, select_top_k_heads, HeadMetric, HeadSelection, LayerSpec,
    SparsityConfig, TopKHeads,
};
