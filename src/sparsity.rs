//! Per-token attention head sparsification
//!
//! Two steps run inside every instrumented attention layer:
//!
//! 1. [`select_top_k_heads`] ranks the heads of each `(batch, position)` pair
//!    by an informativeness score computed from the post-softmax attention
//!    weights and keeps the `k` best.
//! 2. [`apply_head_mask`] zeroes the per-head attention output of every head
//!    that was not kept, before the heads are merged by the output projection.
//!
//! ## Metrics
//!
//! Both metrics score each attention row `p` (one head, one target position)
//! over the source dimension. Larger is more informative:
//!
//! - **L2**: `||p||_2`. A uniform row has the smallest norm.
//! - **Entropy**: `sum (p + eps) * log2(p + eps)` with `eps = 1e-12`, i.e. the
//!   negative entropy. Peaked rows score close to 0, uniform rows strongly
//!   negative.
//!
//! ## Ties
//!
//! Heads are ranked with a stable sort on descending score, so equal scores
//! keep ascending head order: the lowest head index wins a tie.
//!
//! ## Prefill
//!
//! Unless prefill sparsification is allowed, any step with more than one
//! target position keeps every head, whatever `k` was requested.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor, D};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SparsityError};

/// Added to every probability before taking the log in the entropy metric
pub const ENTROPY_EPS: f64 = 1e-12;

/// Score used to rank attention heads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadMetric {
    /// 2-norm of the attention row
    #[default]
    L2,
    /// Negative entropy of the attention row
    Entropy,
}

impl fmt::Display for HeadMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L2 => f.write_str("l2"),
            Self::Entropy => f.write_str("entropy"),
        }
    }
}

impl FromStr for HeadMetric {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l2" => Ok(Self::L2),
            "entropy" => Ok(Self::Entropy),
            other => Err(format!("unknown head metric '{other}' (expected l2 or entropy)")),
        }
    }
}

/// Which layers sparsification applies to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LayerSpec {
    /// Every attention layer
    #[default]
    All,
    /// Only the listed layers
    Specific(Vec<usize>),
    /// A range of layers (inclusive)
    Range { start: usize, end: usize },
}

impl LayerSpec {
    /// Check if this layer is targeted
    pub fn applies_to_layer(&self, layer: usize) -> bool {
        match self {
            Self::All => true,
            Self::Specific(layers) => layers.contains(&layer),
            Self::Range { start, end } => layer >= *start && layer <= *end,
        }
    }
}

/// Sparsification settings for a model instance
#[derive(Debug, Clone, PartialEq)]
pub struct SparsityConfig {
    /// Number of heads kept per token
    pub k: usize,
    /// Ranking metric
    pub metric: HeadMetric,
    /// Sparsify multi-token (prefill) steps too
    pub allow_during_prefill: bool,
    /// Targeted layers
    pub layers: LayerSpec,
}

impl SparsityConfig {
    /// Create a config for all layers
    ///
    /// `k` is signed so that values coming from configs and CLIs can be
    /// rejected with the same range error the selector uses. The upper bound
    /// is only known once attention weights arrive, so it is checked there.
    pub fn new(k: i64, metric: HeadMetric, allow_during_prefill: bool) -> Result<Self> {
        let k = usize::try_from(k).map_err(|_| SparsityError::KOutOfRange {
            k,
            num_heads: None,
        })?;
        Ok(Self {
            k,
            metric,
            allow_during_prefill,
            layers: LayerSpec::All,
        })
    }

    /// Restrict to a single layer
    pub fn layer(mut self, layer: usize) -> Self {
        self.layers = LayerSpec::Specific(vec![layer]);
        self
    }

    /// Restrict to several layers
    pub fn layers(mut self, layers: &[usize]) -> Self {
        self.layers = LayerSpec::Specific(layers.to_vec());
        self
    }

    /// Restrict to a layer range (inclusive)
    pub fn layer_range(mut self, start: usize, end: usize) -> Self {
        self.layers = LayerSpec::Range { start, end };
        self
    }

    /// Check if this layer should be sparsified
    pub fn applies_to_layer(&self, layer: usize) -> bool {
        self.layers.applies_to_layer(layer)
    }

    /// Run the selector with these settings
    pub fn select(&self, attn_weights: &Tensor) -> Result<HeadSelection> {
        select_top_k_heads(attn_weights, self.k, self.metric, self.allow_during_prefill)
    }
}

/// Indices of the kept heads for one forward step
///
/// `indices` has shape `[batch, k, target_len]` and dtype `u32`; entry
/// `[b, j, t]` is the head with rank `j` for position `t` of batch item `b`.
/// Lives on the CPU.
#[derive(Debug, Clone)]
pub struct TopKHeads {
    indices: Tensor,
    k: usize,
}

impl TopKHeads {
    /// Wrap an index tensor of shape `[batch, k, target_len]`
    pub fn new(indices: Tensor) -> Result<Self> {
        let (_, k, _) = indices.dims3()?;
        let indices = indices.to_dtype(DType::U32)?;
        Ok(Self { indices, k })
    }

    /// Number of kept heads per token
    pub fn k(&self) -> usize {
        self.k
    }

    /// Index tensor `[batch, k, target_len]`
    pub fn indices(&self) -> &Tensor {
        &self.indices
    }

    /// `(batch, k, target_len)`
    pub fn dims(&self) -> Result<(usize, usize, usize)> {
        Ok(self.indices.dims3()?)
    }

    /// Kept head indices as `[batch][rank][position]`
    pub fn to_vec3(&self) -> Result<Vec<Vec<Vec<u32>>>> {
        Ok(self.indices.to_vec3()?)
    }
}

/// Outcome of head selection for one forward step
#[derive(Debug, Clone)]
pub enum HeadSelection {
    /// `k` was 0: every head output must be zeroed
    SuppressAll,
    /// Keep the listed heads, zero the rest
    Keep(TopKHeads),
}

impl HeadSelection {
    /// Number of kept heads per token
    pub fn k(&self) -> usize {
        match self {
            Self::SuppressAll => 0,
            Self::Keep(top) => top.k(),
        }
    }
}

/// Score every head at every target position
///
/// # Shapes
/// - `attn_weights`: `[batch, heads, target_len, source_len]`
/// - returns: `[batch, heads, target_len]` in f32
pub fn head_scores(attn_weights: &Tensor, metric: HeadMetric) -> Result<Tensor> {
    let weights = attn_weights.to_dtype(DType::F32)?;
    let scores = match metric {
        HeadMetric::L2 => weights.sqr()?.sum(D::Minus1)?.sqrt()?,
        HeadMetric::Entropy => {
            let shifted = weights.affine(1.0, ENTROPY_EPS)?;
            let log2 = shifted.log()?.affine(std::f64::consts::LOG2_E, 0.0)?;
            (shifted * log2)?.sum(D::Minus1)?
        }
    };
    Ok(scores)
}

/// Select the `k` most informative heads for every token
///
/// Returns [`HeadSelection::SuppressAll`] when the effective `k` is 0. When
/// the step is a prefill (`target_len > 1`) and `allow_during_prefill` is
/// false, the effective `k` is the head count, and every head is returned.
///
/// # Shapes
/// - `attn_weights`: `[batch, heads, target_len, source_len]`
/// - returned indices: `[batch, k, target_len]`
pub fn select_top_k_heads(
    attn_weights: &Tensor,
    k: usize,
    metric: HeadMetric,
    allow_during_prefill: bool,
) -> Result<HeadSelection> {
    let (batch, num_heads, target_len, _source_len) = attn_weights.dims4()?;

    let k = if !allow_during_prefill && target_len != 1 {
        num_heads
    } else {
        k
    };
    debug!("head selection: k={k} of {num_heads} heads, target_len={target_len}");

    if k == 0 {
        debug!("k is 0, suppressing all heads");
        return Ok(HeadSelection::SuppressAll);
    }
    if k > num_heads {
        return Err(SparsityError::KOutOfRange {
            k: k as i64,
            num_heads: Some(num_heads),
        });
    }

    let scores: Vec<Vec<Vec<f32>>> = head_scores(attn_weights, metric)?.to_vec3()?;

    let mut flat = vec![0u32; batch * k * target_len];
    for (b, heads) in scores.iter().enumerate() {
        for t in 0..target_len {
            let mut ranked: Vec<(usize, f32)> = heads
                .iter()
                .enumerate()
                .map(|(h, row)| (h, row[t]))
                .collect();
            // Stable: equal scores stay in ascending head order
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
            for (rank, (head, _)) in ranked.into_iter().take(k).enumerate() {
                flat[(b * k + rank) * target_len + t] = head as u32;
            }
        }
    }

    let indices = Tensor::from_vec(flat, (batch, k, target_len), &Device::Cpu)?;
    let top = TopKHeads::new(indices)?;

    let dims = top.dims()?;
    if dims != (batch, k, target_len) {
        return Err(SparsityError::InvariantViolation(format!(
            "selected indices have shape {dims:?}, expected ({batch}, {k}, {target_len})"
        )));
    }

    Ok(HeadSelection::Keep(top))
}

/// Zero the output of every head not kept by `selection`
///
/// - [`HeadSelection::SuppressAll`]: returns zeros of the same shape.
/// - `k` equal to the head count: returns `attn_output` untouched.
/// - otherwise: multiplies by a `[batch, heads, target_len, 1]` keep-mask.
///
/// # Shapes
/// - `attn_output`: `[batch, heads, target_len, head_dim]`
pub fn apply_head_mask(attn_output: &Tensor, selection: &HeadSelection) -> Result<Tensor> {
    let top = match selection {
        HeadSelection::SuppressAll => {
            debug!("no heads selected, zeroing attention output");
            return Ok(attn_output.zeros_like()?);
        }
        HeadSelection::Keep(top) => top,
    };

    let (batch, num_heads, target_len, _head_dim) = attn_output.dims4()?;
    let (sel_batch, k, sel_target_len) = top.dims()?;

    if sel_batch != batch {
        return Err(SparsityError::ShapeMismatch(format!(
            "selection batch size {sel_batch} != attention output batch size {batch}"
        )));
    }
    if sel_target_len != target_len {
        return Err(SparsityError::ShapeMismatch(format!(
            "selection target length {sel_target_len} != attention output length {target_len}"
        )));
    }
    if k > num_heads {
        return Err(SparsityError::ShapeMismatch(format!(
            "selection keeps {k} heads but attention output has {num_heads}"
        )));
    }

    if k == num_heads {
        debug!("all {num_heads} heads kept, output unchanged");
        return Ok(attn_output.clone());
    }

    let mut mask = vec![0f32; batch * num_heads * target_len];
    for (b, ranks) in top.to_vec3()?.iter().enumerate() {
        for positions in ranks {
            for (t, &head) in positions.iter().enumerate() {
                let head = head as usize;
                if head >= num_heads {
                    return Err(SparsityError::ShapeMismatch(format!(
                        "selection references head {head} but attention output has {num_heads}"
                    )));
                }
                mask[(b * num_heads + head) * target_len + t] = 1.0;
            }
        }
    }

    let mask = Tensor::from_vec(mask, (batch, num_heads, target_len, 1), attn_output.device())?
        .to_dtype(attn_output.dtype())?;
    debug!("masked attention output to {k} of {num_heads} heads");
    Ok(attn_output.broadcast_mul(&mask)?)
}
