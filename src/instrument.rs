//! Per-model instrumentation state
//!
//! [`Instrumentation`] is threaded through every forward pass of a backend.
//! Inside each attention layer, after softmax and the value product, the layer
//! hands its attention weights `[b, h, t, s]` and per-head outputs
//! `[b, h, t, d]` to [`Instrumentation::process_heads`], which:
//!
//! 1. records the weights if a recorder is attached at [`RecordSite::AttnWeights`]
//! 2. selects and masks heads if sparsification is enabled for the layer
//! 3. records the (possibly masked) outputs at [`RecordSite::HeadOutput`]
//!
//! and returns the tensor the layer merges and projects. Recorders only
//! observe; they never alter the data path.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::recorder::{Phase, Recorded, RetentionPolicy, TensorRecorder};
use crate::sparsity::{apply_head_mask, SparsityConfig};

/// Tensor stream inside an attention layer that a recorder can watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSite {
    /// Post-softmax attention weights `[batch, heads, target, source]`
    AttnWeights,
    /// Per-head attention output after masking `[batch, heads, target, head_dim]`
    HeadOutput,
}

impl fmt::Display for RecordSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttnWeights => f.write_str("attn_weights"),
            Self::HeadOutput => f.write_str("head_output"),
        }
    }
}

/// Sparsification settings and attached recorders of one model
#[derive(Debug, Default)]
pub struct Instrumentation {
    sparsity: Option<SparsityConfig>,
    recorders: BTreeMap<(usize, RecordSite), TensorRecorder>,
}

impl Instrumentation {
    /// No sparsification, no recorders
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn on head sparsification
    pub fn enable_head_sparsification(&mut self, config: SparsityConfig) {
        info!(
            "Head sparsification enabled: k={}, metric={}, prefill={}",
            config.k, config.metric, config.allow_during_prefill
        );
        self.sparsity = Some(config);
    }

    /// Turn off head sparsification
    pub fn disable_head_sparsification(&mut self) {
        if self.sparsity.take().is_some() {
            info!("Head sparsification disabled");
        }
    }

    /// Current sparsification settings
    pub fn sparsity(&self) -> Option<&SparsityConfig> {
        self.sparsity.as_ref()
    }

    /// Attach a recorder, replacing (and returning) any previous one
    pub fn attach_recorder(
        &mut self,
        layer: usize,
        site: RecordSite,
        policy: RetentionPolicy,
    ) -> Option<TensorRecorder> {
        let name = format!("layers.{layer}.{site}");
        debug!("attaching recorder {name} ({policy})");
        self.recorders.insert((layer, site), TensorRecorder::new(name, policy))
    }

    /// Remove a recorder together with anything it still holds
    pub fn detach_recorder(&mut self, layer: usize, site: RecordSite) -> Option<TensorRecorder> {
        self.recorders.remove(&(layer, site))
    }

    /// Borrow an attached recorder
    pub fn recorder(&self, layer: usize, site: RecordSite) -> Option<&TensorRecorder> {
        self.recorders.get(&(layer, site))
    }

    /// Read and clear one phase of an attached recorder
    ///
    /// Returns `None` if no recorder is attached there or its buffer is empty.
    pub fn read_and_clear(
        &mut self,
        layer: usize,
        site: RecordSite,
        phase: Phase,
    ) -> Result<Option<Recorded>> {
        match self.recorders.get_mut(&(layer, site)) {
            Some(recorder) => recorder.read_and_clear(phase),
            None => Ok(None),
        }
    }

    /// Run recording and head masking for one attention layer
    pub fn process_heads(
        &mut self,
        layer: usize,
        attn_weights: &Tensor,
        attn_output: &Tensor,
    ) -> Result<Tensor> {
        if let Some(recorder) = self.recorders.get_mut(&(layer, RecordSite::AttnWeights)) {
            recorder.observe(attn_weights)?;
        }

        let output = match &self.sparsity {
            Some(config) if config.applies_to_layer(layer) => {
                let selection = config.select(attn_weights)?;
                apply_head_mask(attn_output, &selection)?
            }
            _ => attn_output.clone(),
        };

        if let Some(recorder) = self.recorders.get_mut(&(layer, RecordSite::HeadOutput)) {
            recorder.observe(&output)?;
        }

        Ok(output)
    }

    /// Drain one phase of every recorder into a safetensors file
    ///
    /// Keys are `layers.{layer}.{site}.{index}`. Nothing is written when no
    /// recorder holds data. Returns the number of tensors written.
    pub fn save_recordings(&mut self, phase: Phase, path: impl AsRef<Path>) -> Result<usize> {
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for recorder in self.recorders.values_mut() {
            if recorder.is_empty(phase) {
                continue;
            }
            let name = recorder.name().to_string();
            if let Some(recorded) = recorder.read_and_clear(phase)? {
                for (i, tensor) in recorded.into_tensors().into_iter().enumerate() {
                    tensors.insert(format!("{name}.{i}"), tensor);
                }
            }
        }

        if tensors.is_empty() {
            debug!("no {phase} recordings to save");
            return Ok(0);
        }

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        candle_core::safetensors::save(&tensors, path)?;
        debug!("saved {} {phase} tensors to {}", tensors.len(), path.display());
        Ok(tensors.len())
    }
}
