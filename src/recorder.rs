//! Tensor recorder with separate prefill and decode buffers
//!
//! A [`TensorRecorder`] watches one tensor stream (for example the attention
//! weights of one layer) during generation. Each observed tensor is classified
//! by its sequence dimension: more than one position is a prefill pass, a
//! single position is a decode step. The two phases fill two independent
//! buffers so that a long prompt never displaces decode captures and the other
//! way round.
//!
//! ## Retention
//!
//! Both buffers follow the recorder's [`RetentionPolicy`]:
//!
//! - `First`: keep the first tensor of the phase, drop the rest
//! - `Last`: keep the most recent tensor of the phase
//! - `All`: keep every tensor in observation order
//!
//! ## Reading
//!
//! [`TensorRecorder::read_and_clear`] hands out deep copies and empties the
//! buffer of the requested phase only. Reading an empty `First`/`Last` buffer
//! logs a warning and returns `None`; an empty `All` buffer reads as an empty
//! sequence.

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Tensor, D};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// What a buffer keeps across repeated observations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Keep only the first tensor
    #[default]
    First,
    /// Keep only the latest tensor
    Last,
    /// Keep every tensor in order
    All,
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => f.write_str("first"),
            Self::Last => f.write_str("last"),
            Self::All => f.write_str("all"),
        }
    }
}

impl FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            "all" => Ok(Self::All),
            other => Err(format!(
                "unknown retention policy '{other}' (expected first, last or all)"
            )),
        }
    }
}

/// Generation phase of a forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Prompt processing (more than one position)
    Prefill,
    /// Single-token generation step
    Decode,
}

impl Phase {
    /// Classify a pass by the length of its sequence dimension
    pub fn from_seq_len(seq_len: usize) -> Self {
        if seq_len > 1 {
            Self::Prefill
        } else {
            Self::Decode
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prefill => f.write_str("prefill"),
            Self::Decode => f.write_str("decode"),
        }
    }
}

/// Contents handed out by [`TensorRecorder::read_and_clear`]
#[derive(Debug, Clone)]
pub enum Recorded {
    /// Single tensor (`First` / `Last` policies)
    Tensor(Tensor),
    /// Ordered tensors (`All` policy), possibly empty
    Sequence(Vec<Tensor>),
}

impl Recorded {
    /// Number of tensors
    pub fn len(&self) -> usize {
        match self {
            Self::Tensor(_) => 1,
            Self::Sequence(tensors) => tensors.len(),
        }
    }

    /// Check if no tensor was recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The single tensor, if this came from a `First` / `Last` buffer
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            Self::Sequence(_) => None,
        }
    }

    /// Flatten into a list of tensors
    pub fn into_tensors(self) -> Vec<Tensor> {
        match self {
            Self::Tensor(t) => vec![t],
            Self::Sequence(tensors) => tensors,
        }
    }
}

#[derive(Debug)]
enum Contents {
    Single(Option<Tensor>),
    Sequence(Vec<Tensor>),
}

/// One phase's buffer, shaped by the retention policy
#[derive(Debug)]
struct PhaseBuffer {
    policy: RetentionPolicy,
    contents: Contents,
}

impl PhaseBuffer {
    fn new(policy: RetentionPolicy) -> Self {
        let contents = match policy {
            RetentionPolicy::First | RetentionPolicy::Last => Contents::Single(None),
            RetentionPolicy::All => Contents::Sequence(Vec::new()),
        };
        Self { policy, contents }
    }

    /// A `First` buffer that already holds a tensor accepts nothing more
    fn accepts(&self) -> bool {
        !matches!(
            (self.policy, &self.contents),
            (RetentionPolicy::First, Contents::Single(Some(_)))
        )
    }

    fn store(&mut self, tensor: Tensor) {
        match &mut self.contents {
            Contents::Single(slot) => *slot = Some(tensor),
            Contents::Sequence(tensors) => tensors.push(tensor),
        }
    }

    fn len(&self) -> usize {
        match &self.contents {
            Contents::Single(slot) => usize::from(slot.is_some()),
            Contents::Sequence(tensors) => tensors.len(),
        }
    }

    fn snapshot(&self) -> Result<Option<Recorded>> {
        let recorded = match &self.contents {
            Contents::Single(None) => None,
            Contents::Single(Some(t)) => Some(Recorded::Tensor(t.copy()?)),
            Contents::Sequence(tensors) => Some(Recorded::Sequence(
                tensors.iter().map(Tensor::copy).collect::<candle_core::Result<_>>()?,
            )),
        };
        Ok(recorded)
    }

    fn clear(&mut self) {
        *self = Self::new(self.policy);
    }
}

/// Detach from the graph and move to host memory with its own storage
fn to_host(tensor: &Tensor) -> Result<Tensor> {
    let detached = tensor.detach();
    let host = if detached.device().is_cpu() {
        detached.copy()?
    } else {
        detached.to_device(&Device::Cpu)?
    };
    Ok(host)
}

/// Records one tensor stream into separate prefill and decode buffers
///
/// Phases are told apart by the second-to-last dimension, which is the target
/// position for attention weights `[batch, heads, target, source]` and
/// per-head outputs `[batch, heads, target, head_dim]`.
#[derive(Debug)]
pub struct TensorRecorder {
    name: String,
    policy: RetentionPolicy,
    prefill: PhaseBuffer,
    decode: PhaseBuffer,
}

impl TensorRecorder {
    /// Create an empty recorder
    pub fn new(name: impl Into<String>, policy: RetentionPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            prefill: PhaseBuffer::new(policy),
            decode: PhaseBuffer::new(policy),
        }
    }

    /// Recorder name (usually the hooked layer)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Retention policy of both buffers
    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    fn buffer(&self, phase: Phase) -> &PhaseBuffer {
        match phase {
            Phase::Prefill => &self.prefill,
            Phase::Decode => &self.decode,
        }
    }

    fn buffer_mut(&mut self, phase: Phase) -> &mut PhaseBuffer {
        match phase {
            Phase::Prefill => &mut self.prefill,
            Phase::Decode => &mut self.decode,
        }
    }

    /// Observe the tensor of one forward pass
    ///
    /// Returns the phase the tensor was classified into. The tensor itself is
    /// not modified.
    pub fn observe(&mut self, tensor: &Tensor) -> Result<Phase> {
        let phase = Phase::from_seq_len(tensor.dim(D::Minus2)?);
        let buffer = match phase {
            Phase::Prefill => &mut self.prefill,
            Phase::Decode => &mut self.decode,
        };

        if buffer.accepts() {
            buffer.store(to_host(tensor)?);
            debug!("{}: recorded {phase} tensor {:?}", self.name, tensor.dims());
        } else {
            debug!("{}: {phase} buffer already full, skipping", self.name);
        }
        Ok(phase)
    }

    /// Copy out and empty the buffer of one phase
    ///
    /// The other phase's buffer is untouched.
    pub fn read_and_clear(&mut self, phase: Phase) -> Result<Option<Recorded>> {
        let buffer = self.buffer_mut(phase);
        let recorded = buffer.snapshot()?;
        buffer.clear();

        if recorded.is_none() {
            warn!("recorder {} has no {phase} data, returning None", self.name);
        }
        Ok(recorded)
    }

    /// Number of tensors held for a phase
    pub fn len(&self, phase: Phase) -> usize {
        self.buffer(phase).len()
    }

    /// Check if a phase's buffer is empty
    pub fn is_empty(&self, phase: Phase) -> bool {
        self.len(phase) == 0
    }
}
