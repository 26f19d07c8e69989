//! Causal attention masks
//!
//! Additive masks of shape `[1, 1, new_len, offset + new_len]`: `0.0` where
//! a query may attend, `-inf` elsewhere. Query `i` (absolute position
//! `offset + i`) sees every cached position and the new positions up to itself.
//!
//! The most recent multi-token mask is cached by `(new_len, offset, device,
//! dtype)`: every layer of a prefill pass asks for the same mask. Only one mask
//! is kept, so a sweep over many prompt lengths holds one mask at a time.
//! Decode masks (`new_len == 1`) are all zeros and built on the fly.

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MaskKey {
    new_len: usize,
    offset: usize,
    device: DeviceKind,
    dtype: DType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DeviceKind {
    Cpu,
    Cuda,
    Metal,
}

impl From<&Device> for DeviceKind {
    fn from(device: &Device) -> Self {
        match device {
            Device::Cpu => Self::Cpu,
            Device::Cuda(_) => Self::Cuda,
            Device::Metal(_) => Self::Metal,
        }
    }
}

static MASK_CACHE: Mutex<Option<(MaskKey, Tensor)>> = Mutex::new(None);

fn mask_cache() -> MutexGuard<'static, Option<(MaskKey, Tensor)>> {
    MASK_CACHE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Causal mask for `new_len` queries following `offset` cached positions
pub fn causal_mask(new_len: usize, offset: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let total = offset + new_len;
    if new_len == 1 {
        return Ok(Tensor::zeros((1, 1, 1, total), dtype, device)?);
    }

    let key = MaskKey {
        new_len,
        offset,
        device: DeviceKind::from(device),
        dtype,
    };
    if let Some((cached_key, mask)) = mask_cache().as_ref() {
        if *cached_key == key {
            return Ok(mask.clone());
        }
    }

    let data: Vec<f32> = (0..new_len)
        .flat_map(|i| {
            (0..total).map(move |j| {
                if j <= offset + i {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();
    let mask = Tensor::from_vec(data, (1, 1, new_len, total), device)?.to_dtype(dtype)?;
    *mask_cache() = Some((key, mask.clone()));
    Ok(mask)
}

/// Drop the cached mask
pub fn clear_mask_cache() {
    *mask_cache() = None;
}

/// Number of cached masks (0 or 1)
pub fn mask_cache_size() -> usize {
    usize::from(mask_cache().is_some())
}

/// Bytes held by the cached mask
pub fn mask_cache_bytes() -> usize {
    mask_cache()
        .as_ref()
        .map_or(0, |(_, mask)| mask.elem_count() * mask.dtype().size_in_bytes())
}
