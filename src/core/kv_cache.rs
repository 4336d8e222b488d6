//! Slot-indexed KV cache.
//!
//! Every layer keeps one key and one value tensor laid out as
//! `[batch, seq_len, num_kv_heads, head_dim]`. In the decode state `batch` is
//! the slot axis and `seq_len` is the cache capacity; a prefix uses the same
//! layout with `batch = 1` and `seq_len = prompt length`, so a prefix can be
//! copied into a slot with a single slice assignment.
//!
//! ## Column addressing
//!
//! ```text
//!              window_start        write_start
//!                   │                   │
//! slot s:  ....... [ prompt | generated | new ] .......
//!                   └──── attended ─────────┘
//! ```
//!
//! Writes and masks are built from dense per-slot column tensors, never by
//! looping over slots.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Additive bias for masked attention columns.
///
/// Finite so a slot whose window is empty still softmaxes without NaNs.
pub const MASKED_BIAS: f32 = -1e9;

/// Axis of the slot (batch) dimension in a cache tensor.
pub const BATCH_AXIS: usize = 0;
/// Axis of the sequence-position dimension in a cache tensor.
pub const SEQ_AXIS: usize = 1;
/// Axis of the kv-head dimension in a cache tensor.
pub const HEAD_AXIS: usize = 2;

/// Shape description shared by every layer of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSpec {
    /// Number of transformer layers.
    pub num_layers: usize,
    /// Number of KV heads.
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Data type for cache tensors.
    pub dtype: DType,
}

impl CacheSpec {
    /// Create a new cache spec with `f32` storage.
    pub fn new(num_layers: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            num_layers,
            num_kv_heads,
            head_dim,
            dtype: DType::F32,
        }
    }

    /// Set the data type.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Shape of one key (or value) tensor.
    pub fn layer_shape(&self, batch: usize, seq_len: usize) -> (usize, usize, usize, usize) {
        (batch, seq_len, self.num_kv_heads, self.head_dim)
    }

    /// Memory size in bytes of the whole cache (all layers, K and V).
    pub fn total_size_bytes(&self, batch: usize, seq_len: usize) -> usize {
        let elements = batch * seq_len * self.num_kv_heads * self.head_dim;
        elements * self.dtype.size_in_bytes() * self.num_layers * 2
    }

    /// Allocate zeroed caches for every layer.
    pub fn zeros(&self, batch: usize, seq_len: usize, device: &Device) -> Result<Vec<LayerCache>> {
        (0..self.num_layers)
            .map(|_| LayerCache::zeros(self, batch, seq_len, device))
            .collect()
    }

    /// Check that `caches` were produced under this spec.
    pub fn check(&self, caches: &[LayerCache]) -> Result<()> {
        if caches.len() != self.num_layers {
            return Err(Error::PrefixMismatch(format!(
                "expected {} layers, got {}",
                self.num_layers,
                caches.len()
            )));
        }
        for (i, layer) in caches.iter().enumerate() {
            let (_, _, heads, head_dim) = layer.key.dims4()?;
            if heads != self.num_kv_heads || head_dim != self.head_dim {
                return Err(Error::PrefixMismatch(format!(
                    "layer {i}: expected [.., .., {}, {}], got [.., .., {heads}, {head_dim}]",
                    self.num_kv_heads, self.head_dim
                )));
            }
            if layer.key.dims() != layer.value.dims() {
                return Err(Error::PrefixMismatch(format!(
                    "layer {i}: key {:?} and value {:?} differ",
                    layer.key.dims(),
                    layer.value.dims()
                )));
            }
        }
        Ok(())
    }
}

/// Key and value cache of a single layer.
#[derive(Debug, Clone)]
pub struct LayerCache {
    /// Key cache: [batch, seq_len, num_kv_heads, head_dim]
    pub key: Tensor,
    /// Value cache: [batch, seq_len, num_kv_heads, head_dim]
    pub value: Tensor,
}

impl LayerCache {
    /// Create a zeroed layer cache.
    pub fn zeros(spec: &CacheSpec, batch: usize, seq_len: usize, device: &Device) -> Result<Self> {
        let shape = spec.layer_shape(batch, seq_len);
        Ok(Self {
            key: Tensor::zeros(shape, spec.dtype, device)?,
            value: Tensor::zeros(shape, spec.dtype, device)?,
        })
    }

    /// Number of slots (batch rows).
    pub fn batch_size(&self) -> usize {
        self.key.dims()[BATCH_AXIS]
    }

    /// Number of sequence positions.
    pub fn seq_len(&self) -> usize {
        self.key.dims()[SEQ_AXIS]
    }

    /// Write `key`/`value` of shape `[batch, steps, heads, head_dim]` at
    /// columns `write_start[b] .. write_start[b] + steps` of each row.
    ///
    /// `write_start` is an `i64` tensor of shape `[batch]`. Columns at or
    /// beyond `seq_len` are dropped.
    pub fn write_columns(&self, key: &Tensor, value: &Tensor, write_start: &Tensor) -> Result<Self> {
        let (batch, seq_len, heads, head_dim) = self.key.dims4()?;
        let steps = key.dim(1)?;
        let full = (batch, seq_len, heads, head_dim);

        let mut cache_k = self.key.clone();
        let mut cache_v = self.value.clone();
        for t in 0..steps {
            let offset = Tensor::new(t as i64, write_start.device())?;
            let cols = write_start.broadcast_add(&offset)?;
            let mask = one_hot_columns(&cols, seq_len)?
                .reshape((batch, seq_len, 1, 1))?
                .broadcast_as(full)?;
            let k_t = key.narrow(1, t, 1)?.broadcast_as(full)?;
            let v_t = value.narrow(1, t, 1)?.broadcast_as(full)?;
            cache_k = mask.where_cond(&k_t, &cache_k)?;
            cache_v = mask.where_cond(&v_t, &cache_v)?;
        }

        Ok(Self {
            key: cache_k,
            value: cache_v,
        })
    }

    /// Copy `src` (a `[1, len, ..]` cache) into row `slot` at column `offset`.
    pub fn assign_slot(&self, slot: usize, offset: usize, src: &LayerCache) -> Result<Self> {
        let (_, len, heads, head_dim) = src.key.dims4()?;
        let ranges = [slot..slot + 1, offset..offset + len, 0..heads, 0..head_dim];
        Ok(Self {
            key: self.key.slice_assign(&ranges, &src.key)?,
            value: self.value.slice_assign(&ranges, &src.value)?,
        })
    }

    /// Replace row `slot` with zeros and `src` at column `offset`.
    pub fn replace_slot(&self, slot: usize, offset: usize, src: &LayerCache) -> Result<Self> {
        let (_, seq_len, heads, head_dim) = self.key.dims4()?;
        let mut row = LayerCache {
            key: Tensor::zeros((1, seq_len, heads, head_dim), self.key.dtype(), self.key.device())?,
            value: Tensor::zeros((1, seq_len, heads, head_dim), self.value.dtype(), self.value.device())?,
        };
        row = row.assign_slot(0, offset, src)?;
        self.assign_slot(slot, 0, &row)
    }

    /// Row `slot` as a `[1, seq_len, ..]` cache.
    pub fn slot(&self, slot: usize) -> Result<Self> {
        Ok(Self {
            key: self.key.narrow(BATCH_AXIS, slot, 1)?,
            value: self.value.narrow(BATCH_AXIS, slot, 1)?,
        })
    }

    /// Copy to `device`.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            key: self.key.to_device(device)?,
            value: self.value.to_device(device)?,
        })
    }

    /// First `len` sequence positions.
    pub fn truncate(&self, len: usize) -> Result<Self> {
        Ok(Self {
            key: self.key.narrow(SEQ_AXIS, 0, len)?.contiguous()?,
            value: self.value.narrow(SEQ_AXIS, 0, len)?.contiguous()?,
        })
    }
}

/// One-hot mask `[batch, width]` (u8) with a 1 at `cols[b]` of each row.
///
/// `cols` is an `i64` tensor of shape `[batch]`; out-of-range columns give an
/// all-zero row.
pub fn one_hot_columns(cols: &Tensor, width: usize) -> Result<Tensor> {
    let range = Tensor::arange(0i64, width as i64, cols.device())?.unsqueeze(0)?;
    Ok(range.broadcast_eq(&cols.unsqueeze(1)?)?)
}

/// Additive attention bias `[batch, steps, seq_len]`.
///
/// Query `t` of row `b` may attend column `c` when
/// `window_start[b] <= c <= write_start[b] + t`.
pub fn attention_bias(
    window_start: &Tensor,
    write_start: &Tensor,
    steps: usize,
    seq_len: usize,
) -> Result<Tensor> {
    let device = window_start.device();
    let batch = window_start.dim(0)?;

    let cols = Tensor::arange(0i64, seq_len as i64, device)?.reshape((1, 1, seq_len))?;
    let offsets = Tensor::arange(0i64, steps as i64, device)?.reshape((1, steps, 1))?;
    let lo = window_start.reshape((batch, 1, 1))?;
    let hi = write_start.reshape((batch, 1, 1))?.broadcast_add(&offsets)?;

    let valid = cols
        .broadcast_ge(&lo)?
        .broadcast_mul(&cols.broadcast_le(&hi)?)?
        .broadcast_as((batch, steps, seq_len))?;
    let open = Tensor::zeros((batch, steps, seq_len), DType::F32, device)?;
    let blocked = Tensor::full(MASKED_BIAS, (batch, steps, seq_len), device)?;
    Ok(valid.where_cond(&open, &blocked)?)
}
