//! Detached prefill output and prefill inputs.

use candle_core::{DType, Device, Tensor};

use super::kv_cache::{CacheSpec, LayerCache};
use crate::error::{Error, Result};

/// Batch-size-one cache and first token produced by `prefill`.
///
/// A prefix belongs to no slot. It is consumed by `insert`, or exported
/// through the placement contract to another engine.
#[derive(Debug, Clone)]
pub struct Prefix {
    /// First generated token, shape `[1, 1]` (u32).
    pub token: Tensor,
    /// Per-layer caches, each `[1, prompt_length, num_kv_heads, head_dim]`.
    pub caches: Vec<LayerCache>,
    /// Number of cached prompt positions.
    pub prompt_length: usize,
}

impl Prefix {
    /// First token as a host value.
    pub fn first_token(&self) -> Result<u32> {
        Ok(self.token.flatten_all()?.to_vec1::<u32>()?[0])
    }

    /// Check the prefix against a cache spec and its own declared length.
    pub fn check(&self, spec: &CacheSpec) -> Result<()> {
        spec.check(&self.caches)?;
        for layer in &self.caches {
            let (batch, len, _, _) = layer.key.dims4()?;
            if batch != 1 || len != self.prompt_length {
                return Err(Error::PrefixMismatch(format!(
                    "expected cache [1, {}, ..], got [{batch}, {len}, ..]",
                    self.prompt_length
                )));
            }
        }
        Ok(())
    }

    /// Copy to `device`.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            token: self.token.to_device(device)?,
            caches: self
                .caches
                .iter()
                .map(|layer| layer.to_device(device))
                .collect::<Result<Vec<_>>>()?,
            prompt_length: self.prompt_length,
        })
    }

    /// Trim the cache to the first `new_length` positions.
    ///
    /// The first token is kept as the next input, so decoding resumes from
    /// it on top of the shorter context. That token was sampled after the
    /// full prompt, not after the trimmed one; an orchestrator that needs a
    /// token conditioned on the trimmed context must prefill again.
    pub fn shrink(self, new_length: usize) -> Result<Self> {
        if new_length == 0 {
            return Err(Error::InvalidInput("cannot shrink a prefix to zero length".into()));
        }
        if new_length >= self.prompt_length {
            return Ok(self);
        }
        let caches = self
            .caches
            .iter()
            .map(|layer| layer.truncate(new_length))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            token: self.token,
            caches,
            prompt_length: new_length,
        })
    }
}

/// Prompt tokens for a single request.
#[derive(Debug, Clone)]
pub struct PrefillInputs {
    /// Token ids. Must be a one-dimensional integer sequence.
    pub tokens: Tensor,
}

impl PrefillInputs {
    /// Wrap an arbitrary tensor; validated by `prefill`.
    pub fn new(tokens: Tensor) -> Self {
        Self { tokens }
    }

    /// Build inputs from host token ids.
    pub fn from_tokens(tokens: &[u32], device: &Device) -> Result<Self> {
        Ok(Self {
            tokens: Tensor::new(tokens, device)?,
        })
    }

    /// Normalize to a `[1, len]` u32 tensor.
    ///
    /// Accepts rank 1, or rank 2 with a leading dimension of 1, in any
    /// integer dtype. Signed ids must fit in `u32`. Anything else is an
    /// `InvalidInput`.
    pub fn to_batch(&self) -> Result<Tensor> {
        let dims = self.tokens.dims();
        let len = match dims {
            [len] => *len,
            [1, len] => *len,
            _ => {
                return Err(Error::InvalidInput(format!(
                    "expected a one-dimensional token sequence, got shape {dims:?}"
                )))
            }
        };
        if len == 0 {
            return Err(Error::InvalidInput("empty prompt".into()));
        }
        let tokens = match self.tokens.dtype() {
            DType::U32 => self.tokens.clone(),
            DType::U8 => self.tokens.to_dtype(DType::U32)?,
            DType::I64 => {
                let flat = self.tokens.flatten_all()?;
                let min = flat.min(0)?.to_scalar::<i64>()?;
                let max = flat.max(0)?.to_scalar::<i64>()?;
                if min < 0 || max > i64::from(u32::MAX) {
                    return Err(Error::InvalidInput(format!(
                        "token ids must lie in [0, {}], got range [{min}, {max}]",
                        u32::MAX
                    )));
                }
                self.tokens.to_dtype(DType::U32)?
            }
            other => {
                return Err(Error::InvalidInput(format!(
                    "expected integer token ids, got {other:?}"
                )))
            }
        };
        Ok(tokens.reshape((1, len))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_prefix(len: usize) -> Prefix {
        let device = Device::Cpu;
        let spec = CacheSpec::new(2, 2, 4);
        let caches = (0..spec.num_layers)
            .map(|_| {
                let key = Tensor::arange(0f32, (len * 8) as f32, &device)
                    .unwrap()
                    .reshape(spec.layer_shape(1, len))
                    .unwrap();
                LayerCache {
                    value: key.clone(),
                    key,
                }
            })
            .collect();
        Prefix {
            token: Tensor::new(&[[7u32]], &device).unwrap(),
            caches,
            prompt_length: len,
        }
    }

    #[test]
    fn test_first_token() {
        assert_eq!(test_prefix(3).first_token().unwrap(), 7);
    }

    #[test]
    fn test_shrink_trims_cache() {
        let shrunk = test_prefix(5).shrink(2).unwrap();
        assert_eq!(shrunk.prompt_length, 2);
        assert_eq!(shrunk.caches[0].key.dims(), &[1, 2, 2, 4]);
        let kept: Vec<f32> = shrunk.caches[1].key.flatten_all().unwrap().to_vec1().unwrap();
        let expected: Vec<f32> = (0..16).map(|v| v as f32).collect();
        assert_eq!(kept, expected);
        assert!(shrunk.check(&CacheSpec::new(2, 2, 4)).is_ok());
    }

    #[test]
    fn test_shrink_keeps_first_token() {
        let shrunk = test_prefix(4).shrink(1).unwrap();
        assert_eq!(shrunk.first_token().unwrap(), 7);
        assert_eq!(shrunk.prompt_length, 1);
    }

    #[test]
    fn test_shrink_longer_is_identity() {
        let shrunk = test_prefix(3).shrink(10).unwrap();
        assert_eq!(shrunk.prompt_length, 3);
        assert_eq!(shrunk.caches[0].key.dims(), &[1, 3, 2, 4]);
    }

    #[test]
    fn test_shrink_to_zero_fails() {
        assert!(matches!(test_prefix(3).shrink(0), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_inputs_shapes() {
        let device = Device::Cpu;
        let flat = PrefillInputs::from_tokens(&[1, 2, 3], &device).unwrap();
        assert_eq!(flat.to_batch().unwrap().dims(), &[1, 3]);

        let row = PrefillInputs::new(Tensor::new(&[[1i64, 2]], &device).unwrap());
        let batch = row.to_batch().unwrap();
        assert_eq!(batch.dtype(), DType::U32);
        assert_eq!(batch.dims(), &[1, 2]);
    }

    #[test]
    fn test_inputs_rejects_bad_shapes() {
        let device = Device::Cpu;
        let matrix = PrefillInputs::new(Tensor::zeros((2, 3), DType::U32, &device).unwrap());
        assert!(matches!(matrix.to_batch(), Err(Error::InvalidInput(_))));

        let floats = PrefillInputs::new(Tensor::new(&[1f32, 2.], &device).unwrap());
        assert!(matches!(floats.to_batch(), Err(Error::InvalidInput(_))));

        let empty = PrefillInputs::from_tokens(&[], &device).unwrap();
        assert!(matches!(empty.to_batch(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_inputs_rejects_ids_outside_u32() {
        let device = Device::Cpu;
        for ids in [[-4_294_967_295i64, 2], [1, 4_294_967_298], [-1, 0]] {
            let inputs = PrefillInputs::new(Tensor::new(&ids, &device).unwrap());
            assert!(matches!(inputs.to_batch(), Err(Error::InvalidInput(_))));
        }

        let edge = PrefillInputs::new(Tensor::new(&[0i64, u32::MAX as i64], &device).unwrap());
        let ids: Vec<Vec<u32>> = edge.to_batch().unwrap().to_vec2().unwrap();
        assert_eq!(ids, vec![vec![0, u32::MAX]]);
    }
}
