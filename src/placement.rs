//! Placement contract for disaggregated prefill and decode.
//!
//! Each entity declares which tensor axis is split across the partitions of
//! a device group. The decode pool splits its cache store along the sequence
//! axis; a prefix headed for another pool is split along the kv-head axis.
//! Because the two differ, every transfer goes through an explicit
//! re-partition step:
//!
//! ```text
//!  prefill pool                                  decode pool
//!  ────────────                                  ───────────
//!  Prefix ──► export_prefix ──► PrefixShards ──► import_prefix ──► Prefix
//!              (split on heads)    (owned)       (gather + check)     │
//!                                                                     ▼
//!                                                  insert ──► cache store
//!                                                          (split on seq)
//! ```
//!
//! | entity        | field                           | partition      |
//! |---------------|---------------------------------|----------------|
//! | DecodeState   | caches                          | axis 1 (seq)   |
//! | DecodeState   | tokens, results, counters       | replicated     |
//! | Prefix        | caches                          | axis 2 (heads) |
//! | Prefix        | token                           | replicated     |
//! | ResultTokens  | data, float_data                | replicated     |

use candle_core::Tensor;

use crate::core::kv_cache::{HEAD_AXIS, SEQ_AXIS};
use crate::core::{LayerCache, Prefix};
use crate::error::{Error, Result};

/// How one tensor is laid out across partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// Every partition holds a full copy.
    Replicated,
    /// Split evenly along this axis.
    Axis(usize),
}

/// Entities covered by the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    /// The shared batch state held by the decode pool.
    DecodeState,
    /// A detached prefill output in transit between pools.
    Prefix,
    /// The packed outcome of one `generate` step.
    ResultTokens,
}

/// One row of the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementEntry {
    /// Entity the field belongs to.
    pub entity: Entity,
    /// Field name within the entity.
    pub field: &'static str,
    /// How the field is laid out across partitions.
    pub partition: Partition,
}

/// Static partition scheme for a group of `num_partitions` devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementContract {
    num_partitions: usize,
}

impl PlacementContract {
    /// Contract for `num_partitions` devices.
    pub fn new(num_partitions: usize) -> Self {
        Self { num_partitions }
    }

    /// Number of partitions every split axis is divided into.
    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Partition of the decode-state caches.
    pub fn decode_state_cache(&self) -> Partition {
        Partition::Axis(SEQ_AXIS)
    }

    /// Partition of decode-state tokens, results and counters.
    pub fn decode_state_scalars(&self) -> Partition {
        Partition::Replicated
    }

    /// Partition of a prefix cache destined for transfer.
    pub fn prefix_cache(&self) -> Partition {
        Partition::Axis(HEAD_AXIS)
    }

    /// Partition of a prefix's first token.
    pub fn prefix_token(&self) -> Partition {
        Partition::Replicated
    }

    /// Partition of the per-step result record.
    pub fn result_tokens(&self) -> Partition {
        Partition::Replicated
    }

    /// Sequence axis of a prefix cache.
    pub fn prefix_sequence_axis(&self) -> usize {
        SEQ_AXIS
    }

    /// The whole contract as a table.
    pub fn entries(&self) -> Vec<PlacementEntry> {
        let entry = |entity, field, partition| PlacementEntry {
            entity,
            field,
            partition,
        };
        vec![
            entry(Entity::DecodeState, "caches", self.decode_state_cache()),
            entry(Entity::DecodeState, "tokens", self.decode_state_scalars()),
            entry(Entity::DecodeState, "results", self.decode_state_scalars()),
            entry(Entity::DecodeState, "context_pos", self.decode_state_scalars()),
            entry(Entity::DecodeState, "gen_len", self.decode_state_scalars()),
            entry(Entity::Prefix, "caches", self.prefix_cache()),
            entry(Entity::Prefix, "token", self.prefix_token()),
            entry(Entity::ResultTokens, "data", self.result_tokens()),
            entry(Entity::ResultTokens, "float_data", self.result_tokens()),
        ]
    }

    /// Split a prefix along the prefix cache axis.
    pub fn export_prefix(&self, prefix: &Prefix) -> Result<PrefixShards> {
        let Partition::Axis(axis) = self.prefix_cache() else {
            return Err(Error::Placement("prefix cache is not partitioned".into()));
        };
        PrefixShards::split(prefix, axis, self.num_partitions)
    }

    /// Split decode-state caches along the sequence axis.
    ///
    /// Returns one `Vec<LayerCache>` per partition.
    pub fn shard_decode_caches(&self, caches: &[LayerCache]) -> Result<Vec<Vec<LayerCache>>> {
        shard_layers(caches, SEQ_AXIS, self.num_partitions)
    }
}

/// A prefix split into per-partition pieces for transfer.
#[derive(Debug, Clone)]
pub struct PrefixShards {
    /// First token, replicated.
    pub token: Tensor,
    /// Number of cached prompt positions.
    pub prompt_length: usize,
    /// Axis the caches are split along.
    pub axis: usize,
    /// `shards[partition][layer]`.
    pub shards: Vec<Vec<LayerCache>>,
}

impl PrefixShards {
    /// Split `prefix` into `parts` pieces along `axis`.
    pub fn split(prefix: &Prefix, axis: usize, parts: usize) -> Result<Self> {
        Ok(Self {
            token: prefix.token.clone(),
            prompt_length: prefix.prompt_length,
            axis,
            shards: shard_layers(&prefix.caches, axis, parts)?,
        })
    }

    /// Number of partitions.
    pub fn num_partitions(&self) -> usize {
        self.shards.len()
    }

    /// Concatenate the shards back into one prefix.
    pub fn gather(self) -> Result<Prefix> {
        let num_layers = self.shards.first().map_or(0, Vec::len);
        if self.shards.iter().any(|shard| shard.len() != num_layers) {
            return Err(Error::Placement("shards disagree on layer count".into()));
        }
        let caches = (0..num_layers)
            .map(|layer| {
                let keys: Vec<&Tensor> = self.shards.iter().map(|s| &s[layer].key).collect();
                let values: Vec<&Tensor> = self.shards.iter().map(|s| &s[layer].value).collect();
                Ok(LayerCache {
                    key: gather(&keys, self.axis)?,
                    value: gather(&values, self.axis)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Prefix {
            token: self.token,
            caches,
            prompt_length: self.prompt_length,
        })
    }

    /// Re-split along `axis` into `parts` pieces.
    pub fn repartition(self, axis: usize, parts: usize) -> Result<Self> {
        if axis == self.axis && parts == self.num_partitions() {
            return Ok(self);
        }
        let prefix = self.gather()?;
        Self::split(&prefix, axis, parts)
    }
}

fn shard_layers(caches: &[LayerCache], axis: usize, parts: usize) -> Result<Vec<Vec<LayerCache>>> {
    let mut shards: Vec<Vec<LayerCache>> = (0..parts).map(|_| Vec::with_capacity(caches.len())).collect();
    for layer in caches {
        let keys = shard(&layer.key, axis, parts)?;
        let values = shard(&layer.value, axis, parts)?;
        for (dst, (key, value)) in shards.iter_mut().zip(keys.into_iter().zip(values)) {
            dst.push(LayerCache { key, value });
        }
    }
    Ok(shards)
}

/// Split `tensor` into `parts` equal pieces along `axis`.
pub fn shard(tensor: &Tensor, axis: usize, parts: usize) -> Result<Vec<Tensor>> {
    let dims = tensor.dims();
    let Some(&len) = dims.get(axis) else {
        return Err(Error::Placement(format!(
            "axis {axis} out of range for shape {dims:?}"
        )));
    };
    if parts == 0 || len % parts != 0 {
        return Err(Error::Placement(format!(
            "axis {axis} of length {len} does not split into {parts} parts"
        )));
    }
    let size = len / parts;
    (0..parts)
        .map(|i| Ok(tensor.narrow(axis, i * size, size)?.contiguous()?))
        .collect()
}

/// Concatenate `parts` along `axis`.
pub fn gather(parts: &[&Tensor], axis: usize) -> Result<Tensor> {
    if parts.is_empty() {
        return Err(Error::Placement("nothing to gather".into()));
    }
    Tensor::cat(parts, axis).map_err(|e| Error::Placement(format!("gather along axis {axis}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_contract_axes() {
        let contract = PlacementContract::new(2);
        assert_eq!(contract.decode_state_cache(), Partition::Axis(1));
        assert_eq!(contract.prefix_cache(), Partition::Axis(2));
        assert_eq!(contract.prefix_sequence_axis(), 1);
        assert_eq!(contract.result_tokens(), Partition::Replicated);
        assert_ne!(contract.decode_state_cache(), contract.prefix_cache());
    }

    #[test]
    fn test_entries_cover_every_entity() {
        let entries = PlacementContract::new(1).entries();
        for entity in [Entity::DecodeState, Entity::Prefix, Entity::ResultTokens] {
            assert!(entries.iter().any(|e| e.entity == entity));
        }
        let caches: Vec<&PlacementEntry> = entries.iter().filter(|e| e.field == "caches").collect();
        assert_eq!(caches.len(), 2);
        assert!(caches.iter().all(|e| matches!(e.partition, Partition::Axis(_))));
    }

    #[test]
    fn test_shard_and_gather() {
        let device = Device::Cpu;
        let tensor = Tensor::arange(0f32, 24., &device).unwrap().reshape((1, 3, 4, 2)).unwrap();
        let parts = shard(&tensor, 2, 2).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].dims(), &[1, 3, 2, 2]);

        let refs: Vec<&Tensor> = parts.iter().collect();
        let back = gather(&refs, 2).unwrap();
        let diff: f32 = (back - &tensor).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.);
    }

    #[test]
    fn test_uneven_shard_fails() {
        let tensor = Tensor::zeros((1, 3, 4, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(shard(&tensor, 1, 2), Err(Error::Placement(_))));
        assert!(matches!(shard(&tensor, 4, 1), Err(Error::Placement(_))));
    }

    #[test]
    fn test_gather_nothing_fails() {
        assert!(matches!(gather(&[], 0), Err(Error::Placement(_))));
    }
}
