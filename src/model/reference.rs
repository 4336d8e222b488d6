//! Reference scorer.
//!
//! A small attention-only model that reads and writes the slot cache layout
//! directly. Every layer projects the hidden state to keys, values and
//! queries with one head group, attends over the row's window, and adds the
//! projected result back as a residual:
//!
//! ```text
//! tokens ─► embed ─┬─► q ───────────────┐
//!                  ├─► k ─► cache write ├─► attention ─► o ─► (+) ─► next layer
//!                  └─► v ─► cache write ┘                      ▲
//!                  └───────────────────────────────────────────┘
//! last position ─► lm_head ─► logits
//! ```
//!
//! Weights come either from SafeTensors files or from a seeded RNG, so two
//! scorers built from the same config produce identical logits.

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::loader::load_safetensors;
use super::{Scorer, ScorerOutput, StepInput};
use crate::config::ScorerConfig;
use crate::core::kv_cache::attention_bias;
use crate::core::{CacheSpec, LayerCache};
use crate::error::{Error, Result};

/// Projections of a single layer.
#[derive(Debug, Clone)]
struct ReferenceLayer {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
}

impl ReferenceLayer {
    fn new(config: &ScorerConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let attn = config.attn_dim();
        Ok(Self {
            q_proj: linear_no_bias(hidden, attn, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(hidden, attn, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(hidden, attn, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(attn, hidden, vb.pp("o_proj"))?,
        })
    }
}

/// Loaded weights of a [`ReferenceScorer`].
#[derive(Debug, Clone)]
pub struct ReferenceParams {
    embed_tokens: Embedding,
    layers: Vec<ReferenceLayer>,
    lm_head: Linear,
}

impl ReferenceParams {
    /// Build the parameters from a VarBuilder.
    ///
    /// Expected tensor names:
    /// - `embed_tokens.weight` `[vocab, hidden]`
    /// - `layers.{i}.{q,k,v}_proj.weight` `[heads * head_dim, hidden]`
    /// - `layers.{i}.o_proj.weight` `[hidden, heads * head_dim]`
    /// - `lm_head.weight` `[vocab, hidden]`
    pub fn new(config: &ScorerConfig, vb: VarBuilder) -> Result<Self> {
        let embed_tokens = embedding(config.vocab_size, config.hidden_size, vb.pp("embed_tokens"))?;
        let layers = (0..config.num_layers)
            .map(|i| ReferenceLayer::new(config, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let lm_head = linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?;
        Ok(Self {
            embed_tokens,
            layers,
            lm_head,
        })
    }

    /// Deterministic weights drawn from `config.seed`.
    pub fn random(config: &ScorerConfig, device: &Device) -> Result<Self> {
        let tensors = Self::random_tensors(config, device)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::new(config, vb)
    }

    /// The named tensors behind [`ReferenceParams::random`].
    ///
    /// Values are uniform in `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`.
    pub fn random_tensors(config: &ScorerConfig, device: &Device) -> Result<HashMap<String, Tensor>> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let hidden = config.hidden_size;
        let attn = config.attn_dim();

        let mut tensors = HashMap::new();
        tensors.insert(
            "embed_tokens.weight".to_string(),
            uniform(&mut rng, (config.vocab_size, hidden), 1.0, device)?,
        );
        for i in 0..config.num_layers {
            for name in ["q_proj", "k_proj", "v_proj"] {
                tensors.insert(
                    format!("layers.{i}.{name}.weight"),
                    uniform(&mut rng, (attn, hidden), fan_in_scale(hidden), device)?,
                );
            }
            tensors.insert(
                format!("layers.{i}.o_proj.weight"),
                uniform(&mut rng, (hidden, attn), fan_in_scale(attn), device)?,
            );
        }
        tensors.insert(
            "lm_head.weight".to_string(),
            uniform(&mut rng, (config.vocab_size, hidden), fan_in_scale(hidden), device)?,
        );
        Ok(tensors)
    }
}

fn fan_in_scale(fan_in: usize) -> f32 {
    1.0 / (fan_in as f32).sqrt()
}

fn uniform(rng: &mut StdRng, shape: (usize, usize), scale: f32, device: &Device) -> Result<Tensor> {
    let values: Vec<f32> = (0..shape.0 * shape.1)
        .map(|_| rng.gen_range(-scale..scale))
        .collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

/// Attention-only scorer over the slot cache layout.
#[derive(Debug, Clone)]
pub struct ReferenceScorer {
    config: ScorerConfig,
    weights: Vec<PathBuf>,
}

impl ReferenceScorer {
    /// Scorer with seeded random weights.
    pub fn new(config: ScorerConfig) -> Self {
        Self {
            config,
            weights: Vec::new(),
        }
    }

    /// Load weights from SafeTensors files instead of generating them.
    pub fn with_weights(mut self, paths: Vec<PathBuf>) -> Self {
        self.weights = paths;
        self
    }

    /// Scorer configuration.
    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }
}

impl Scorer for ReferenceScorer {
    type Params = ReferenceParams;

    fn load_params(&self, device: &Device) -> Result<ReferenceParams> {
        if self.weights.is_empty() {
            ReferenceParams::random(&self.config, device)
        } else {
            let vb = load_safetensors(&self.weights, DType::F32, device)?;
            ReferenceParams::new(&self.config, vb)
                .map_err(|e| Error::ModelLoad(format!("reference weights: {e}")))
        }
    }

    fn cache_spec(&self) -> CacheSpec {
        CacheSpec::new(
            self.config.num_layers,
            self.config.num_kv_heads,
            self.config.head_dim,
        )
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward(
        &self,
        params: &ReferenceParams,
        input: StepInput<'_>,
        caches: Vec<LayerCache>,
    ) -> Result<ScorerOutput> {
        self.cache_spec().check(&caches)?;
        let (batch, steps) = input.tokens.dims2()?;
        let seq_len = caches.first().map_or(0, LayerCache::seq_len);
        let heads = self.config.num_kv_heads;
        let head_dim = self.config.head_dim;
        let scale = 1.0 / (head_dim as f64).sqrt();

        // [batch, 1, steps, seq_len], shared by every head
        let bias = attention_bias(input.window_start, input.write_start, steps, seq_len)?
            .unsqueeze(1)?;

        let mut hidden = params.embed_tokens.forward(input.tokens)?;
        let mut updated = Vec::with_capacity(caches.len());
        for (layer, cache) in params.layers.iter().zip(caches) {
            let shape = (batch, steps, heads, head_dim);
            let q = layer.q_proj.forward(&hidden)?.reshape(shape)?;
            let k = layer.k_proj.forward(&hidden)?.reshape(shape)?;
            let v = layer.v_proj.forward(&hidden)?.reshape(shape)?;

            let cache = cache.write_columns(&k, &v, input.write_start)?;

            let q = q.transpose(1, 2)?.contiguous()?;
            let k_all = cache.key.transpose(1, 2)?.contiguous()?;
            let v_all = cache.value.transpose(1, 2)?.contiguous()?;

            let scores = (q.matmul(&k_all.t()?)? * scale)?.broadcast_add(&bias)?;
            let probs = candle_nn::ops::softmax_last_dim(&scores)?;
            let attn = probs
                .matmul(&v_all)?
                .transpose(1, 2)?
                .contiguous()?
                .reshape((batch, steps, heads * head_dim))?;

            hidden = (hidden + layer.o_proj.forward(&attn)?)?;
            updated.push(cache);
        }

        let last = hidden.narrow(1, steps - 1, 1)?.squeeze(1)?;
        let logits = params.lm_head.forward(&last)?;
        Ok(ScorerOutput {
            logits,
            caches: updated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ScorerConfig {
        ScorerConfig {
            vocab_size: 16,
            hidden_size: 8,
            num_layers: 2,
            num_kv_heads: 2,
            head_dim: 4,
            seed: 3,
        }
    }

    fn run(
        scorer: &ReferenceScorer,
        params: &ReferenceParams,
        tokens: &[u32],
    ) -> (Vec<f32>, Vec<LayerCache>) {
        let device = Device::Cpu;
        let len = tokens.len();
        let tokens = Tensor::new(tokens, &device).unwrap().unsqueeze(0).unwrap();
        let zero = Tensor::new(&[0i64], &device).unwrap();
        let caches = scorer.cache_spec().zeros(1, len, &device).unwrap();
        let input = StepInput {
            tokens: &tokens,
            window_start: &zero,
            write_start: &zero,
        };
        let out = scorer.forward(params, input, caches).unwrap();
        (out.logits.squeeze(0).unwrap().to_vec1().unwrap(), out.caches)
    }

    #[test]
    fn test_random_params_are_seeded() {
        let device = Device::Cpu;
        let a = ReferenceParams::random_tensors(&test_config(), &device).unwrap();
        let b = ReferenceParams::random_tensors(&test_config(), &device).unwrap();
        let key = "layers.1.k_proj.weight";
        let a: Vec<Vec<f32>> = a[key].to_vec2().unwrap();
        let b: Vec<Vec<f32>> = b[key].to_vec2().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_forward_shapes() {
        let scorer = ReferenceScorer::new(test_config());
        let params = scorer.load_params(&Device::Cpu).unwrap();
        let (logits, caches) = run(&scorer, &params, &[1, 2, 3]);
        assert_eq!(logits.len(), 16);
        assert_eq!(caches.len(), 2);
        assert_eq!(caches[0].key.dims(), &[1, 3, 2, 4]);
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_forward_writes_every_column() {
        let scorer = ReferenceScorer::new(test_config());
        let params = scorer.load_params(&Device::Cpu).unwrap();
        let (_, caches) = run(&scorer, &params, &[4, 5, 6]);
        let per_column: Vec<f32> = caches[0]
            .key
            .abs()
            .unwrap()
            .sum((0, 2, 3))
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(per_column.iter().all(|&v| v > 0.0));
    }

    #[test]
    fn test_incremental_matches_full_prompt() {
        let device = Device::Cpu;
        let scorer = ReferenceScorer::new(test_config());
        let params = scorer.load_params(&device).unwrap();
        let (full, _) = run(&scorer, &params, &[7, 8, 9]);

        // Score the first two tokens, then the third against the cache.
        let (_, caches) = run(&scorer, &params, &[7, 8]);
        let mut grown = scorer.cache_spec().zeros(1, 3, &device).unwrap();
        for (dst, src) in grown.iter_mut().zip(&caches) {
            *dst = dst.assign_slot(0, 0, src).unwrap();
        }
        let last = Tensor::new(&[[9u32]], &device).unwrap();
        let window = Tensor::new(&[0i64], &device).unwrap();
        let write = Tensor::new(&[2i64], &device).unwrap();
        let out = scorer
            .forward(
                &params,
                StepInput {
                    tokens: &last,
                    window_start: &window,
                    write_start: &write,
                },
                grown,
            )
            .unwrap();
        let step: Vec<f32> = out.logits.squeeze(0).unwrap().to_vec1().unwrap();

        for (a, b) in full.iter().zip(&step) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_forward_rejects_foreign_caches() {
        let device = Device::Cpu;
        let scorer = ReferenceScorer::new(test_config());
        let params = scorer.load_params(&device).unwrap();
        let tokens = Tensor::new(&[[1u32]], &device).unwrap();
        let zero = Tensor::new(&[0i64], &device).unwrap();
        let caches = CacheSpec::new(1, 2, 4).zeros(1, 1, &device).unwrap();
        let input = StepInput {
            tokens: &tokens,
            window_start: &zero,
            write_start: &zero,
        };
        assert!(matches!(
            scorer.forward(&params, input, caches),
            Err(Error::PrefixMismatch(_))
        ));
    }
}
