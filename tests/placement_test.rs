//! Integration tests for the placement contract.

use candle_core::{Device, Tensor};
use slot_engine::placement::{Entity, Partition};
use slot_engine::{
    BatchEngine, EngineConfig, Error, PrefillInputs, Prefix, PrefixShards, ReferenceScorer,
    SamplingConfig, ScorerConfig,
};

fn test_scorer_config() -> ScorerConfig {
    ScorerConfig {
        vocab_size: 32,
        hidden_size: 16,
        num_layers: 2,
        num_kv_heads: 4,
        head_dim: 4,
        seed: 1,
    }
}

fn test_engine(num_partitions: usize, scorer: ScorerConfig) -> BatchEngine<ReferenceScorer> {
    let config = EngineConfig {
        max_batch_size: 2,
        max_seq_len: 16,
        max_decode_length: 8,
        num_partitions,
        ..EngineConfig::default()
    };
    BatchEngine::new(config, ReferenceScorer::new(scorer), Device::Cpu).unwrap()
}

fn test_prefix(engine: &BatchEngine<ReferenceScorer>, tokens: &[u32]) -> Prefix {
    let params = engine.load_params().unwrap();
    let inputs = PrefillInputs::from_tokens(tokens, &Device::Cpu).unwrap();
    engine
        .prefill(&params, &inputs, None, &SamplingConfig::default())
        .unwrap()
        .0
}

fn values(tensor: &Tensor) -> Vec<f32> {
    tensor.flatten_all().unwrap().to_vec1().unwrap()
}

fn assert_same_prefix(a: &Prefix, b: &Prefix) {
    assert_eq!(a.prompt_length, b.prompt_length);
    assert_eq!(a.first_token().unwrap(), b.first_token().unwrap());
    for (x, y) in a.caches.iter().zip(&b.caches) {
        assert_eq!(values(&x.key), values(&y.key));
        assert_eq!(values(&x.value), values(&y.value));
    }
}

#[test]
fn test_contract_declares_asymmetric_axes() {
    let contract = test_engine(2, test_scorer_config()).placement();

    assert_eq!(contract.num_partitions(), 2);
    assert_eq!(contract.decode_state_cache(), Partition::Axis(1));
    assert_eq!(contract.decode_state_scalars(), Partition::Replicated);
    assert_eq!(contract.prefix_cache(), Partition::Axis(2));
    assert_eq!(contract.prefix_token(), Partition::Replicated);
    assert_eq!(contract.prefix_sequence_axis(), 1);

    let replicated_results = contract
        .entries()
        .iter()
        .filter(|e| e.entity == Entity::ResultTokens)
        .all(|e| e.partition == Partition::Replicated);
    assert!(replicated_results);
}

#[test]
fn test_export_splits_heads() {
    let engine = test_engine(2, test_scorer_config());
    let prefix = test_prefix(&engine, &[1, 2, 3]);
    let shards = engine.export_prefix(&prefix).unwrap();

    assert_eq!(shards.num_partitions(), 2);
    assert_eq!(shards.axis, 2);
    assert_eq!(shards.prompt_length, 3);
    for shard in &shards.shards {
        assert_eq!(shard.len(), 2);
        assert_eq!(shard[0].key.dims(), &[1, 3, 2, 4]);
    }
}

#[test]
fn test_transfer_between_pools() {
    let prefill_pool = test_engine(2, test_scorer_config());
    let decode_pool = test_engine(1, test_scorer_config());
    let prefix = test_prefix(&prefill_pool, &[4, 5, 6, 7]);

    let shards = prefill_pool.export_prefix(&prefix).unwrap();
    let imported = decode_pool.import_prefix(shards).unwrap();
    assert_same_prefix(&prefix, &imported);

    let params = decode_pool.load_params().unwrap();
    let state = decode_pool.init_decode_state().unwrap();
    let state = decode_pool
        .insert(imported, &state, 1, &SamplingConfig::default())
        .unwrap();
    let (state, _) = decode_pool.generate(&params, state).unwrap();
    assert_eq!(state.gen_lens().unwrap()[1], 2);
}

#[test]
fn test_import_rejects_foreign_layout() {
    let prefill_pool = test_engine(2, test_scorer_config());
    let decode_pool = test_engine(
        1,
        ScorerConfig {
            head_dim: 8,
            ..test_scorer_config()
        },
    );
    let shards = prefill_pool
        .export_prefix(&test_prefix(&prefill_pool, &[1, 2]))
        .unwrap();
    assert!(matches!(
        decode_pool.import_prefix(shards),
        Err(Error::PrefixMismatch(_))
    ));
}

#[test]
fn test_repartition_to_sequence_axis() {
    let engine = test_engine(2, test_scorer_config());
    let prefix = test_prefix(&engine, &[1, 2, 3, 4]);
    let shards = engine.export_prefix(&prefix).unwrap();

    let by_seq = shards.repartition(1, 4).unwrap();
    assert_eq!(by_seq.axis, 1);
    assert_eq!(by_seq.num_partitions(), 4);
    assert_eq!(by_seq.shards[0][0].key.dims(), &[1, 1, 4, 4]);

    assert_same_prefix(&prefix, &by_seq.gather().unwrap());
}

#[test]
fn test_uneven_split_fails() {
    let engine = test_engine(1, test_scorer_config());
    let prefix = test_prefix(&engine, &[1, 2, 3]);

    assert!(matches!(
        PrefixShards::split(&prefix, 2, 3),
        Err(Error::Placement(_))
    ));
    let shards = PrefixShards::split(&prefix, 2, 2).unwrap();
    assert!(matches!(shards.repartition(1, 2), Err(Error::Placement(_))));
}

#[test]
fn test_shard_decode_caches_on_sequence_axis() {
    let engine = test_engine(2, test_scorer_config());
    let state = engine.init_decode_state().unwrap();
    let shards = engine.placement().shard_decode_caches(state.caches()).unwrap();

    assert_eq!(shards.len(), 2);
    assert_eq!(shards[0].len(), 2);
    assert_eq!(shards[1][0].key.dims(), &[2, 8, 4, 4]);
}
