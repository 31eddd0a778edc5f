use super::*;
use crate::{checkpoint::CheckpointBuilder, config::Config, Checkpoint};

fn tiny_config() -> Config {
    Config {
        dim: 4,
        hidden_dim: 8,
        n_layers: 1,
        n_heads: 2,
        n_kv_heads: 1,
        vocab_size: 5,
        seq_len: 4,
    }
}

fn tiny_tokenizer() -> Tokenizer {
    let vocab = ["<unk>", "<s>", "</s>", " ", "a"]
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();
    Tokenizer::new(vocab, vec![0.0, 0.0, 0.0, -1.0, -1.0], 5).expect("test")
}

#[test]
fn test_rng_known_sequence() {
    let mut rng = Rng::new(42);
    assert_eq!(rng.random_u32(), 1_456_360_119);
    assert_eq!(rng.random_u32(), 3_359_763_283);
    assert_eq!(rng.random_u32(), 3_393_612_768);

    let mut rng = Rng::new(42);
    assert!((rng.random_f32() - 0.339_085_22).abs() < 1e-7);
}

#[test]
fn test_rng_range() {
    let mut rng = Rng::new(7);
    for _ in 0..1000 {
        let x = rng.random_f32();
        assert!((0.0..1.0).contains(&x));
    }
}

#[test]
fn test_sample_argmax() {
    assert_eq!(sample_argmax(&[0.1, 0.7, 0.2]).expect("test"), 1);
    // First index wins ties
    assert_eq!(sample_argmax(&[0.5, 0.5]).expect("test"), 0);
    assert!(sample_argmax(&[]).is_err());
}

#[test]
fn test_sample_mult() {
    let probs = [0.2, 0.5, 0.3];
    assert_eq!(sample_mult(&probs, 0.0).expect("test"), 0);
    assert_eq!(sample_mult(&probs, 0.19).expect("test"), 0);
    assert_eq!(sample_mult(&probs, 0.21).expect("test"), 1);
    assert_eq!(sample_mult(&probs, 0.95).expect("test"), 2);
    // Mass short of the coin falls through to the last index
    assert_eq!(sample_mult(&[0.1, 0.1], 0.9).expect("test"), 1);
}

#[test]
fn test_sample_topp_boundary() {
    let probs = [0.5, 0.3, 0.1, 0.1];
    assert_eq!(sample_topp(&probs, 0.8, 0.0).expect("test"), 0);
}

#[test]
fn test_sample_topp_sorts_descending() {
    let probs = [0.1, 0.6, 0.3];
    // Sorted: 0.6 (1), 0.3 (2); cumulative 0.9 > 0.5 stops after index 1
    assert_eq!(sample_topp(&probs, 0.5, 0.0).expect("test"), 1);
    assert_eq!(sample_topp(&probs, 0.5, 0.99).expect("test"), 1);
    // With topp 0.85 both 0.6 and 0.3 are kept
    assert_eq!(sample_topp(&probs, 0.85, 0.9).expect("test"), 2);
}

#[test]
fn test_sample_topp_degenerate_inputs() {
    assert_eq!(sample_topp(&[1.0], 0.9, 0.5).expect("test"), 0);
    // Cutoff 0.9 removes every candidate: fall back to argmax
    assert_eq!(sample_topp(&[0.5, 0.5], 0.1, 0.5).expect("test"), 0);
}

#[test]
fn test_sampler_greedy() {
    let mut sampler = Sampler::new(4, 0.0, 0.9, 1).expect("test");
    assert_eq!(sampler.sample(&[1.0, 5.0, 3.0, -2.0]).expect("test"), 1);
}

#[test]
fn test_sampler_is_deterministic_per_seed() {
    let logits = [0.1, 0.4, 0.2, 0.3, 0.0];
    let mut a = Sampler::new(5, 1.0, 0.0, 1234).expect("test");
    let mut b = Sampler::new(5, 1.0, 0.0, 1234).expect("test");
    for _ in 0..20 {
        assert_eq!(a.sample(&logits).expect("test"), b.sample(&logits).expect("test"));
    }
}

#[test]
fn test_sampler_peaked_distribution() {
    // At low temperature the dominant logit always wins
    let mut sampler = Sampler::new(3, 0.01, 0.9, 99).expect("test");
    for _ in 0..10 {
        assert_eq!(sampler.sample(&[0.0, 3.0, 1.0]).expect("test"), 1);
    }
}

#[test]
fn test_sampler_rejects_wrong_length() {
    let mut sampler = Sampler::new(3, 1.0, 0.9, 1).expect("test");
    assert!(matches!(
        sampler.sample(&[0.0, 1.0]).unwrap_err(),
        InferError::InvalidShape { .. }
    ));
}

#[test]
fn test_sampler_rejects_bad_params() {
    assert!(Sampler::new(3, -1.0, 0.9, 1).is_err());
    assert!(Sampler::new(3, f32::NAN, 0.9, 1).is_err());
    assert!(Sampler::new(0, 1.0, 0.9, 1).is_err());
}

#[test]
fn test_generation_config_default() {
    let config = GenerationConfig::default();
    assert!((config.temperature - 1.0).abs() < 1e-6);
    assert!((config.topp - 0.9).abs() < 1e-6);
    assert_eq!(config.steps, 256);
    assert_eq!(config.seed, 0);
}

#[test]
fn test_generation_config_builders() {
    let config = GenerationConfig::greedy().with_steps(16).with_seed(3);
    assert_eq!(config.temperature, 0.0);
    assert_eq!(config.steps, 16);
    assert_eq!(config.seed, 3);

    let config = GenerationConfig::default()
        .with_temperature(0.7)
        .with_topp(0.5);
    assert!((config.temperature - 0.7).abs() < 1e-6);
    assert!((config.topp - 0.5).abs() < 1e-6);
    config.validate().expect("test");
}

#[test]
fn test_generation_config_json() {
    let config = GenerationConfig::greedy().with_steps(8);
    let json = serde_json::to_string(&config).expect("test");
    let back: GenerationConfig = serde_json::from_str(&json).expect("test");
    assert_eq!(back, config);
}

#[test]
fn test_generation_stats_throughput() {
    let stats = GenerationStats {
        positions: 11,
        tokens: vec![],
        elapsed: Duration::from_secs(2),
    };
    assert!((stats.tokens_per_second().expect("test") - 5.0).abs() < 1e-9);

    let stats = GenerationStats {
        positions: 1,
        tokens: vec![],
        elapsed: Duration::ZERO,
    };
    assert!(stats.tokens_per_second().is_none());
}

#[test]
fn test_generate_forces_prompt_then_samples() {
    let bytes = CheckpointBuilder::new(tiny_config()).build();
    let checkpoint = Checkpoint::from_bytes(&bytes).expect("test");
    let model = Model::from_checkpoint(&checkpoint).expect("test");
    let tokenizer = tiny_tokenizer();
    let mut sampler = Sampler::new(5, 0.0, 0.9, 1).expect("test");

    let mut out = Vec::new();
    let stats = generate(&model, &tokenizer, &mut sampler, "a", 4, &mut out).expect("test");

    // Prompt [BOS, " ", "a"]: the first two emitted tokens are forced
    assert_eq!(&stats.tokens[..2], &[3, 4]);
    assert!(stats.positions >= 3 && stats.positions <= 4);
    assert!(!stats.tokens.contains(&BOS));
    // " " after BOS decodes to nothing, then "a"
    assert!(out.starts_with(b"a"));
}

#[test]
fn test_generate_clamps_steps_to_context() {
    let bytes = CheckpointBuilder::new(tiny_config()).build();
    let checkpoint = Checkpoint::from_bytes(&bytes).expect("test");
    let model = Model::from_checkpoint(&checkpoint).expect("test");
    let tokenizer = tiny_tokenizer();
    let mut sampler = Sampler::new(5, 0.0, 0.9, 1).expect("test");

    let mut out = Vec::new();
    let stats = generate(&model, &tokenizer, &mut sampler, "", 100, &mut out).expect("test");
    assert!(stats.positions <= 4);
}
