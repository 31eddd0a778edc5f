use crate::layers::*;
use crate::{
    checkpoint::{Checkpoint, CheckpointBuilder},
    error::InferError,
    tensor::Tensor,
};

use super::{gqa_config, owned_weights, tiny_config};

fn checkpoint(shared: bool) -> Checkpoint {
    let bytes = CheckpointBuilder::new(gqa_config()).shared(shared).build();
    Checkpoint::from_bytes(&bytes).expect("test")
}

fn run(model: &Model<'_>, state: &mut DecodeState, tokens: &[usize]) -> Vec<Tensor<'static>> {
    tokens
        .iter()
        .enumerate()
        .map(|(pos, &t)| model.forward(state, t, pos).expect("test"))
        .collect()
}

#[test]
fn test_model_from_checkpoint_shared() {
    let ckpt = checkpoint(true);
    let model = Model::from_checkpoint(&ckpt).expect("test");
    assert_eq!(model.layers().len(), 2);
    assert!(model.shares_classifier());
    assert!(model.embedding().is_view());
    assert!(model.layers()[1].weights().weight2.is_view());
}

#[test]
fn test_model_from_checkpoint_separate_classifier() {
    let ckpt = checkpoint(false);
    let model = Model::from_checkpoint(&ckpt).expect("test");
    assert!(!model.shares_classifier());
    assert_eq!(model.classifier().shape(), (6, 8));
    // The classifier is the last block of the weight section
    let weights = ckpt.weights();
    assert_eq!(
        model.classifier().data().as_ptr(),
        weights[weights.len() - 48..].as_ptr()
    );
}

#[test]
fn test_model_views_alias_checkpoint() {
    let ckpt = checkpoint(true);
    let model = Model::from_checkpoint(&ckpt).expect("test");
    assert_eq!(model.embedding().data().as_ptr(), ckpt.weights().as_ptr());
}

#[test]
fn test_model_new_validates_parts() {
    let config = tiny_config();
    let layer = AttentionLayer::new(&config, owned_weights(&config)).expect("test");

    let err = Model::new(
        config,
        Tensor::zeros(5, 4),
        vec![],
        Tensor::filled(1, 4, 1.0),
        Tensor::zeros(5, 4),
    )
    .unwrap_err();
    assert!(err.to_string().contains("layers"));

    let err = Model::new(
        config,
        Tensor::zeros(4, 5),
        vec![layer],
        Tensor::filled(1, 4, 1.0),
        Tensor::zeros(5, 4),
    )
    .unwrap_err();
    assert!(err.to_string().contains("embedding"));
}

#[test]
fn test_forward_logits_shape() {
    let ckpt = checkpoint(true);
    let model = Model::from_checkpoint(&ckpt).expect("test");
    let mut state = model.new_state().expect("test");

    let logits = model.forward(&mut state, 3, 0).expect("test");
    assert_eq!(logits.shape(), (1, 6));
    assert!(logits.data().iter().all(|v| v.is_finite()));
    assert_eq!(state.len(), 1);
}

#[test]
fn test_forward_does_not_touch_embedding() {
    let ckpt = checkpoint(true);
    let model = Model::from_checkpoint(&ckpt).expect("test");
    let mut state = model.new_state().expect("test");
    let before = model.embedding().data().to_vec();

    run(&model, &mut state, &[1, 2, 3]);
    assert_eq!(model.embedding().data(), &before[..]);
}

#[test]
fn test_forward_token_out_of_range() {
    let ckpt = checkpoint(true);
    let model = Model::from_checkpoint(&ckpt).expect("test");
    let mut state = model.new_state().expect("test");
    assert!(matches!(
        model.forward(&mut state, 6, 0).unwrap_err(),
        InferError::TokenOutOfRange {
            token: 6,
            vocab_size: 6
        }
    ));
    assert!(state.is_empty());
}

#[test]
fn test_forward_context_limit() {
    let ckpt = checkpoint(true);
    let model = Model::from_checkpoint(&ckpt).expect("test");
    let mut state = model.new_state().expect("test");
    run(&model, &mut state, &[1, 1, 1, 1, 1]);

    assert!(matches!(
        model.forward(&mut state, 1, 5).unwrap_err(),
        InferError::ContextLimitExceeded {
            provided: 5,
            maximum: 5
        }
    ));
    assert_eq!(state.len(), 5);
}

#[test]
fn test_forward_rejects_skipped_position() {
    let ckpt = checkpoint(true);
    let model = Model::from_checkpoint(&ckpt).expect("test");
    let mut state = model.new_state().expect("test");
    run(&model, &mut state, &[1]);
    let snapshot = state.clone();

    assert!(matches!(
        model.forward(&mut state, 2, 2).unwrap_err(),
        InferError::NonContiguousPosition { pos: 2, cached: 1 }
    ));
    for l in 0..2 {
        let (a, b) = (
            state.cache(l).expect("test"),
            snapshot.cache(l).expect("test"),
        );
        assert_eq!(a.len(), b.len());
        assert_eq!(
            a.key_row(1).expect("test").data(),
            b.key_row(1).expect("test").data()
        );
    }
}

#[test]
fn test_forward_rejects_foreign_state() {
    let ckpt = checkpoint(true);
    let model = Model::from_checkpoint(&ckpt).expect("test");
    let mut state = DecodeState::new(&tiny_config()).expect("test");
    assert!(matches!(
        model.forward(&mut state, 1, 0).unwrap_err(),
        InferError::InvalidShape { .. }
    ));
}

#[test]
fn test_causal_isolation_future_rows_never_read() {
    let ckpt = checkpoint(true);
    let model = Model::from_checkpoint(&ckpt).expect("test");
    let tokens = [1, 4, 2];

    let mut clean = model.new_state().expect("test");
    let expected = run(&model, &mut clean, &tokens);

    let mut dirty = model.new_state().expect("test");
    run(&model, &mut dirty, &tokens[..2]);
    let garbage = [f32::NAN, 1e30, -1e30, f32::INFINITY];
    for l in 0..2 {
        let cache = dirty.cache_mut(l).expect("test");
        for row in 3..5 {
            cache.store(row, &garbage, &garbage).expect("test");
        }
    }
    let logits = model.forward(&mut dirty, tokens[2], 2).expect("test");
    assert_eq!(logits.data(), expected[2].data());
}

#[test]
fn test_rewind_discards_later_positions() {
    let ckpt = checkpoint(true);
    let model = Model::from_checkpoint(&ckpt).expect("test");

    let mut reference = model.new_state().expect("test");
    let expected = run(&model, &mut reference, &[1, 5, 3]);

    let mut state = model.new_state().expect("test");
    run(&model, &mut state, &[1, 5, 0, 2]);
    assert_eq!(state.len(), 4);

    let logits = model.forward(&mut state, 3, 2).expect("test");
    assert_eq!(logits.data(), expected[2].data());
    assert_eq!(state.len(), 3);
}

#[test]
fn test_states_are_independent() {
    let ckpt = checkpoint(true);
    let model = Model::from_checkpoint(&ckpt).expect("test");
    let mut a = model.new_state().expect("test");
    let mut b = model.new_state().expect("test");

    let la = run(&model, &mut a, &[1, 2]);
    run(&model, &mut b, &[5]);
    let lb = run(&model, &mut b.clone(), &[1, 2]);
    assert_eq!(la[1].data(), lb[1].data());
}

#[test]
fn test_reset_restarts_sequence() {
    let ckpt = checkpoint(true);
    let model = Model::from_checkpoint(&ckpt).expect("test");
    let mut state = model.new_state().expect("test");

    let first = run(&model, &mut state, &[1, 3]);
    state.reset();
    assert!(state.is_empty());
    let second = run(&model, &mut state, &[1, 3]);
    assert_eq!(first[1].data(), second[1].data());
}

#[test]
fn test_decode_state_needs_layers() {
    let config = crate::config::Config {
        n_layers: 0,
        ..tiny_config()
    };
    assert!(DecodeState::new(&config).is_err());
}
