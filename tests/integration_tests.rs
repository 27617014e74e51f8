//! Integration tests for WTA autoencoder training.
//!
//! These tests drive the public API end to end:
//! - Lifetime sparsity holds on the masked code
//! - Forward-only steps are pure, training steps advance the step counter
//! - Dictionary extraction reads the shared decoder weights
//! - Checkpoints reproduce a model exactly
//! - Training is reproducible and lowers the reconstruction loss

use approx::assert_relative_eq;
use fcwta::{
    evaluate, load_checkpoint, load_model, save_checkpoint, train_epoch, ModelConfig,
    OptimizerKind, Session, WtaError, WtaModel,
};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn small_config() -> ModelConfig {
    ModelConfig {
        sparsity: 0.1,
        hidden_units: 2,
        ..ModelConfig::new(4, 20)
    }
}

fn random_batch(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(0.0..1.0))
}

/// Samples drawn from four fixed sparse patterns with random gain.
fn pattern_dataset(rows: usize, seed: u64) -> Array2<f32> {
    let patterns = [
        [1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0],
        [0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0],
    ];
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Array2::zeros((rows, 8));
    for mut row in data.rows_mut() {
        let p = rng.gen_range(0..patterns.len());
        let gain: f32 = rng.gen_range(0.5..1.0);
        for (x, &v) in row.iter_mut().zip(patterns[p].iter()) {
            *x = gain * v;
        }
    }
    data
}

#[test]
fn test_forward_only_twice_is_identical() {
    let mut session = Session::new();
    let model = WtaModel::build(small_config(), &mut session).expect("build model");
    let input = random_batch(20, 4, 1);
    let params_before = session.store().snapshot();

    let first = model.step(&mut session, &input, true).unwrap();
    let second = model.step(&mut session, &input, true).unwrap();

    assert_eq!(first.decoded.dim(), (20, 4));
    assert_eq!(first.decoded, second.decoded);
    assert_eq!(first.loss.to_bits(), second.loss.to_bits());
    assert_eq!(session.store().snapshot(), params_before);
    assert_eq!(session.global_step(), 0);
}

#[test]
fn test_training_step_advances_and_updates() {
    let mut session = Session::new();
    let model = WtaModel::build(small_config(), &mut session).expect("build model");
    let input = random_batch(20, 4, 2);
    let params_before = session.store().snapshot();

    model.step(&mut session, &input, false).unwrap();
    assert_eq!(session.global_step(), 1);

    let params_after = session.store().snapshot();
    let changed = params_before
        .iter()
        .filter(|(name, value)| params_after[name.as_str()] != **value)
        .count();
    assert!(changed > 0, "at least one parameter should change");

    model.step(&mut session, &input, false).unwrap();
    assert_eq!(session.global_step(), 2);
}

#[test]
fn test_shape_violations_rejected() {
    let mut session = Session::new();
    let model = WtaModel::build(small_config(), &mut session).expect("build model");
    let params_before = session.store().snapshot();

    for forward_only in [true, false] {
        let too_many_rows = model.step(&mut session, &random_batch(21, 4, 0), forward_only);
        assert!(matches!(too_many_rows, Err(WtaError::ShapeMismatch { .. })));

        let too_few_cols = model.step(&mut session, &random_batch(20, 3, 0), forward_only);
        assert!(matches!(too_few_cols, Err(WtaError::ShapeMismatch { .. })));
    }

    assert_eq!(session.store().snapshot(), params_before);
    assert_eq!(session.global_step(), 0);
}

#[test]
fn test_invalid_sparsity_rejected_at_build() {
    let mut session = Session::new();
    let config = ModelConfig {
        sparsity: 0.01,
        ..small_config()
    };
    assert!(matches!(
        WtaModel::build(config, &mut session),
        Err(WtaError::InvalidConfig(_))
    ));
}

#[test]
fn test_sparse_code_has_k_winners_per_unit() {
    let mut session = Session::new();
    let config = ModelConfig {
        hidden_units: 6,
        sparsity: 0.25,
        bias_initializer: fcwta::Initializer::Constant { value: 1.0 },
        ..ModelConfig::new(8, 16)
    };
    let model = WtaModel::build(config, &mut session).expect("build model");
    let input = pattern_dataset(16, 7);

    let encoded = model.encode(&session, &input).unwrap();
    let sparse = model.sparse_code(&session, &input).unwrap();
    assert_eq!(sparse.dim(), (16, 6));

    for (unit, column) in sparse.axis_iter(Axis(1)).enumerate() {
        // Positive biases keep every pre-activation above zero.
        assert_eq!(column.iter().filter(|&&v| v != 0.0).count(), model.k());

        let mut sorted: Vec<f32> = encoded.column(unit).to_vec();
        sorted.sort_by(|a, b| b.total_cmp(a));
        let threshold = sorted[model.k() - 1];
        for (sample, &v) in column.iter().enumerate() {
            if v != 0.0 {
                assert_eq!(v, encoded[[sample, unit]]);
                assert!(v >= threshold);
            }
        }
    }
}

#[test]
fn test_tied_dictionary_matches_encoder_weights() {
    let mut session = Session::new();
    let model = WtaModel::build(small_config(), &mut session).expect("build model");
    let dictionary = model.dictionary(&session).unwrap();
    assert_eq!(dictionary.dim(), (2, 4));

    let w_last = session.store().value("FCWTA/encode_W_2").unwrap();
    let decode_b = session.store().value("FCWTA/decode_b").unwrap();
    assert_eq!(w_last.shape(), &[4, 2]);

    for unit in 0..2 {
        for col in 0..4 {
            let expected = 1e15f32 * w_last[[col, unit]] + decode_b[[col]];
            assert_relative_eq!(dictionary[[unit, col]], expected, max_relative = 1e-5);
        }
    }
    assert_eq!(session.global_step(), 0);
}

#[test]
fn test_untied_model_trains() {
    let mut session = Session::new();
    let config = ModelConfig {
        tie_weights: false,
        optimizer: OptimizerKind::Momentum,
        ..small_config()
    };
    let model = WtaModel::build(config, &mut session).expect("build model");
    assert!(session.store().get("FCWTA/decode_W").is_some());

    let w_before = session.store().value("FCWTA/decode_W").unwrap();
    model.step(&mut session, &random_batch(20, 4, 3), false).unwrap();
    assert_ne!(session.store().value("FCWTA/decode_W").unwrap(), w_before);
    assert_eq!(model.dictionary(&session).unwrap().dim(), (2, 4));
}

#[test]
fn test_checkpoint_round_trip() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("model.json");
    let input = random_batch(20, 4, 4);

    let mut session = Session::new();
    let model = WtaModel::build(small_config(), &mut session).expect("build model");
    for _ in 0..5 {
        model.step(&mut session, &input, false).unwrap();
    }
    save_checkpoint(&model, &session, &path).unwrap();

    let checkpoint = load_checkpoint(&path).unwrap();
    assert_eq!(checkpoint.global_step, 5);
    assert_eq!(checkpoint.config, small_config());

    let mut restored_session = Session::new();
    let (_, restored) = load_model(&path, &mut restored_session).unwrap();
    assert_eq!(restored_session.global_step(), 5);

    let expected = model.step(&mut session, &input, true).unwrap();
    let got = restored.step(&mut restored_session, &input, true).unwrap();
    assert_eq!(got.decoded, expected.decoded);
    assert_eq!(got.loss.to_bits(), expected.loss.to_bits());

    // Optimizer slots came back too, so the next update matches.
    let expected = model.step(&mut session, &input, false).unwrap();
    let got = restored.step(&mut restored_session, &input, false).unwrap();
    assert_eq!(got.loss.to_bits(), expected.loss.to_bits());
    assert_eq!(
        restored_session.store().snapshot(),
        session.store().snapshot()
    );
}

#[test]
fn test_training_is_deterministic() {
    let config = ModelConfig {
        hidden_units: 4,
        sparsity: 0.25,
        ..ModelConfig::new(8, 16)
    };
    let data = pattern_dataset(64, 11);

    let run = || {
        let mut session = Session::new();
        let model = WtaModel::build(config.clone(), &mut session).expect("build model");
        let mut rng = StdRng::seed_from_u64(5);
        let mut losses = Vec::new();
        for _ in 0..3 {
            let metrics = train_epoch(&model, &mut session, &data, true, &mut rng).unwrap();
            losses.extend(metrics.batch_losses);
        }
        (losses, session.store().snapshot())
    };

    let (losses_a, params_a) = run();
    let (losses_b, params_b) = run();
    assert_eq!(losses_a, losses_b);
    assert_eq!(params_a, params_b);
}

#[test]
fn test_training_lowers_loss() {
    let mut session = Session::new();
    let config = ModelConfig {
        hidden_units: 8,
        sparsity: 0.25,
        encode_layers: 1,
        ..ModelConfig::new(8, 16)
    };
    let model = WtaModel::build(config, &mut session).expect("build model");
    let data = pattern_dataset(128, 13);
    let mut rng = StdRng::seed_from_u64(17);

    let initial = evaluate(&model, &mut session, &data).unwrap().avg_loss;
    for _ in 0..40 {
        train_epoch(&model, &mut session, &data, true, &mut rng).unwrap();
    }
    let trained = evaluate(&model, &mut session, &data).unwrap().avg_loss;

    assert!(
        trained < initial * 0.9,
        "loss should drop: initial={initial}, trained={trained}"
    );
    assert_eq!(session.global_step(), 40 * 8);
}
