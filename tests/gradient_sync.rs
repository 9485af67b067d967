use attnseq::data::{SntPair, SntPairBatch};
use attnseq::models::EncoderType;
use attnseq::tensor::ParamStore;
use attnseq::vocab::{TokenMap, Vocab};
use attnseq::{Options, Seq2Seq};

const WORDS: [&str; 8] = ["ich", "bin", "ein", "hund", "i", "am", "a", "dog"];

fn vocab() -> Vocab {
    Vocab::new(TokenMap::from_tokens(WORDS), TokenMap::from_tokens(WORDS))
}

fn options(devices: Vec<usize>, replicate_embeddings: bool, encoder_type: EncoderType) -> Options {
    Options {
        device_ids: devices,
        replicate_embeddings,
        encoder_type,
        hidden_dim: 8,
        embedding_dim: 8,
        multi_head_num: 2,
        enable_coverage: true,
        seed: Some(7),
        ..Options::default()
    }
}

fn batches() -> Vec<SntPairBatch> {
    let pair = |s: &str, t: &str| SntPair::from_lines(s, t, true);
    vec![
        SntPairBatch::new(vec![pair("ich bin", "i am"), pair("ein hund", "a dog")]),
        SntPairBatch::new(vec![pair("ich bin ein hund", "i am a dog")]),
        SntPairBatch::new(vec![pair("hund", "dog dog"), pair("ein", "a"), pair("bin", "am")]),
    ]
}

fn assert_gradients_close(a: &ParamStore, b: &ParamStore) {
    let (ta, tb): (Vec<_>, Vec<_>) = (a.tensors().collect(), b.tensors().collect());
    assert_eq!(ta.len(), tb.len());
    for (x, y) in ta.iter().zip(&tb) {
        assert_eq!(x.name, y.name);
        for (p, q) in x.gradient.data.iter().zip(&y.gradient.data) {
            assert!((p - q).abs() <= 1e-5 * (1.0 + q.abs()), "{}: {p} vs {q}", x.name);
        }
    }
}

fn check(devices: usize, replicate_embeddings: bool, encoder_type: EncoderType) {
    let batches = &batches()[..devices];

    let mut multi = Seq2Seq::new(
        options((0..devices).collect(), replicate_embeddings, encoder_type),
        vocab(),
    )
    .unwrap();
    let multi_totals = multi.compute_gradients(batches).unwrap();

    // the single-device engine leaves gradients in place between calls, so
    // feeding the batches one by one sums them in the same device order
    let mut single = Seq2Seq::new(options(vec![0], true, encoder_type), vocab()).unwrap();
    let mut tokens = 0;
    for b in batches {
        tokens += single.compute_gradients(std::slice::from_ref(b)).unwrap().tokens;
    }

    assert_eq!(multi_totals.tokens, tokens);
    assert_eq!(multi_totals.sentences, batches.iter().map(|b| b.batch_size()).sum::<usize>());
    assert_gradients_close(&multi.stores()[0], &single.stores()[0]);
    assert!(multi.stores()[0]
        .tensors()
        .any(|t| t.gradient.data.iter().any(|v| *v != 0.0)));
}

#[test]
fn two_devices_sum_to_sequential_gradients() {
    check(2, true, EncoderType::BiLstm);
}

#[test]
fn three_devices_sum_to_sequential_gradients() {
    check(3, true, EncoderType::BiLstm);
}

#[test]
fn aliased_embeddings_reach_the_owner() {
    check(3, false, EncoderType::BiLstm);
}

#[test]
fn transformer_encoder_gradients_sync() {
    check(2, true, EncoderType::Transformer);
}

#[test]
fn update_keeps_replicas_consistent() {
    let mut engine = Seq2Seq::new(options(vec![0, 1], true, EncoderType::BiLstm), vocab()).unwrap();
    let before: Vec<f32> = engine.stores()[0].tensors().flat_map(|t| t.weight.data.clone()).collect();
    let totals = engine.train_step(&batches()[..2], 0.01).unwrap();
    assert_eq!(engine.weights_update_count(), 1);
    assert!(totals.cost_per_word().is_finite());

    let after: Vec<f32> = engine.stores()[0].tensors().flat_map(|t| t.weight.data.clone()).collect();
    assert_ne!(before, after);
    for store in engine.stores() {
        assert!(store.tensors().all(|t| t.gradient.data.iter().all(|v| *v == 0.0)));
    }

    // a partial step leaves the second device idle
    engine.train_step(&batches()[..1], 0.01).unwrap();
    assert_eq!(engine.weights_update_count(), 2);
    assert!(engine.train_step(&batches(), 0.01).is_err());
}

#[test]
fn failing_device_aborts_the_whole_step() {
    let mut engine = Seq2Seq::new(options(vec![0, 1, 2], true, EncoderType::BiLstm), vocab()).unwrap();
    let weights = |e: &Seq2Seq| -> Vec<Vec<f32>> {
        e.stores()
            .iter()
            .map(|s| s.tensors().flat_map(|t| t.weight.data.clone()).collect())
            .collect()
    };
    let before = weights(&engine);

    // device 1 gets an empty batch while devices 0 and 2 run normally
    let mut step = batches();
    step[1] = SntPairBatch::new(Vec::new());
    let err = engine.train_step(&step, 0.01).unwrap_err();
    assert!(matches!(err, attnseq::Error::Device { device: 1, .. }), "{err}");

    assert_eq!(engine.weights_update_count(), 0);
    assert_eq!(weights(&engine), before);
    for store in engine.stores() {
        assert!(store.tensors().all(|t| t.gradient.data.iter().all(|v| *v == 0.0)));
    }

    // the engine is still usable afterwards
    engine.train_step(&batches(), 0.01).unwrap();
    assert_eq!(engine.weights_update_count(), 1);
}
