use std::fs;

use attnseq::rng::rng_from_seed;
use attnseq::tensor::ParamStore;
use attnseq::vocab::{TokenMap, Vocab};
use attnseq::weights::{backup_path, load_model, read_meta};
use attnseq::{Error, Options, Seq2Seq};

fn engine(model_path: std::path::PathBuf, seed: u64) -> Seq2Seq {
    let vocab = Vocab::shared(TokenMap::from_tokens(["x", "y", "z"]));
    let opts = Options {
        model_path,
        hidden_dim: 6,
        embedding_dim: 4,
        decoder_layer_depth: 2,
        shared_embeddings: true,
        enable_coverage: true,
        seed: Some(seed),
        ..Options::default()
    };
    Seq2Seq::new(opts, vocab).unwrap()
}

#[test]
fn save_then_load_restores_weights_and_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("model.bin");
    let saved = engine(path.clone(), 1);
    saved.save().unwrap();

    let mut store = ParamStore::new(0);
    let mut rng = rng_from_seed(Some(99));
    let model = load_model(&path, &mut store, &mut rng).unwrap();
    assert_eq!(model.meta(), saved.model().meta());
    assert_eq!(model.src_embedding(), model.tgt_embedding());

    let original: Vec<_> = saved.stores()[0].tensors().collect();
    let loaded: Vec<_> = store.tensors().collect();
    assert_eq!(original.len(), loaded.len());
    for (a, b) in original.iter().zip(&loaded) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.weight, b.weight);
    }

    let reloaded = Seq2Seq::load(saved.options().clone()).unwrap();
    assert_eq!(reloaded.stores()[0].tensors().count(), original.len());
    assert_eq!(read_meta(&path).unwrap(), *saved.model().meta());
}

#[test]
fn overwriting_keeps_a_backup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.bin");
    engine(path.clone(), 1).save().unwrap();
    let first = fs::read(&path).unwrap();
    assert!(!backup_path(&path).exists());

    engine(path.clone(), 2).save().unwrap();
    assert_eq!(fs::read(backup_path(&path)).unwrap(), first);
    assert_ne!(fs::read(&path).unwrap(), first);
}

#[test]
fn foreign_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.bin");
    fs::write(&path, b"not a model file at all").unwrap();
    let mut store = ParamStore::new(0);
    let mut rng = rng_from_seed(Some(0));
    assert!(matches!(load_model(&path, &mut store, &mut rng), Err(Error::ModelFormat(_))));
}

#[test]
fn truncated_weights_fail_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.bin");
    engine(path.clone(), 3).save().unwrap();
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 16]).unwrap();
    let mut store = ParamStore::new(0);
    let mut rng = rng_from_seed(Some(0));
    assert!(load_model(&path, &mut store, &mut rng).is_err());
}
