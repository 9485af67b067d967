use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use attnseq::data::{Corpus, CorpusOptions};
use attnseq::logging::{EvaluationEvent, ProgressEvent, TrainingObserver};
use attnseq::models::EncoderType;
use attnseq::{Options, Seq2Seq};

#[derive(Default)]
struct Recorded {
    epochs: Vec<(usize, f64)>,
    updates: Vec<usize>,
    evaluations: Vec<String>,
}

struct Recorder(Arc<Mutex<Recorded>>);

impl TrainingObserver for Recorder {
    fn on_progress(&mut self, event: &ProgressEvent) {
        self.0.lock().unwrap().updates.push(event.update);
    }

    fn on_evaluation(&mut self, event: &EvaluationEvent) {
        self.0.lock().unwrap().evaluations.push(event.title.clone());
    }

    fn on_epoch_end(&mut self, epoch: usize, avg_cost: f64) {
        self.0.lock().unwrap().epochs.push((epoch, avg_cost));
    }
}

const PAIRS: [(&str, &str); 8] = [
    ("das haus", "the house"),
    ("das auto", "the car"),
    ("ein haus", "a house"),
    ("ein auto", "a car"),
    ("das haus ist gross", "the house is big"),
    ("das auto ist klein", "the car is small"),
    ("ein haus ist klein", "a house is small"),
    ("ein auto ist gross", "a car is big"),
];

fn write_corpus(dir: &Path) {
    let (src, tgt): (Vec<&str>, Vec<&str>) = PAIRS.iter().cloned().unzip();
    fs::write(dir.join("train.de.snt"), src.join("\n") + "\n").unwrap();
    fs::write(dir.join("train.en.snt"), tgt.join("\n") + "\n").unwrap();
}

fn options(root: &Path, encoder_type: EncoderType) -> Options {
    Options {
        model_path: root.join("out").join("model.bin"),
        src_lang: "de".into(),
        tgt_lang: "en".into(),
        encoder_type,
        hidden_dim: 8,
        embedding_dim: 8,
        multi_head_num: 2,
        enable_coverage: true,
        batch_size: 2,
        max_epochs: 3,
        device_ids: vec![0, 1],
        optimizer: attnseq::optim::OptimizerKind::Adam,
        start_learning_rate: 0.01,
        warmup_steps: 2,
        progress_interval: 1,
        checkpoint_interval: 2,
        beam_size: 2,
        max_decode_length: 6,
        seed: Some(5),
        temp_dir: Some(root.to_path_buf()),
        ..Options::default()
    }
}

fn run(encoder_type: EncoderType) {
    let dir = tempfile::tempdir().unwrap();
    let corpus_dir = dir.path().join("corpus");
    fs::create_dir(&corpus_dir).unwrap();
    write_corpus(&corpus_dir);
    let opts = options(dir.path(), encoder_type);

    let mut train = Corpus::from_dir(&corpus_dir, "de", "en", opts.corpus_options()).unwrap();
    let mut valid = Corpus::from_dir(&corpus_dir, "de", "en", opts.corpus_options()).unwrap();
    let vocab = train.build_vocab(0, 0, 1, false).unwrap();
    assert_eq!(vocab.source_word_size(), 3 + 7);

    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let mut engine = Seq2Seq::new(opts.clone(), vocab).unwrap();
    engine.add_observer(Box::new(Recorder(recorded.clone())));
    engine.train(&mut train, Some(&mut valid)).unwrap();

    // 4 batches of 2 on 2 devices: two updates per epoch
    assert_eq!(engine.weights_update_count(), 6);
    assert!(opts.model_path.exists());
    {
        let r = recorded.lock().unwrap();
        assert_eq!(r.epochs.len(), 3);
        assert!(r.epochs.iter().all(|(_, c)| c.is_finite() && *c > 0.0));
        assert_eq!(r.updates, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(r.evaluations.iter().filter(|t| *t == "Validation").count(), 3);
    }

    let input = dir.path().join("test.de");
    let output = dir.path().join("test.en");
    fs::write(&input, "das haus\nein auto ist gross\nunbekannt\n").unwrap();
    let reloaded = Seq2Seq::load(opts).unwrap();
    assert_eq!(reloaded.decode_file(&input, &output).unwrap(), 3);
    let decoded = fs::read_to_string(&output).unwrap();
    assert_eq!(decoded.lines().count(), 3);
    assert!(decoded.lines().all(|l| l.split_whitespace().count() <= 6));
}

#[test]
fn bilstm_trains_and_decodes_on_two_devices() {
    run(EncoderType::BiLstm);
}

#[test]
fn transformer_trains_and_decodes_on_two_devices() {
    run(EncoderType::Transformer);
}

#[test]
fn labeling_corpus_batches_like_parallel_text() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ner.txt");
    fs::write(&path, "John B-PER\nlives O\nhere O\n\nParis B-LOC\n\nBerlin B-LOC\n").unwrap();
    let mut corpus = Corpus::from_labeling_file(
        &path,
        CorpusOptions {
            batch_size: 4,
            seed: Some(1),
            ..CorpusOptions::default()
        },
    )
    .unwrap();
    let batches: Vec<_> = corpus.batches().unwrap().map(|b| b.unwrap()).collect();
    assert_eq!(batches.iter().map(|b| b.batch_size()).sum::<usize>(), 3);
    for b in &batches {
        assert!(b.pairs.iter().all(|p| p.src.len() == p.tgt.len()));
    }
}

#[test]
fn failed_checkpoint_is_reported_and_training_continues() {
    let dir = tempfile::tempdir().unwrap();
    let corpus_dir = dir.path().join("corpus");
    fs::create_dir(&corpus_dir).unwrap();
    write_corpus(&corpus_dir);
    // the model's parent directory is a regular file, so every save fails
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, "not a directory").unwrap();
    let opts = Options {
        model_path: blocker.join("model.bin"),
        max_epochs: 2,
        ..options(dir.path(), EncoderType::BiLstm)
    };

    let mut train = Corpus::from_dir(&corpus_dir, "de", "en", opts.corpus_options()).unwrap();
    let vocab = train.build_vocab(0, 0, 1, false).unwrap();
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let mut engine = Seq2Seq::new(opts.clone(), vocab).unwrap();
    engine.add_observer(Box::new(Recorder(recorded.clone())));

    engine.train(&mut train, None).unwrap();
    assert_eq!(engine.weights_update_count(), 4);
    assert!(!opts.model_path.exists());
    let r = recorded.lock().unwrap();
    assert_eq!(r.epochs.len(), 2);
    assert!(r.evaluations.iter().any(|t| t == "Checkpoint"));
}

#[test]
fn epoch_checkpoint_follows_previous_epoch_cost() {
    let dir = tempfile::tempdir().unwrap();
    let corpus_dir = dir.path().join("corpus");
    let empty_dir = dir.path().join("empty");
    fs::create_dir(&corpus_dir).unwrap();
    fs::create_dir(&empty_dir).unwrap();
    write_corpus(&corpus_dir);
    fs::write(empty_dir.join("train.de.snt"), "").unwrap();
    fs::write(empty_dir.join("train.en.snt"), "").unwrap();
    let opts = Options {
        checkpoint_interval: 0,
        ..options(dir.path(), EncoderType::BiLstm)
    };

    let mut train = Corpus::from_dir(&corpus_dir, "de", "en", opts.corpus_options()).unwrap();
    let mut empty = Corpus::from_dir(&empty_dir, "de", "en", opts.corpus_options()).unwrap();
    let vocab = train.build_vocab(0, 0, 1, false).unwrap();
    let mut engine = Seq2Seq::new(opts.clone(), vocab).unwrap();

    let first = engine.train_epoch(0, &mut train).unwrap();
    assert!(first.is_finite());
    assert!(opts.model_path.exists());
    fs::remove_file(&opts.model_path).unwrap();

    // an epoch without words has infinite cost and must not be saved
    assert!(engine.train_epoch(1, &mut empty).unwrap().is_infinite());
    assert!(!opts.model_path.exists());

    // any finite cost improves on the epoch right before it
    engine.train_epoch(2, &mut train).unwrap();
    assert!(opts.model_path.exists());
}

#[test]
fn labeling_model_tags_every_token() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ner.txt");
    let text = "john B-PER\nlives O\nhere O\n\nparis B-LOC\nis O\nbig O\n\n\
                anna B-PER\nis O\nhere O\n\nberlin B-LOC\nlives O\n\n";
    fs::write(&path, text).unwrap();
    let opts = Options {
        lowercase: false,
        ..options(dir.path(), EncoderType::BiLstm)
    };

    let mut train = Corpus::from_labeling_file(&path, opts.corpus_options()).unwrap();
    let mut valid = Corpus::from_labeling_file(&path, opts.corpus_options()).unwrap();
    let vocab = train.build_vocab(0, 0, 1, false).unwrap();
    let vocab = vocab.with_classes(["B-PER", "B-LOC", "O"]);
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let mut engine = Seq2Seq::new(opts.clone(), vocab).unwrap();
    assert!(engine.model().has_tagger());
    engine.add_observer(Box::new(Recorder(recorded.clone())));
    engine.train(&mut train, Some(&mut valid)).unwrap();
    {
        let r = recorded.lock().unwrap();
        assert_eq!(r.evaluations.iter().filter(|t| *t == "Tagging").count(), 3);
    }

    let input = dir.path().join("test.txt");
    let output = dir.path().join("test.tags");
    fs::write(&input, "john is here\nparis\n").unwrap();
    let reloaded = Seq2Seq::load(opts).unwrap();
    assert!(reloaded.model().has_tagger());
    assert_eq!(reloaded.decode_file(&input, &output).unwrap(), 2);
    let tagged = fs::read_to_string(&output).unwrap();
    let lens: Vec<usize> = tagged.lines().map(|l| l.split_whitespace().count()).collect();
    assert_eq!(lens, vec![3, 1]);
    assert!(tagged
        .split_whitespace()
        .all(|t| ["B-PER", "B-LOC", "O"].contains(&t)));
}
