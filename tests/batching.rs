use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use attnseq::data::{pad_sentences, Corpus, CorpusOptions, SntPairBatch};
use attnseq::Error;

fn write_corpus(dir: &Path, name: &str, pairs: &[(String, String)]) -> (PathBuf, PathBuf) {
    let src = dir.join(format!("{name}.src.snt"));
    let tgt = dir.join(format!("{name}.tgt.snt"));
    let (s, t): (Vec<_>, Vec<_>) = pairs.iter().cloned().unzip();
    fs::write(&src, s.join("\n") + "\n").unwrap();
    fs::write(&tgt, t.join("\n") + "\n").unwrap();
    (src, tgt)
}

fn sentence(prefix: &str, len: usize) -> String {
    (0..len).map(|i| format!("{prefix}{i}")).collect::<Vec<_>>().join(" ")
}

fn opts(batch_size: usize, seed: u64) -> CorpusOptions {
    CorpusOptions {
        batch_size,
        max_src_length: 50,
        seed: Some(seed),
        ..CorpusOptions::default()
    }
}

fn collect(corpus: &mut Corpus) -> Vec<SntPairBatch> {
    corpus.batches().unwrap().map(|b| b.unwrap()).collect()
}

#[test]
fn four_pairs_make_two_homogeneous_batches() {
    let dir = tempfile::tempdir().unwrap();
    let pairs: Vec<(String, String)> = [3, 3, 5, 5]
        .iter()
        .enumerate()
        .map(|(i, &n)| (sentence(&format!("s{i}_"), n), sentence(&format!("t{i}_"), n)))
        .collect();
    let files = write_corpus(dir.path(), "train", &pairs);
    let mut corpus = Corpus::from_files(vec![files], opts(2, 7));

    let batches = collect(&mut corpus);
    assert_eq!(batches.len(), 2);
    let mut seen: Vec<String> = Vec::new();
    for b in &batches {
        assert_eq!(b.batch_size(), 2);
        let mut src = b.src_sentences();
        let lens = pad_sentences(&mut src, None);
        assert_eq!(lens[0], lens[1]);
        seen.extend(b.pairs.iter().map(|p| p.src.join(" ")));
    }
    seen.sort();
    let mut expected: Vec<String> = pairs.into_iter().map(|p| p.0).collect();
    expected.sort();
    assert_eq!(seen, expected);
}

#[test]
fn every_retained_pair_appears_once_per_pass() {
    let dir = tempfile::tempdir().unwrap();
    let pairs: Vec<(String, String)> = (0..200)
        .map(|i| (sentence(&format!("a{i}_"), 1 + i % 9), sentence(&format!("b{i}_"), 1 + i % 4)))
        .collect();
    let files = write_corpus(dir.path(), "train", &pairs);
    let mut corpus = Corpus::from_files(
        vec![files],
        CorpusOptions {
            max_src_length: 7,
            shuffle_block_size: 64,
            ..opts(8, 3)
        },
    );

    for _pass in 0..2 {
        let batches = collect(&mut corpus);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for b in &batches {
            assert!(b.batch_size() >= 1 && b.batch_size() <= 8);
            let len = b.pairs[0].src.len();
            assert!(b.pairs.iter().all(|p| p.src.len() == len));
            for p in &b.pairs {
                *counts.entry(p.src.join(" ")).or_default() += 1;
            }
        }
        let retained = pairs.iter().filter(|p| p.0.split(' ').count() <= 7).count();
        assert_eq!(batches.iter().map(|b| b.batch_size()).sum::<usize>(), retained);
        assert_eq!(corpus.corpus_size(), retained);
        assert!(counts.values().all(|&c| c == 1));
    }
}

#[test]
fn reuse_keeps_prepared_shuffle() {
    let dir = tempfile::tempdir().unwrap();
    let pairs: Vec<(String, String)> = (0..40)
        .map(|i| (sentence(&format!("x{i}_"), 2), sentence("y", 2)))
        .collect();
    let files = write_corpus(dir.path(), "train", &pairs);
    let mut corpus = Corpus::from_files(vec![files], opts(4, 11));

    let first = corpus.shuffle(false).unwrap();
    let again = corpus.shuffle(true).unwrap();
    assert_eq!(first, again);
    assert_eq!(first.retained, 40);
    assert_eq!(collect(&mut corpus).len(), 10);
}

#[test]
fn long_and_empty_pairs_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let pairs = vec![
        (sentence("a", 3), sentence("b", 3)),
        (sentence("a", 60), sentence("b", 3)),
        (String::new(), sentence("b", 2)),
        (sentence("c", 2), sentence("d", 2)),
    ];
    let files = write_corpus(dir.path(), "train", &pairs);
    let mut corpus = Corpus::from_files(vec![files], opts(4, 1));
    let stats = corpus.shuffle(false).unwrap();
    assert_eq!(stats.retained, 2);
    assert_eq!(stats.too_long_src, 1);
    assert_eq!(stats.empty, 1);
}

#[test]
fn uneven_files_are_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("bad.src.snt");
    let tgt = dir.path().join("bad.tgt.snt");
    fs::write(&src, "a b\nc d\n").unwrap();
    fs::write(&tgt, "x\n").unwrap();
    let mut corpus = Corpus::from_files(vec![(src, tgt)], opts(2, 1));
    assert!(matches!(corpus.shuffle(false), Err(Error::MismatchedCorpus { .. })));
}

#[test]
fn directory_discovery_pairs_languages() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.en.snt"), "hello world\n").unwrap();
    fs::write(dir.path().join("a.de.snt"), "hallo welt\n").unwrap();
    fs::write(dir.path().join("notes.txt"), "ignored\n").unwrap();
    let corpus = Corpus::from_dir(dir.path(), "en", "de", opts(1, 1)).unwrap();
    assert_eq!(corpus.files(), &[(dir.path().join("a.en.snt"), dir.path().join("a.de.snt"))]);
    assert!(matches!(
        Corpus::from_dir(dir.path(), "fr", "de", opts(1, 1)),
        Err(Error::EmptyCorpus { .. })
    ));
}
