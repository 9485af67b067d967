//! Length-bucketed streaming shuffler over parallel corpora.
//!
//! A shuffle pass reads the raw files block by block, groups each block by
//! source length, shuffles inside and across groups and spills the result to
//! temporary files. [`BatchIter`] then streams those files back, cutting a
//! new run of batches whenever the source length changes so that every batch
//! holds sentences of one source length.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Deserialize;
use tempfile::NamedTempFile;

use super::batch::{tokenize, SntPair, SntPairBatch};
use crate::error::{Error, Result};
use crate::rng::rng_from_seed;
use crate::vocab::{TokenMap, Vocab};

/// Accumulated sentences per length run are capped at `batch_size * this`.
const ACCUMULATION_FACTOR: usize = 10_000;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CorpusOptions {
    pub batch_size: usize,
    /// Pairs shuffled together in memory; 0 shuffles the whole corpus at once.
    pub shuffle_block_size: usize,
    pub max_src_length: usize,
    /// 0 disables the target length check.
    pub max_tgt_length: usize,
    pub lowercase: bool,
    pub seed: Option<u64>,
    /// Where shuffled copies are written; the system temp dir by default.
    pub temp_dir: Option<PathBuf>,
}

impl Default for CorpusOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            shuffle_block_size: 1_000_000,
            max_src_length: 32,
            max_tgt_length: 0,
            lowercase: true,
            seed: None,
            temp_dir: None,
        }
    }
}

#[derive(Clone, Debug)]
struct RawPair {
    src: String,
    tgt: String,
    src_len: usize,
}

/// Statistics of one shuffle pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShuffleStats {
    pub retained: usize,
    pub too_long_src: usize,
    pub too_long_tgt: usize,
    pub empty: usize,
}

/// Shuffled copies of the corpus. The files are removed when this value
/// is dropped.
pub struct ShuffledCorpus {
    src: NamedTempFile,
    tgt: NamedTempFile,
    pub stats: ShuffleStats,
}

pub struct Corpus {
    opts: CorpusOptions,
    files: Vec<(PathBuf, PathBuf)>,
    rng: StdRng,
    shuffled: Option<ShuffledCorpus>,
    corpus_size: usize,
    // converted inputs (sequence labeling) that must outlive the corpus
    _owned_inputs: Vec<NamedTempFile>,
}

impl Corpus {
    pub fn from_files(files: Vec<(PathBuf, PathBuf)>, opts: CorpusOptions) -> Self {
        let rng = rng_from_seed(opts.seed);
        Self {
            opts,
            files,
            rng,
            shuffled: None,
            corpus_size: 0,
            _owned_inputs: Vec::new(),
        }
    }

    /// Every `*.{src_lang}.snt` file in `dir`, paired with the file of the
    /// same name where `.{src_lang}.` is replaced by `.{tgt_lang}.`.
    pub fn from_dir(dir: &Path, src_lang: &str, tgt_lang: &str, opts: CorpusOptions) -> Result<Self> {
        let suffix = format!(".{src_lang}.snt");
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(&suffix) {
                continue;
            }
            let tgt_name = name.replace(&format!(".{src_lang}."), &format!(".{tgt_lang}."));
            files.push((path.clone(), dir.join(tgt_name)));
        }
        if files.is_empty() {
            return Err(Error::EmptyCorpus {
                dir: dir.to_path_buf(),
                lang: src_lang.to_string(),
            });
        }
        files.sort();
        Ok(Self::from_files(files, opts))
    }

    pub(crate) fn with_owned_inputs(mut self, inputs: Vec<NamedTempFile>) -> Self {
        self._owned_inputs = inputs;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.opts.batch_size
    }

    /// Pairs retained by the most recent shuffle pass.
    pub fn corpus_size(&self) -> usize {
        self.corpus_size
    }

    pub fn files(&self) -> &[(PathBuf, PathBuf)] {
        &self.files
    }

    /// Produces shuffled copies for the next pass. With `reuse_existing`,
    /// copies made by an earlier call that have not been consumed yet are
    /// kept as they are.
    pub fn shuffle(&mut self, reuse_existing: bool) -> Result<ShuffleStats> {
        if reuse_existing {
            if let Some(existing) = &self.shuffled {
                log::info!("Reusing shuffled corpus ({} pairs)", existing.stats.retained);
                return Ok(existing.stats);
            }
        }
        let shuffled = self.shuffle_all()?;
        let stats = shuffled.stats;
        self.shuffled = Some(shuffled);
        Ok(stats)
    }

    /// Starts one pass over the corpus. Shuffled copies prepared by
    /// [`Corpus::shuffle`] are consumed, otherwise a fresh shuffle runs.
    pub fn batches(&mut self) -> Result<BatchIter> {
        let shuffled = match self.shuffled.take() {
            Some(s) => s,
            None => self.shuffle_all()?,
        };
        let seed = self.rng.gen();
        BatchIter::new(shuffled, self.opts.batch_size, self.opts.lowercase, seed)
    }

    fn temp_file(&self, suffix: &str) -> Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("shuffled").suffix(suffix);
        let file = match &self.opts.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        Ok(file)
    }

    fn shuffle_all(&mut self) -> Result<ShuffledCorpus> {
        let src_tmp = self.temp_file(".src.snt")?;
        let tgt_tmp = self.temp_file(".tgt.snt")?;
        log::info!("Shuffling corpus from {} file pair(s)", self.files.len());

        let mut src_out = BufWriter::new(src_tmp.as_file());
        let mut tgt_out = BufWriter::new(tgt_tmp.as_file());
        let mut stats = ShuffleStats::default();
        let mut src_dist: BTreeMap<usize, usize> = BTreeMap::new();
        let mut tgt_dist: BTreeMap<usize, usize> = BTreeMap::new();
        let mut block: Vec<RawPair> = Vec::new();

        for (src_path, tgt_path) in &self.files {
            log::debug!("Processing '{}' and '{}'", src_path.display(), tgt_path.display());
            for pair in read_pairs(src_path, tgt_path)? {
                let (src, tgt) = pair?;
                let src_len = src.split_whitespace().count();
                let tgt_len = tgt.split_whitespace().count();
                *src_dist.entry(src_len / 100).or_default() += 1;
                *tgt_dist.entry(tgt_len / 100).or_default() += 1;

                if src_len == 0 || tgt_len == 0 {
                    stats.empty += 1;
                    continue;
                }
                if src_len > self.opts.max_src_length {
                    stats.too_long_src += 1;
                    continue;
                }
                if self.opts.max_tgt_length > 0 && tgt_len > self.opts.max_tgt_length {
                    stats.too_long_tgt += 1;
                    continue;
                }
                block.push(RawPair { src, tgt, src_len });
                stats.retained += 1;

                if self.opts.shuffle_block_size > 0 && block.len() >= self.opts.shuffle_block_size {
                    let full = std::mem::take(&mut block);
                    write_block(shuffle_block(full, &mut self.rng), &mut src_out, &mut tgt_out)?;
                }
            }
        }
        if !block.is_empty() {
            write_block(shuffle_block(block, &mut self.rng), &mut src_out, &mut tgt_out)?;
        }
        src_out.flush()?;
        tgt_out.flush()?;
        drop(src_out);
        drop(tgt_out);

        for (len, count) in &src_dist {
            log::info!("Src length {}~{}: {} sentences", len * 100, len * 100 + 100, count);
        }
        for (len, count) in &tgt_dist {
            log::info!("Tgt length {}~{}: {} sentences", len * 100, len * 100 + 100, count);
        }
        if stats.too_long_src > 0 || stats.too_long_tgt > 0 {
            log::warn!(
                "Dropped {} pairs with source longer than {} and {} with target longer than {}",
                stats.too_long_src,
                self.opts.max_src_length,
                stats.too_long_tgt,
                self.opts.max_tgt_length
            );
        }
        if stats.empty > 0 {
            log::warn!("Skipped {} pairs with an empty side", stats.empty);
        }
        log::info!("Shuffled {} sentence pairs", stats.retained);

        self.corpus_size = stats.retained;
        Ok(ShuffledCorpus {
            src: src_tmp,
            tgt: tgt_tmp,
            stats,
        })
    }

    /// Builds vocabularies from token frequencies over all raw files.
    /// `shared` merges both sides into one map.
    pub fn build_vocab(&self, src_size: usize, tgt_size: usize, min_freq: usize, shared: bool) -> Result<Vocab> {
        let mut src_counts: HashMap<String, usize> = HashMap::new();
        let mut tgt_counts: HashMap<String, usize> = HashMap::new();
        for (src_path, tgt_path) in &self.files {
            for pair in read_pairs(src_path, tgt_path)? {
                let (src, tgt) = pair?;
                for t in tokenize(&src, self.opts.lowercase) {
                    *src_counts.entry(t).or_default() += 1;
                }
                let counts = if shared { &mut src_counts } else { &mut tgt_counts };
                for t in tokenize(&tgt, self.opts.lowercase) {
                    *counts.entry(t).or_default() += 1;
                }
            }
        }
        let vocab = if shared {
            Vocab::shared(TokenMap::from_counts(&src_counts, src_size.max(tgt_size), min_freq))
        } else {
            Vocab::new(
                TokenMap::from_counts(&src_counts, src_size, min_freq),
                TokenMap::from_counts(&tgt_counts, tgt_size, min_freq),
            )
        };
        log::info!(
            "Vocabulary sizes: source {}, target {}",
            vocab.source_word_size(),
            vocab.target_word_size()
        );
        Ok(vocab)
    }
}

/// Line pairs of two parallel files. Running out of lines on one side only
/// is an error.
fn read_pairs(src: &Path, tgt: &Path) -> Result<impl Iterator<Item = Result<(String, String)>>> {
    let mut src_lines = BufReader::new(File::open(src)?).lines();
    let mut tgt_lines = BufReader::new(File::open(tgt)?).lines();
    let (src, tgt) = (src.to_path_buf(), tgt.to_path_buf());
    let mut failed = false;
    Ok(std::iter::from_fn(move || {
        if failed {
            return None;
        }
        let item: Result<(String, String)> = match (src_lines.next(), tgt_lines.next()) {
            (None, None) => return None,
            (Some(Ok(s)), Some(Ok(t))) => Ok((s.trim().to_string(), t.trim().to_string())),
            (Some(Err(e)), _) | (_, Some(Err(e))) => Err(e.into()),
            _ => Err(Error::MismatchedCorpus {
                src: src.clone(),
                tgt: tgt.clone(),
            }),
        };
        failed = item.is_err();
        Some(item)
    }))
}

/// Groups by source length, shuffles every group on its own rayon task,
/// merges groups of equal size and emits the merged groups in random order.
fn shuffle_block(pairs: Vec<RawPair>, rng: &mut StdRng) -> Vec<RawPair> {
    let mut by_len: BTreeMap<usize, Vec<RawPair>> = BTreeMap::new();
    for p in pairs {
        by_len.entry(p.src_len).or_default().push(p);
    }
    let seeded: Vec<(u64, Vec<RawPair>)> = by_len.into_values().map(|b| (rng.gen(), b)).collect();
    let buckets: Vec<Vec<RawPair>> = seeded
        .into_par_iter()
        .map(|(seed, mut bucket)| {
            bucket.shuffle(&mut StdRng::seed_from_u64(seed));
            bucket
        })
        .collect();

    let mut by_size: BTreeMap<usize, Vec<RawPair>> = BTreeMap::new();
    for bucket in buckets {
        by_size.entry(bucket.len()).or_default().extend(bucket);
    }
    let mut groups: Vec<Vec<RawPair>> = by_size.into_values().collect();
    groups.shuffle(rng);
    groups.into_iter().flatten().collect()
}

fn write_block<W: Write>(block: Vec<RawPair>, src: &mut W, tgt: &mut W) -> Result<()> {
    for p in block {
        writeln!(src, "{}", p.src)?;
        writeln!(tgt, "{}", p.tgt)?;
    }
    Ok(())
}

/// One pass over a shuffled corpus. Owns the shuffled files, which are
/// deleted when the iterator is dropped.
pub struct BatchIter {
    src: Lines<BufReader<File>>,
    tgt: Lines<BufReader<File>>,
    files: ShuffledCorpus,
    batch_size: usize,
    cap: usize,
    lowercase: bool,
    rng: StdRng,
    buffer: Vec<SntPair>,
    last_len: Option<usize>,
    ready: VecDeque<SntPairBatch>,
    done: bool,
}

impl BatchIter {
    fn new(files: ShuffledCorpus, batch_size: usize, lowercase: bool, seed: u64) -> Result<Self> {
        let src = BufReader::new(files.src.reopen()?).lines();
        let tgt = BufReader::new(files.tgt.reopen()?).lines();
        let batch_size = batch_size.max(1);
        Ok(Self {
            src,
            tgt,
            files,
            batch_size,
            cap: batch_size * ACCUMULATION_FACTOR,
            lowercase,
            rng: StdRng::seed_from_u64(seed),
            buffer: Vec::new(),
            last_len: None,
            ready: VecDeque::new(),
            done: false,
        })
    }

    pub fn stats(&self) -> ShuffleStats {
        self.files.stats
    }

    fn flush(&mut self) {
        let mut run = std::mem::take(&mut self.buffer);
        run.shuffle(&mut self.rng);
        while !run.is_empty() {
            let rest = run.split_off(self.batch_size.min(run.len()));
            self.ready.push_back(SntPairBatch::new(run));
            run = rest;
        }
    }

    fn read_pair(&mut self) -> Result<Option<SntPair>> {
        match (self.src.next(), self.tgt.next()) {
            (None, None) => Ok(None),
            (Some(s), Some(t)) => Ok(Some(SntPair::from_lines(&s?, &t?, self.lowercase))),
            _ => Err(Error::MismatchedCorpus {
                src: self.files.src.path().to_path_buf(),
                tgt: self.files.tgt.path().to_path_buf(),
            }),
        }
    }
}

impl Iterator for BatchIter {
    type Item = Result<SntPairBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(batch) = self.ready.pop_front() {
                return Some(Ok(batch));
            }
            if self.done {
                return None;
            }
            match self.read_pair() {
                Ok(Some(pair)) => {
                    let len = pair.src.len();
                    if self.last_len.map_or(false, |l| l != len) || self.buffer.len() >= self.cap {
                        self.flush();
                    }
                    self.last_len = Some(len);
                    self.buffer.push(pair);
                }
                Ok(None) => {
                    self.done = true;
                    self.flush();
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
