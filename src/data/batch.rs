use crate::vocab::{BOS, EOS};

/// One source/target sentence pair, whitespace tokenized.
#[derive(Clone, Debug, PartialEq)]
pub struct SntPair {
    pub src: Vec<String>,
    pub tgt: Vec<String>,
}

impl SntPair {
    pub fn from_lines(src: &str, tgt: &str, lowercase: bool) -> Self {
        Self {
            src: tokenize(src, lowercase),
            tgt: tokenize(tgt, lowercase),
        }
    }
}

pub(crate) fn tokenize(line: &str, lowercase: bool) -> Vec<String> {
    let line = line.trim();
    let line = if lowercase {
        line.to_lowercase()
    } else {
        line.to_string()
    };
    line.split_whitespace().map(str::to_string).collect()
}

/// Pairs consumed together by one device in one training step.
#[derive(Clone, Debug, Default)]
pub struct SntPairBatch {
    pub pairs: Vec<SntPair>,
}

impl SntPairBatch {
    pub fn new(pairs: Vec<SntPair>) -> Self {
        Self { pairs }
    }

    pub fn batch_size(&self) -> usize {
        self.pairs.len()
    }

    /// Source sentences wrapped as `BOS tokens EOS`.
    pub fn src_sentences(&self) -> Vec<Vec<String>> {
        self.pairs
            .iter()
            .map(|p| {
                let mut s = Vec::with_capacity(p.src.len() + 2);
                s.push(BOS.to_string());
                s.extend(p.src.iter().cloned());
                s.push(EOS.to_string());
                s
            })
            .collect()
    }

    /// Target sentences terminated by EOS.
    pub fn tgt_sentences(&self) -> Vec<Vec<String>> {
        self.pairs
            .iter()
            .map(|p| {
                let mut s = p.tgt.clone();
                s.push(EOS.to_string());
                s
            })
            .collect()
    }

    pub fn src_token_count(&self) -> usize {
        self.pairs.iter().map(|p| p.src.len()).sum()
    }

    pub fn tgt_token_count(&self) -> usize {
        self.pairs.iter().map(|p| p.tgt.len()).sum()
    }
}

/// Pads every sentence with EOS up to the longest one (or `max_len` when
/// that is longer) and returns the lengths before padding.
pub fn pad_sentences(sentences: &mut [Vec<String>], max_len: Option<usize>) -> Vec<usize> {
    let longest = sentences.iter().map(Vec::len).max().unwrap_or(0);
    let target = max_len.unwrap_or(longest).max(longest);
    sentences
        .iter_mut()
        .map(|s| {
            let len = s.len();
            s.resize(target, EOS.to_string());
            len
        })
        .collect()
}
