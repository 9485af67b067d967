use std::collections::HashMap;
use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const EOS: &str = "<END>";
pub const BOS: &str = "<START>";
pub const UNK: &str = "<UNK>";

pub const EOS_ID: usize = 0;
pub const BOS_ID: usize = 1;
pub const UNK_ID: usize = 2;

pub fn is_reserved(token: &str) -> bool {
    token == EOS || token == BOS || token == UNK
}

/// Dense token <-> index map with the reserved tokens at fixed positions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenMap {
    stoi: HashMap<String, usize>,
    itos: Vec<String>,
}

impl Default for TokenMap {
    fn default() -> Self {
        let mut map = TokenMap {
            stoi: HashMap::new(),
            itos: Vec::new(),
        };
        for t in [EOS, BOS, UNK] {
            map.insert(t);
        }
        map
    }
}

impl TokenMap {
    /// Reserved tokens followed by `tokens` in order, duplicates skipped.
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut map = TokenMap::default();
        for t in tokens {
            map.insert(t.as_ref());
        }
        map
    }

    /// Keeps the `max_size` most frequent tokens (ties broken alphabetically)
    /// that occur at least `min_freq` times. `max_size == 0` keeps all.
    pub fn from_counts(counts: &HashMap<String, usize>, max_size: usize, min_freq: usize) -> Self {
        let mut entries: Vec<(&String, &usize)> = counts
            .iter()
            .filter(|(t, &c)| c >= min_freq && !is_reserved(t))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        if max_size > 0 {
            entries.truncate(max_size);
        }
        Self::from_tokens(entries.into_iter().map(|(t, _)| t))
    }

    fn insert(&mut self, token: &str) {
        if !self.stoi.contains_key(token) {
            self.stoi.insert(token.to_string(), self.itos.len());
            self.itos.push(token.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.itos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.itos.is_empty()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.stoi.contains_key(token)
    }

    /// Index of `token`, or the UNK index for unknown tokens.
    pub fn index(&self, token: &str) -> usize {
        self.stoi.get(token).copied().unwrap_or(UNK_ID)
    }

    pub fn token(&self, id: usize) -> &str {
        self.itos.get(id).map(String::as_str).unwrap_or(UNK)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.itos.iter().enumerate().map(|(i, t)| (t.as_str(), i))
    }
}

/// Source, target and optional class-label vocabularies. Built once and
/// shared read-only by every device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vocab {
    pub src: TokenMap,
    pub tgt: TokenMap,
    pub cls: Option<TokenMap>,
}

impl Vocab {
    pub fn new(src: TokenMap, tgt: TokenMap) -> Self {
        Self { src, tgt, cls: None }
    }

    /// One map used for both sides.
    pub fn shared(map: TokenMap) -> Self {
        Self::new(map.clone(), map)
    }

    pub fn with_classes<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.cls = Some(TokenMap::from_tokens(labels));
        self
    }

    pub fn source_word_size(&self) -> usize {
        self.src.len()
    }

    pub fn target_word_size(&self) -> usize {
        self.tgt.len()
    }

    pub fn is_shared(&self) -> bool {
        self.src == self.tgt
    }

    pub fn src_indices<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<usize> {
        tokens.iter().map(|t| self.src.index(t.as_ref())).collect()
    }

    pub fn tgt_indices<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<usize> {
        tokens.iter().map(|t| self.tgt.index(t.as_ref())).collect()
    }

    /// Target tokens for `ids`, skipping BOS and stopping at EOS.
    pub fn tgt_tokens(&self, ids: &[usize]) -> Vec<String> {
        ids.iter()
            .skip_while(|&&id| id == BOS_ID)
            .take_while(|&&id| id != EOS_ID)
            .map(|&id| self.tgt.token(id).to_string())
            .collect()
    }

    /// Writes `side<TAB>token<TAB>index` lines.
    pub fn dump<W: Write>(&self, w: &mut W) -> Result<()> {
        let mut sides = vec![("src", &self.src), ("tgt", &self.tgt)];
        if let Some(cls) = &self.cls {
            sides.push(("cls", cls));
        }
        for (side, map) in sides {
            for (token, idx) in map.iter() {
                writeln!(w, "{side}\t{token}\t{idx}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_tokens_come_first() {
        let map = TokenMap::from_tokens(["a", "b", "a"]);
        assert_eq!(map.index(EOS), EOS_ID);
        assert_eq!(map.index(BOS), BOS_ID);
        assert_eq!(map.index(UNK), UNK_ID);
        assert_eq!(map.len(), 5);
        assert_eq!(map.index("zzz"), UNK_ID);
    }

    #[test]
    fn counts_are_ranked_and_cut() {
        let counts: HashMap<String, usize> = [("x", 5), ("y", 9), ("z", 1), ("w", 5)]
            .into_iter()
            .map(|(t, c)| (t.to_string(), c))
            .collect();
        let map = TokenMap::from_counts(&counts, 3, 2);
        assert_eq!(map.token(3), "y");
        assert_eq!(map.token(4), "w");
        assert_eq!(map.token(5), "x");
        assert!(!map.contains("z"));
    }

    #[test]
    fn target_tokens_strip_markers() {
        let v = Vocab::shared(TokenMap::from_tokens(["hi", "there"]));
        let ids = vec![BOS_ID, 3, 4, EOS_ID, 3];
        assert_eq!(v.tgt_tokens(&ids), vec!["hi", "there"]);
        assert!(v.is_shared());
    }

    #[test]
    fn dump_lists_every_side() {
        let v = Vocab::new(TokenMap::from_tokens(["a"]), TokenMap::from_tokens(["b"])).with_classes(["B-PER", "O"]);
        let mut out = Vec::new();
        v.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("src\ta\t3\n"));
        assert!(text.contains("tgt\tb\t3\n"));
        assert!(text.contains("cls\tO\t4\n"));
        assert_eq!(text.lines().count(), 4 + 4 + 5);
    }
}
