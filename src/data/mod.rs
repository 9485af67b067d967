pub mod batch;
pub mod corpus;
pub mod labeling;

pub use batch::{pad_sentences, SntPair, SntPairBatch};
pub use corpus::{BatchIter, Corpus, CorpusOptions, ShuffleStats};
