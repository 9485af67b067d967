use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the training engine, the corpus reader and model persistence.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or inconsistent options; raised before any training step.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("shared embeddings require identical source and target vocabularies ({src} vs {tgt} tokens)")]
    SharedVocabMismatch { src: usize, tgt: usize },

    #[error("inconsistent embedding size: pretrained vectors have {pretrained} dims, embedding matrix has {expected}")]
    EmbeddingSizeMismatch { pretrained: usize, expected: usize },

    #[error("corpus files '{}' and '{}' have a different number of lines", src.display(), tgt.display())]
    MismatchedCorpus { src: PathBuf, tgt: PathBuf },

    #[error("malformed line {line} in '{}': expected `token label`", path.display())]
    MalformedLine { path: PathBuf, line: usize },

    #[error("no corpus files matching '*.{lang}.snt' in '{}'", dir.display())]
    EmptyCorpus { dir: PathBuf, lang: String },

    /// Failure inside one device's forward/backward pass. Aborts the macro-step.
    #[error("device {device} failed: {message}")]
    Device { device: usize, message: String },

    #[error("backward requested on a graph built without gradient tracking")]
    InferenceGraph,

    #[error("invalid model file: {0}")]
    ModelFormat(String),

    #[error("tensor '{name}' has shape {expected:?} but the model file stores {found:?}")]
    ShapeMismatch {
        name: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
