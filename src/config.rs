use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::data::CorpusOptions;
use crate::error::{Error, Result};
use crate::models::EncoderType;
use crate::optim::{LrScheduleConfig, OptimizerKind, OptimizerParams};

/// Layout of the training corpus.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorpusFormat {
    /// `*.{src}.snt` / `*.{tgt}.snt` file pairs in a directory.
    #[default]
    Parallel,
    /// One `token label` file, sentences separated by blank lines.
    Labeling,
}

/// Options of a training or decoding run, loaded from a TOML or JSON file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Options {
    pub model_path: PathBuf,

    pub train_corpus_path: Option<PathBuf>,
    pub valid_corpus_path: Option<PathBuf>,
    pub corpus_format: CorpusFormat,
    pub src_lang: String,
    pub tgt_lang: String,
    pub shuffle_block_size: usize,
    pub lowercase: bool,
    pub temp_dir: Option<PathBuf>,

    pub src_vocab_size: usize,
    pub tgt_vocab_size: usize,
    pub min_token_freq: usize,
    pub src_embedding_path: Option<PathBuf>,
    pub tgt_embedding_path: Option<PathBuf>,
    pub shared_embeddings: bool,
    /// Keep a copy of the embedding tables on every device. When false the
    /// non-default devices read and update the default device's copy.
    pub replicate_embeddings: bool,

    pub encoder_type: EncoderType,
    pub hidden_dim: usize,
    pub embedding_dim: usize,
    pub encoder_layer_depth: usize,
    pub decoder_layer_depth: usize,
    pub multi_head_num: usize,
    pub enable_coverage: bool,

    pub batch_size: usize,
    pub max_epochs: usize,
    pub max_src_length: usize,
    /// 0 disables the target length filter.
    pub max_tgt_length: usize,
    pub device_ids: Vec<usize>,
    pub dropout: f32,

    pub optimizer: OptimizerKind,
    pub grad_clip: f32,
    pub regc: f32,
    pub eps: f32,
    pub rmsprop_decay: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub start_learning_rate: f32,
    pub warmup_steps: usize,
    pub lr_schedule: LrScheduleConfig,

    pub progress_interval: usize,
    pub checkpoint_interval: usize,

    pub beam_size: usize,
    pub max_decode_length: usize,
    /// Divide hypothesis scores by `len^alpha` when ranking. Off by default.
    pub length_penalty: Option<f32>,
    pub input_test_file: Option<PathBuf>,
    pub output_test_file: Option<PathBuf>,
    pub vocab_dump_path: Option<PathBuf>,

    pub seed: Option<u64>,
    pub log_dir: Option<String>,
    pub experiment: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        let p = OptimizerParams::default();
        Self {
            model_path: PathBuf::from("model.bin"),
            train_corpus_path: None,
            valid_corpus_path: None,
            corpus_format: CorpusFormat::Parallel,
            src_lang: "src".into(),
            tgt_lang: "tgt".into(),
            shuffle_block_size: 1_000_000,
            lowercase: true,
            temp_dir: None,
            src_vocab_size: 45_000,
            tgt_vocab_size: 45_000,
            min_token_freq: 1,
            src_embedding_path: None,
            tgt_embedding_path: None,
            shared_embeddings: false,
            replicate_embeddings: true,
            encoder_type: EncoderType::BiLstm,
            hidden_dim: 200,
            embedding_dim: 128,
            encoder_layer_depth: 1,
            decoder_layer_depth: 1,
            multi_head_num: 8,
            enable_coverage: false,
            batch_size: 1,
            max_epochs: 100,
            max_src_length: 32,
            max_tgt_length: 0,
            device_ids: vec![0],
            dropout: 0.0,
            optimizer: OptimizerKind::RmsProp,
            grad_clip: p.clip,
            regc: p.regc,
            eps: p.eps,
            rmsprop_decay: p.rmsprop_decay,
            beta1: p.beta1,
            beta2: p.beta2,
            start_learning_rate: 0.001,
            warmup_steps: 8000,
            lr_schedule: LrScheduleConfig::WarmupDecay,
            progress_interval: 100,
            checkpoint_interval: 1000,
            beam_size: 1,
            max_decode_length: 100,
            length_penalty: None,
            input_test_file: None,
            output_test_file: None,
            vocab_dump_path: None,
            seed: None,
            log_dir: None,
            experiment: None,
        }
    }
}

impl Options {
    /// Loads options from `path`, JSON when the extension is `.json`, TOML
    /// otherwise, and validates them.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let opts: Options = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));
        if self.batch_size == 0 {
            return fail("batch_size must be positive".into());
        }
        if self.device_ids.is_empty() {
            return fail("device_ids must name at least one device".into());
        }
        let mut ids = self.device_ids.clone();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.device_ids.len() {
            return fail(format!("duplicate entries in device_ids {:?}", self.device_ids));
        }
        if self.beam_size == 0 {
            return fail("beam_size must be at least 1".into());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return fail(format!("dropout {} outside [0, 1)", self.dropout));
        }
        if self.grad_clip <= 0.0 {
            return fail("grad_clip must be positive".into());
        }
        if self.encoder_type == EncoderType::Transformer {
            if self.embedding_dim != self.hidden_dim {
                return fail(format!(
                    "transformer encoder needs embedding_dim == hidden_dim ({} vs {})",
                    self.embedding_dim, self.hidden_dim
                ));
            }
            if self.multi_head_num == 0 || self.hidden_dim % self.multi_head_num != 0 {
                return fail(format!(
                    "hidden_dim {} is not divisible by multi_head_num {}",
                    self.hidden_dim, self.multi_head_num
                ));
            }
        }
        Ok(())
    }

    pub fn corpus_options(&self) -> CorpusOptions {
        CorpusOptions {
            batch_size: self.batch_size,
            shuffle_block_size: self.shuffle_block_size,
            max_src_length: self.max_src_length,
            max_tgt_length: self.max_tgt_length,
            lowercase: self.lowercase,
            seed: self.seed,
            temp_dir: self.temp_dir.clone(),
        }
    }

    pub fn optimizer_params(&self) -> OptimizerParams {
        OptimizerParams {
            clip: self.grad_clip,
            regc: self.regc,
            eps: self.eps,
            rmsprop_decay: self.rmsprop_decay,
            beta1: self.beta1,
            beta2: self.beta2,
        }
    }
}
