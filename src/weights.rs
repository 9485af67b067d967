//! Model file persistence.
//!
//! Layout: the magic bytes, a little-endian `u64` header length, the
//! bincode-encoded [`ModelMetaData`], then one tensor blob per parameter in
//! [`Layer::params`] order.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::layers::Layer;
use crate::models::{EncoderType, Seq2SeqModel};
use crate::tensor::{ParamStore, WeightTensor};
use crate::vocab::{TokenMap, Vocab};

const MODEL_MAGIC: &[u8; 4] = b"ASQM";

/// Header persisted before the weights; enough to rebuild every tensor shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelMetaData {
    pub hidden_dim: usize,
    pub embedding_dim: usize,
    pub encoder_layer_depth: usize,
    pub decoder_layer_depth: usize,
    pub multi_head_num: usize,
    pub encoder_type: EncoderType,
    pub enable_coverage: bool,
    pub shared_embeddings: bool,
    pub vocab: Vocab,
}

impl ModelMetaData {
    /// Rejects dimension combinations the network cannot be built with.
    pub fn validate(&self) -> Result<()> {
        if self.shared_embeddings && !self.vocab.is_shared() {
            return Err(Error::SharedVocabMismatch {
                src: self.vocab.source_word_size(),
                tgt: self.vocab.target_word_size(),
            });
        }
        if self.hidden_dim == 0 || self.embedding_dim == 0 {
            return Err(Error::Config("hidden and embedding dims must be positive".into()));
        }
        if self.encoder_layer_depth == 0 || self.decoder_layer_depth == 0 {
            return Err(Error::Config("encoder and decoder need at least one layer".into()));
        }
        if self.encoder_type == EncoderType::Transformer {
            if self.embedding_dim != self.hidden_dim {
                return Err(Error::Config(format!(
                    "transformer encoder needs embedding_dim == hidden_dim ({} vs {})",
                    self.embedding_dim, self.hidden_dim
                )));
            }
            if self.multi_head_num == 0 || self.hidden_dim % self.multi_head_num != 0 {
                return Err(Error::Config(format!(
                    "hidden_dim {} is not divisible by {} heads",
                    self.hidden_dim, self.multi_head_num
                )));
            }
        }
        Ok(())
    }
}

/// `<path>.bak`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".bak");
    PathBuf::from(p)
}

/// Writes `model` with the weights held in `store`. An existing file is
/// first copied to `<path>.bak`.
pub fn save_model(path: &Path, model: &Seq2SeqModel, store: &ParamStore) -> Result<()> {
    if path.exists() {
        fs::copy(path, backup_path(path))?;
    }
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let mut w = BufWriter::new(File::create(path)?);
    let header = bincode::serialize(model.meta())?;
    w.write_all(MODEL_MAGIC)?;
    w.write_u64::<LittleEndian>(header.len() as u64)?;
    w.write_all(&header)?;
    model.save(store, &mut w)?;
    w.flush()?;
    info!("saved model to {}", path.display());
    Ok(())
}

/// Reads the header, rebuilds the network shapes in `store`, then fills
/// them from the tensor blobs.
pub fn load_model<R: Rng>(path: &Path, store: &mut ParamStore, rng: &mut R) -> Result<Seq2SeqModel> {
    let mut r = BufReader::new(File::open(path)?);
    let meta = read_header(&mut r)?;
    let model = Seq2SeqModel::build(meta, store, rng)?;
    model.load(store, &mut r)?;
    info!("loaded model from {}", path.display());
    Ok(model)
}

/// Only the header of a model file.
pub fn read_meta(path: &Path) -> Result<ModelMetaData> {
    read_header(&mut BufReader::new(File::open(path)?))
}

fn read_header<R: Read>(r: &mut R) -> Result<ModelMetaData> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MODEL_MAGIC {
        return Err(Error::ModelFormat("bad magic".into()));
    }
    let len = r.read_u64::<LittleEndian>()? as usize;
    let mut header = vec![0u8; len];
    r.read_exact(&mut header)?;
    Ok(bincode::deserialize(&header)?)
}

/// Copies pretrained vectors (`token v1 .. vd` per line) into the rows of
/// `table` for tokens present in `map`. Returns the number of rows set.
pub fn load_pretrained_embeddings(path: &Path, map: &TokenMap, table: &mut WeightTensor) -> Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    let mut loaded = 0;
    for line in reader.lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        let Some(token) = parts.next() else {
            continue;
        };
        let values: Vec<f32> = parts.filter_map(|v| v.parse().ok()).collect();
        if values.len() < 2 && loaded == 0 && token.parse::<usize>().is_ok() {
            // word2vec-style `count dim` header
            continue;
        }
        if values.len() != table.cols() {
            return Err(Error::EmbeddingSizeMismatch {
                pretrained: values.len(),
                expected: table.cols(),
            });
        }
        if map.contains(token) {
            table.set_weight_at_row(map.index(token), &values);
            loaded += 1;
        }
    }
    if loaded == 0 {
        warn!("no pretrained vectors in {} matched the vocabulary", path.display());
    } else {
        info!("loaded {loaded} pretrained vectors from {}", path.display());
    }
    Ok(loaded)
}
