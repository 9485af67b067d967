use rand::Rng;

use super::decoder::{AttentionDecoder, DecoderState};
use super::encoder::Encoder;
use crate::autograd::{ComputeGraph, NodeId};
use crate::data::{pad_sentences, SntPairBatch};
use crate::error::Result;
use crate::layers::{AttentionPreProcessResult, FeedForwardLayer, Layer};
use crate::tensor::{ParamBuilder, ParamId, ParamStore};
use crate::vocab::{is_reserved, TokenMap, Vocab, BOS, BOS_ID, EOS};
use crate::weights::ModelMetaData;

/// Label treated as "no entity" when scoring tagged tokens. Compared
/// case-insensitively since corpora may be lowercased while streaming.
pub const OUTSIDE_LABEL: &str = "O";

fn is_outside(label: &str) -> bool {
    label.eq_ignore_ascii_case(OUTSIDE_LABEL)
}

/// Token-level tagging counts over every label except [`OUTSIDE_LABEL`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TagScore {
    pub correct: usize,
    pub predicted: usize,
    pub gold: usize,
}

impl TagScore {
    pub fn add(&mut self, other: &TagScore) {
        self.correct += other.correct;
        self.predicted += other.predicted;
        self.gold += other.gold;
    }

    /// Scores one predicted label against the gold one.
    pub fn record(&mut self, predicted: &str, gold: &str) {
        if !is_outside(predicted) {
            self.predicted += 1;
        }
        if !is_outside(gold) {
            self.gold += 1;
            if predicted == gold {
                self.correct += 1;
            }
        }
    }

    pub fn precision(&self) -> f64 {
        ratio(self.correct, self.predicted)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.correct, self.gold)
    }

    pub fn f_score(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

/// Highest scoring label, never one of the reserved tokens.
fn best_label<'v>(cls: &'v TokenMap, row: &[f32]) -> &'v str {
    cls.iter()
        .filter(|(t, _)| !is_reserved(t))
        .max_by(|a, b| row[a.1].total_cmp(&row[b.1]).then(b.1.cmp(&a.1)))
        .map_or(OUTSIDE_LABEL, |(t, _)| t)
}

fn ratio(a: usize, b: usize) -> f64 {
    if b == 0 {
        0.0
    } else {
        a as f64 / b as f64
    }
}

/// Summed cross-entropy of one batch and the number of tokens it was
/// computed over. With a tagging head, tagged source tokens count too.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BatchCost {
    pub cost: f64,
    pub tokens: usize,
    pub tags: TagScore,
}

/// Encoder, attention decoder, embeddings and output projection, plus a
/// per-token tagging head over the encoder output when the vocabulary
/// carries class labels. The tagger is trained jointly with the decoder.
///
/// The model only holds parameter ids; every device evaluates the same
/// value against its own [`ParamStore`].
#[derive(Clone, Debug)]
pub struct Seq2SeqModel {
    meta: ModelMetaData,
    encoder: Encoder,
    decoder: AttentionDecoder,
    src_embedding: ParamId,
    tgt_embedding: ParamId,
    output: FeedForwardLayer,
    tagger: Option<FeedForwardLayer>,
}

impl Seq2SeqModel {
    /// Creates every parameter in `store` with the shapes `meta` describes.
    pub fn build<R: Rng>(meta: ModelMetaData, store: &mut ParamStore, rng: &mut R) -> Result<Self> {
        meta.validate()?;
        let mut b = ParamBuilder::new(store, rng);
        let encoder = Encoder::build(
            &mut b,
            meta.encoder_type,
            meta.embedding_dim,
            meta.hidden_dim,
            meta.encoder_layer_depth,
            meta.multi_head_num,
        );
        let decoder = AttentionDecoder::new(
            &mut b,
            meta.embedding_dim,
            meta.hidden_dim,
            encoder.output_dim(),
            meta.decoder_layer_depth,
            meta.enable_coverage,
        );
        let src_embedding = b.normal("src_embedding", meta.vocab.source_word_size(), meta.embedding_dim);
        let tgt_embedding = if meta.shared_embeddings {
            src_embedding
        } else {
            b.normal("tgt_embedding", meta.vocab.target_word_size(), meta.embedding_dim)
        };
        let output = FeedForwardLayer::new(&mut b, "output", meta.hidden_dim, meta.vocab.target_word_size());
        let tagger = meta
            .vocab
            .cls
            .as_ref()
            .map(|cls| FeedForwardLayer::new(&mut b, "tagger", encoder.output_dim(), cls.len()));
        Ok(Self {
            meta,
            encoder,
            decoder,
            src_embedding,
            tgt_embedding,
            output,
            tagger,
        })
    }

    pub fn meta(&self) -> &ModelMetaData {
        &self.meta
    }

    pub fn vocab(&self) -> &Vocab {
        &self.meta.vocab
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &AttentionDecoder {
        &self.decoder
    }

    pub fn has_tagger(&self) -> bool {
        self.tagger.is_some()
    }

    pub fn src_embedding(&self) -> ParamId {
        self.src_embedding
    }

    pub fn tgt_embedding(&self) -> ParamId {
        self.tgt_embedding
    }

    /// Embedding tables, each listed once.
    pub fn embedding_params(&self) -> Vec<ParamId> {
        if self.src_embedding == self.tgt_embedding {
            vec![self.src_embedding]
        } else {
            vec![self.src_embedding, self.tgt_embedding]
        }
    }

    /// Encodes already padded source sentences. Returns the time-major
    /// encoder output `[src_len * batch, context]`.
    pub fn encode(&self, g: &mut ComputeGraph<'_>, src: &[Vec<String>], dropout: f32) -> NodeId {
        let batch = src.len();
        let src_len = src.first().map_or(0, Vec::len);
        let ids: Vec<usize> = (0..src_len)
            .flat_map(|t| src.iter().map(move |s| self.meta.vocab.src.index(&s[t])))
            .collect();
        let emb = g.lookup(self.src_embedding, &ids);
        self.encoder.encode(g, emb, batch, dropout)
    }

    /// Teacher-forced forward pass over `batch`. Target positions past a
    /// sentence's own length (EOS included) contribute no cost.
    pub fn forward_batch(&self, g: &mut ComputeGraph<'_>, batch: &SntPairBatch, dropout: f32) -> BatchCost {
        let mut src = batch.src_sentences();
        pad_sentences(&mut src, None);
        let mut tgt = batch.tgt_sentences();
        let lens = pad_sentences(&mut tgt, None);
        let size = batch.batch_size();

        let enc = self.encode(g, &src, dropout);
        let mut out = BatchCost::default();
        if let Some(tagger) = &self.tagger {
            let labels: Vec<&[String]> = batch
                .pairs
                .iter()
                .map(|p| &p.tgt[..p.tgt.len().min(p.src.len())])
                .collect();
            out = self.tag_cost(g, tagger, enc, &src, &labels);
        }
        let pre = self.decoder.pre_process(g, enc, size);
        let mut state = self.decoder.reset(g, &pre);

        let tgt_len = tgt.first().map_or(0, Vec::len);
        let mut prev = vec![BOS_ID; size];
        for i in 0..tgt_len {
            let x = g.lookup(self.tgt_embedding, &prev);
            let h = self.decoder.decode(g, x, &pre, &mut state);
            let h = g.dropout(h, dropout);
            let logits = self.output.process(g, h);
            let ids: Vec<usize> = tgt.iter().map(|s| self.meta.vocab.tgt.index(&s[i])).collect();
            let targets: Vec<Option<usize>> = ids
                .iter()
                .zip(&lens)
                .map(|(&id, &len)| (i < len).then_some(id))
                .collect();
            let (_, c) = g.softmax_cross_entropy(logits, &targets);
            out.cost += f64::from(c);
            prev = ids;
        }
        out.tokens += lens.iter().sum::<usize>();
        out
    }

    /// Per-token label cost over the time-major encoder output. Position
    /// `t` of a padded source holds token `t - 1` (position 0 is BOS).
    /// `labels[b]` must not be longer than sentence `b`.
    fn tag_cost(
        &self,
        g: &mut ComputeGraph<'_>,
        tagger: &FeedForwardLayer,
        enc: NodeId,
        src: &[Vec<String>],
        labels: &[&[String]],
    ) -> BatchCost {
        let batch = src.len();
        let src_len = src.first().map_or(0, Vec::len);
        let cls = self.meta.vocab.cls.as_ref();
        let mut targets = vec![None; src_len * batch];
        for (b, sentence) in labels.iter().enumerate() {
            for (i, label) in sentence.iter().enumerate() {
                targets[(i + 1) * batch + b] = cls.map(|c| c.index(label));
            }
        }
        let logits = tagger.process(g, enc);
        let (probs, cost) = g.softmax_cross_entropy(logits, &targets);

        let mut tags = TagScore::default();
        let mut tokens = 0;
        if let Some(cls) = cls {
            let probs = g.value(probs);
            for (row, target) in targets.iter().enumerate() {
                if let Some(gold) = target {
                    tokens += 1;
                    tags.record(best_label(cls, probs.row(row)), cls.token(*gold));
                }
            }
        }
        BatchCost {
            cost: f64::from(cost),
            tokens,
            tags,
        }
    }

    /// Most likely label of every token in `tokens`, or `None` when the
    /// model has no tagging head.
    pub fn tag(&self, g: &mut ComputeGraph<'_>, tokens: &[String]) -> Option<Vec<String>> {
        let tagger = self.tagger.as_ref()?;
        let cls = self.meta.vocab.cls.as_ref()?;
        let mut src = Vec::with_capacity(tokens.len() + 2);
        src.push(BOS.to_string());
        src.extend(tokens.iter().cloned());
        src.push(EOS.to_string());
        let enc = self.encode(g, &[src], 0.0);
        let logits = tagger.process(g, enc);
        let probs = g.softmax(logits);
        let probs = g.value(probs);
        Some(
            (1..=tokens.len())
                .map(|t| best_label(cls, probs.row(t)).to_string())
                .collect(),
        )
    }

    /// Encodes one tokenized source sentence for step-wise decoding.
    pub fn begin_decoding(
        &self,
        g: &mut ComputeGraph<'_>,
        tokens: &[String],
    ) -> (AttentionPreProcessResult, DecoderState) {
        let mut src = Vec::with_capacity(tokens.len() + 2);
        src.push(BOS.to_string());
        src.extend(tokens.iter().cloned());
        src.push(EOS.to_string());
        let enc = self.encode(g, &[src], 0.0);
        let pre = self.decoder.pre_process(g, enc, 1);
        let state = self.decoder.reset(g, &pre);
        (pre, state)
    }

    /// Feeds `last` through one decoder step from `state` and returns the
    /// output distribution over the target vocabulary with the new state.
    pub fn decode_step(
        &self,
        g: &mut ComputeGraph<'_>,
        last: usize,
        pre: &AttentionPreProcessResult,
        state: &DecoderState,
    ) -> (Vec<f32>, DecoderState) {
        let mut next = state.clone();
        let x = g.lookup(self.tgt_embedding, &[last]);
        let h = self.decoder.decode(g, x, pre, &mut next);
        let logits = self.output.process(g, h);
        let probs = g.softmax(logits);
        (g.value(probs).row(0).to_vec(), next)
    }
}

impl Layer for Seq2SeqModel {
    /// Encoder, decoder, source embedding, target embedding (absent when
    /// shared), the output layer and the tagger if present.
    fn params(&self) -> Vec<ParamId> {
        let mut p = self.encoder.params();
        p.extend(self.decoder.params());
        p.extend(self.embedding_params());
        p.extend(self.output.params());
        if let Some(tagger) = &self.tagger {
            p.extend(tagger.params());
        }
        p
    }
}
