//! Device-parallel training engine.
//!
//! Each configured device holds a [`ParamStore`] replica; `stores[0]` is the
//! canonical copy. A macro-step takes one batch per device and runs:
//!
//! 1. broadcast canonical weights into every owned replica slot,
//! 2. forward and backward on every device in parallel,
//! 3. land each device's gradients in its own replica (aliased slots go
//!    straight to their owner),
//! 4. sum replica gradients into the canonical store,
//! 5. one optimizer update on the canonical store,
//! 6. clear every gradient.
//!
//! Phases are strictly sequential; only step 2 fans out. Gradient sums are
//! taken in device order, so results are reproducible for a fixed device
//! list.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::autograd::ComputeGraph;
use crate::config::Options;
use crate::data::{Corpus, SntPairBatch};
use crate::decoding::{translate, BeamSearchOptions};
use crate::error::{Error, Result};
use crate::logging::{
    format_checkpoint_saved, format_total_ops, EvaluationEvent, ProgressEvent, Severity, TrainingObserver,
};
use crate::layers::layer::owned_mut;
use crate::math::{matrix_ops_count, reset_matrix_ops};
use crate::models::{BatchCost, Seq2SeqModel, TagScore};
use crate::optim::{LearningRateSchedule, Optimizer};
use crate::rng::rng_from_seed;
use crate::tensor::{Gradients, Ownership, ParamId, ParamStore, ParamView};
use crate::vocab::Vocab;
use crate::weights::{load_model, load_pretrained_embeddings, save_model, ModelMetaData};

/// Decides when an improved cost is worth a checkpoint. The baseline is the
/// previous epoch's average, replaced after every epoch whether or not it
/// improved.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CheckpointGate {
    last_epoch_avg: f64,
}

impl Default for CheckpointGate {
    fn default() -> Self {
        Self {
            last_epoch_avg: f64::MAX,
        }
    }
}

impl CheckpointGate {
    pub fn last_epoch_avg(&self) -> f64 {
        self.last_epoch_avg
    }

    /// Running average of the current epoch beats the previous epoch.
    pub fn mid_epoch(&self, running_avg: f64) -> bool {
        running_avg < self.last_epoch_avg
    }

    /// Closes an epoch. Returns whether `avg` improved on the previous one.
    pub fn end_epoch(&mut self, avg: f64) -> bool {
        let improved = avg < self.last_epoch_avg;
        self.last_epoch_avg = avg;
        improved
    }
}

/// Scalars accumulated by the device tasks of one or more macro-steps.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepTotals {
    pub cost: f64,
    pub tokens: usize,
    pub sentences: usize,
    pub src_words: usize,
    pub tags: TagScore,
}

impl StepTotals {
    fn add(&mut self, other: &StepTotals) {
        self.cost += other.cost;
        self.tokens += other.tokens;
        self.sentences += other.sentences;
        self.src_words += other.src_words;
        self.tags.add(&other.tags);
    }

    fn from_batch(out: &BatchCost, batch: &SntPairBatch) -> Self {
        Self {
            cost: out.cost,
            tokens: out.tokens,
            sentences: batch.batch_size(),
            src_words: batch.src_token_count(),
            tags: out.tags,
        }
    }

    /// Cost per target token, or infinity before any token was seen.
    pub fn cost_per_word(&self) -> f64 {
        if self.tokens == 0 {
            f64::INFINITY
        } else {
            self.cost / self.tokens as f64
        }
    }
}

pub struct Seq2Seq {
    opts: Options,
    model: Seq2SeqModel,
    stores: Vec<ParamStore>,
    pool: ThreadPool,
    optimizer: Box<dyn Optimizer>,
    schedule: Box<dyn LearningRateSchedule>,
    observers: Vec<Box<dyn TrainingObserver>>,
    weights_update_count: usize,
    gate: CheckpointGate,
    rng: StdRng,
}

impl Seq2Seq {
    /// Fresh model with the shapes in `opts` over `vocab`. Pretrained
    /// embeddings named in `opts` are copied in before replication.
    pub fn new(opts: Options, vocab: Vocab) -> Result<Self> {
        opts.validate()?;
        let meta = ModelMetaData {
            hidden_dim: opts.hidden_dim,
            embedding_dim: opts.embedding_dim,
            encoder_layer_depth: opts.encoder_layer_depth,
            decoder_layer_depth: opts.decoder_layer_depth,
            multi_head_num: opts.multi_head_num,
            encoder_type: opts.encoder_type,
            enable_coverage: opts.enable_coverage,
            shared_embeddings: opts.shared_embeddings,
            vocab,
        };
        let mut rng = rng_from_seed(opts.seed);
        let mut store = ParamStore::new(opts.device_ids[0]);
        let model = Seq2SeqModel::build(meta, &mut store, &mut rng)?;

        if let Some(path) = &opts.src_embedding_path {
            let table = owned_mut(&mut store, model.src_embedding())?;
            load_pretrained_embeddings(path, &model.vocab().src, table)?;
        }
        if let Some(path) = &opts.tgt_embedding_path {
            let table = owned_mut(&mut store, model.tgt_embedding())?;
            load_pretrained_embeddings(path, &model.vocab().tgt, table)?;
        }
        Self::from_parts(opts, model, store, rng)
    }

    /// Loads the model at `opts.model_path`. Network shapes come from the
    /// file header; `opts` supplies the training and decoding settings.
    pub fn load(opts: Options) -> Result<Self> {
        opts.validate()?;
        let mut rng = rng_from_seed(opts.seed);
        let mut store = ParamStore::new(opts.device_ids[0]);
        let model = load_model(&opts.model_path, &mut store, &mut rng)?;
        Self::from_parts(opts, model, store, rng)
    }

    fn from_parts(opts: Options, model: Seq2SeqModel, canonical: ParamStore, rng: StdRng) -> Result<Self> {
        let aliased: Vec<ParamId> = if opts.replicate_embeddings {
            Vec::new()
        } else {
            model.embedding_params()
        };
        let mut stores = Vec::with_capacity(opts.device_ids.len());
        for &device in &opts.device_ids[1..] {
            stores.push(canonical.replicate(device, &aliased));
        }
        stores.insert(0, canonical);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(opts.device_ids.len())
            .build()
            .map_err(|e| Error::Config(format!("cannot start device pool: {e}")))?;
        let optimizer = opts.optimizer.build(opts.optimizer_params());
        let schedule = opts.lr_schedule.build(opts.start_learning_rate, opts.warmup_steps);
        info!(
            "Model ready on devices {:?}: {} parameter tensors, {:?} encoder",
            opts.device_ids,
            stores[0].len(),
            model.encoder().kind()
        );
        Ok(Self {
            opts,
            model,
            stores,
            pool,
            optimizer,
            schedule,
            observers: Vec::new(),
            weights_update_count: 0,
            gate: CheckpointGate::default(),
            rng,
        })
    }

    pub fn add_observer(&mut self, observer: Box<dyn TrainingObserver>) {
        self.observers.push(observer);
    }

    pub fn model(&self) -> &Seq2SeqModel {
        &self.model
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Per-device replicas; index 0 is the canonical copy.
    pub fn stores(&self) -> &[ParamStore] {
        &self.stores
    }

    pub fn weights_update_count(&self) -> usize {
        self.weights_update_count
    }

    pub fn device_count(&self) -> usize {
        self.stores.len()
    }

    /// Runs `max_epochs` epochs over `train`, validating on `valid` after
    /// each one.
    pub fn train(&mut self, train: &mut Corpus, mut valid: Option<&mut Corpus>) -> Result<()> {
        info!("Start training for {} epochs", self.opts.max_epochs);
        for epoch in 0..self.opts.max_epochs {
            self.train_epoch(epoch, train)?;
            if let Some(v) = valid.as_deref_mut() {
                self.validate(epoch, v)?;
            }
        }
        Ok(())
    }

    /// One pass over `corpus`. Returns the epoch's average cost per word.
    pub fn train_epoch(&mut self, epoch: usize, corpus: &mut Corpus) -> Result<f64> {
        info!("Start to process training corpus for epoch {epoch}");
        self.optimizer.clean_cache(self.stores[0].tensors_mut().collect());
        reset_matrix_ops();
        for o in &mut self.observers {
            o.on_epoch_begin(epoch);
        }

        let devices = self.device_count();
        let start = Instant::now();
        let mut totals = StepTotals::default();
        let mut pending: Vec<SntPairBatch> = Vec::with_capacity(devices);
        for batch in corpus.batches()? {
            pending.push(batch?);
            if pending.len() == devices {
                self.run_step(epoch, &pending, &mut totals, start)?;
                pending.clear();
            }
        }
        if !pending.is_empty() {
            debug!("Running partial macro-step with {} of {devices} batches", pending.len());
            self.run_step(epoch, &pending, &mut totals, start)?;
        }

        let avg = totals.cost_per_word();
        info!(
            "Epoch {epoch} finished: {} sentences, {} words, avg cost/word {avg:.4}, {:.1}s",
            totals.sentences,
            totals.tokens,
            start.elapsed().as_secs_f64()
        );
        info!("{}", format_total_ops(matrix_ops_count()));
        if self.gate.end_epoch(avg) {
            self.save_best_effort(epoch, avg);
        }
        for o in &mut self.observers {
            o.on_epoch_end(epoch, avg);
        }
        Ok(avg)
    }

    fn run_step(
        &mut self,
        epoch: usize,
        batches: &[SntPairBatch],
        totals: &mut StepTotals,
        start: Instant,
    ) -> Result<()> {
        let lr = self.schedule.next_lr(self.weights_update_count + 1);
        let step = self.train_step(batches, lr)?;
        totals.add(&step);

        let update = self.weights_update_count;
        if self.opts.progress_interval > 0 && update % self.opts.progress_interval == 0 {
            let event = ProgressEvent {
                epoch,
                update,
                lr,
                avg_cost: totals.cost_per_word(),
                sentences: totals.sentences,
                words: totals.tokens,
                elapsed: start.elapsed(),
            };
            for o in &mut self.observers {
                o.on_progress(&event);
            }
        }
        if self.opts.checkpoint_interval > 0
            && update % self.opts.checkpoint_interval == 0
            && self.gate.mid_epoch(totals.cost_per_word())
        {
            self.save_best_effort(epoch, totals.cost_per_word());
        }
        Ok(())
    }

    /// Full macro-step over one batch per device (fewer batches leave the
    /// remaining devices idle) followed by one optimizer update at `lr`.
    pub fn train_step(&mut self, batches: &[SntPairBatch], lr: f32) -> Result<StepTotals> {
        let totals = match self.compute_gradients(batches) {
            Ok(t) => t,
            Err(e) => {
                self.clear_gradients();
                return Err(e);
            }
        };
        self.optimizer
            .update_weights(self.stores[0].tensors_mut().collect(), totals.tokens, lr);
        self.clear_gradients();
        self.weights_update_count += 1;
        Ok(totals)
    }

    /// Broadcast, parallel forward/backward, landing and reduction. On
    /// success the canonical store holds the summed gradients of all
    /// devices.
    pub fn compute_gradients(&mut self, batches: &[SntPairBatch]) -> Result<StepTotals> {
        if batches.len() > self.stores.len() {
            return Err(Error::Config(format!(
                "{} batches for {} devices",
                batches.len(),
                self.stores.len()
            )));
        }
        self.broadcast_weights();

        let seed: u64 = self.rng.gen();
        let dropout = self.opts.dropout;
        let totals = Mutex::new(StepTotals::default());
        let stores = &self.stores;
        let model = &self.model;
        let results: Vec<Result<Gradients>> = self.pool.install(|| {
            batches
                .par_iter()
                .enumerate()
                .map(|(i, batch)| {
                    let device = stores[i].device_id;
                    if batch.batch_size() == 0 {
                        return Err(Error::Device {
                            device,
                            message: "empty batch".into(),
                        });
                    }
                    let rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
                    let mut g = ComputeGraph::new(ParamView::new(stores, i), true).with_rng(rng);
                    let out = model.forward_batch(&mut g, batch, dropout);
                    if i == 0 && log::log_enabled!(log::Level::Trace) {
                        log::trace!("device {device} ops per scope: {:?}", g.scope_summary());
                    }
                    if !out.cost.is_finite() {
                        return Err(Error::Device {
                            device,
                            message: format!("non-finite cost {}", out.cost),
                        });
                    }
                    let grads = g.backward().map_err(|e| Error::Device {
                        device,
                        message: e.to_string(),
                    })?;
                    let mut t = totals.lock().map_err(|_| Error::Device {
                        device,
                        message: "step accumulator poisoned".into(),
                    })?;
                    t.add(&StepTotals::from_batch(&out, batch));
                    Ok(grads)
                })
                .collect()
        });

        let mut grads = Vec::with_capacity(results.len());
        for r in results {
            grads.push(r?);
        }
        self.land_gradients(grads);
        self.reduce_gradients();
        totals.into_inner().map_err(|_| Error::Device {
            device: self.stores[0].device_id,
            message: "step accumulator poisoned".into(),
        })
    }

    /// Copies canonical weights into every owned slot of the other devices.
    fn broadcast_weights(&mut self) {
        let (head, tail) = self.stores.split_at_mut(1);
        let canonical = &head[0];
        tail.par_iter_mut().for_each(|replica| {
            for (i, slot) in replica.slots.iter_mut().enumerate() {
                if let (Ownership::Owned(dst), Some(src)) = (slot, canonical.owned(ParamId(i))) {
                    dst.copy_weights_from(src);
                }
            }
        });
    }

    /// Adds device `i`'s gradients to store `i`; entries for aliased slots
    /// go to the owning device's store.
    fn land_gradients(&mut self, grads: Vec<Gradients>) {
        for (i, g) in grads.into_iter().enumerate() {
            for (owner, id, grad) in self.stores[i].accumulate(g) {
                let target = self
                    .stores
                    .iter_mut()
                    .find(|s| s.device_id == owner)
                    .and_then(|s| s.owned_mut(id));
                match target {
                    Some(t) => t.gradient.add_assign(&grad),
                    None => warn!("dropping gradient of parameter {} with no owner on device {owner}", id.0),
                }
            }
        }
    }

    /// Sums every replica's gradients into the canonical store, in device
    /// order. Aliased slots hold no gradient and are skipped.
    fn reduce_gradients(&mut self) {
        let (head, tail) = self.stores.split_at_mut(1);
        let replicas: &[ParamStore] = tail;
        head[0]
            .slots
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, slot)| {
                if let Ownership::Owned(dst) = slot {
                    for r in replicas {
                        if let Ownership::Owned(src) = &r.slots[i] {
                            dst.add_gradient_from(src);
                        }
                    }
                }
            });
    }

    fn clear_gradients(&mut self) {
        self.stores.par_iter_mut().for_each(ParamStore::clear_gradients);
    }

    /// Forward-only average cost per word over `corpus`, reported as an
    /// evaluation event. Models with a tagging head also report token-level
    /// precision, recall and F-score.
    pub fn validate(&mut self, epoch: usize, corpus: &mut Corpus) -> Result<f64> {
        let mut totals = StepTotals::default();
        for batch in corpus.batches()? {
            let batch = batch?;
            let mut g = ComputeGraph::new(ParamView::new(&self.stores, 0), false);
            let out = self.model.forward_batch(&mut g, &batch, 0.0);
            totals.add(&StepTotals::from_batch(&out, &batch));
        }
        let avg = totals.cost_per_word();
        let severity = if avg.is_finite() { Severity::Info } else { Severity::Warning };
        let mut events = vec![EvaluationEvent::new(
            "Validation",
            format!(
                "epoch {epoch}: {} sentences, avg cost/word {avg:.4}",
                totals.sentences
            ),
            severity,
        )];
        if self.model.has_tagger() {
            let t = &totals.tags;
            events.push(EvaluationEvent::new(
                "Tagging",
                format!(
                    "epoch {epoch}: precision {:.4}, recall {:.4}, F-score {:.4}",
                    t.precision(),
                    t.recall(),
                    t.f_score()
                ),
                Severity::Info,
            ));
        }
        for event in &events {
            for o in &mut self.observers {
                o.on_evaluation(event);
            }
        }
        Ok(avg)
    }

    pub fn save(&self) -> Result<()> {
        save_model(&self.opts.model_path, &self.model, &self.stores[0])
    }

    fn save_best_effort(&mut self, epoch: usize, avg: f64) {
        match self.save() {
            Ok(()) => info!("{}", format_checkpoint_saved(epoch, self.weights_update_count, avg)),
            Err(e) => {
                error!("Failed to save checkpoint to {}: {e}", self.opts.model_path.display());
                let event = EvaluationEvent::new("Checkpoint", e.to_string(), Severity::Error);
                for o in &mut self.observers {
                    o.on_evaluation(&event);
                }
            }
        }
    }

    fn beam_options(&self) -> BeamSearchOptions {
        BeamSearchOptions {
            length_penalty: self.opts.length_penalty,
            ..BeamSearchOptions::new(self.opts.beam_size, self.opts.max_decode_length)
        }
    }

    /// Target sequences of the final beam for one tokenized source, best
    /// first.
    pub fn predict(&self, tokens: &[String]) -> Vec<Vec<String>> {
        translate(&self.model, &self.stores[0], tokens, &self.beam_options())
    }

    /// Labels of every token in `tokens`, if the model has a tagging head.
    pub fn tag(&self, tokens: &[String]) -> Option<Vec<String>> {
        let mut g = ComputeGraph::new(ParamView::single(&self.stores[0]), false);
        self.model.tag(&mut g, tokens)
    }

    /// Decodes every line of `input` and writes the best hypothesis of each
    /// to `output`; models with a tagging head write one label per token
    /// instead. Returns the number of lines written.
    pub fn decode_file(&self, input: &Path, output: &Path) -> Result<usize> {
        let reader = BufReader::new(File::open(input)?);
        let mut w = BufWriter::new(File::create(output)?);
        let mut count = 0;
        for line in reader.lines() {
            let line = line?;
            let line = if self.opts.lowercase {
                line.trim().to_lowercase()
            } else {
                line.trim().to_string()
            };
            let tokens: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            let best = match self.tag(&tokens) {
                Some(labels) => labels,
                None => self.predict(&tokens).into_iter().next().unwrap_or_default(),
            };
            writeln!(w, "{}", best.join(" "))?;
            count += 1;
        }
        w.flush()?;
        info!("Decoded {count} sentences into {}", output.display());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_compares_against_previous_epoch() {
        let mut gate = CheckpointGate::default();
        assert!(gate.end_epoch(2.0));
        assert!(!gate.end_epoch(2.5));
        assert_eq!(gate.last_epoch_avg(), 2.5);
        assert!(gate.mid_epoch(2.4));
        assert!(gate.end_epoch(2.2));
        assert!(!gate.mid_epoch(2.2));
    }

    #[test]
    fn gate_never_saves_non_finite_cost() {
        let mut gate = CheckpointGate::default();
        assert!(!gate.mid_epoch(f64::INFINITY));
        assert!(!gate.end_epoch(f64::MAX));
        assert!(gate.end_epoch(3.0));
    }
}
