//! Beam search and greedy decoding.
//!
//! Hypotheses are plain values: the recurrent state they continue from lives
//! in a [`StateArena`] and each hypothesis holds a handle into it, so
//! extending one hypothesis never touches another's state.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::autograd::ComputeGraph;
use crate::layers::AttentionPreProcessResult;
use crate::math::{argmax, top_n_indices};
use crate::models::{DecoderState, Seq2SeqModel};
use crate::tensor::{ParamStore, ParamView};
use crate::vocab::{BOS_ID, EOS_ID};

/// Something that emits a distribution over the next token given the last
/// emitted one and a recurrent state.
pub trait StepModel {
    type State: Clone;

    fn initial_state(&mut self) -> Self::State;

    /// Probabilities over the vocabulary after feeding `last` from `state`,
    /// with the state reached.
    fn step(&mut self, last: usize, state: &Self::State) -> (Vec<f32>, Self::State);
}

/// Handle into a [`StateArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateHandle(usize);

/// Append-only storage of decoder state snapshots.
pub struct StateArena<S> {
    states: Vec<S>,
}

impl<S> StateArena<S> {
    pub fn new() -> Self {
        Self { states: Vec::new() }
    }

    pub fn push(&mut self, s: S) -> StateHandle {
        self.states.push(s);
        StateHandle(self.states.len() - 1)
    }

    pub fn get(&self, h: StateHandle) -> &S {
        &self.states[h.0]
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl<S> Default for StateArena<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// One decoding hypothesis. `score` is the accumulated negative
/// log-likelihood of `ids` after the leading BOS; lower is better.
#[derive(Clone, Debug, PartialEq)]
pub struct Hypothesis {
    pub ids: Vec<usize>,
    pub score: f32,
    state: StateHandle,
}

impl Hypothesis {
    /// Emitted tokens, excluding the leading BOS.
    pub fn emitted(&self) -> usize {
        self.ids.len().saturating_sub(1)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BeamSearchOptions {
    pub beam_size: usize,
    /// Tokens a hypothesis may emit before it is cut.
    pub max_len: usize,
    pub bos: usize,
    pub eos: usize,
    /// When set, hypotheses are ranked by `score / emitted^alpha`. Scores
    /// themselves stay unnormalized.
    pub length_penalty: Option<f32>,
}

impl BeamSearchOptions {
    pub fn new(beam_size: usize, max_len: usize) -> Self {
        Self {
            beam_size,
            max_len,
            bos: BOS_ID,
            eos: EOS_ID,
            length_penalty: None,
        }
    }

    fn is_terminal(&self, h: &Hypothesis) -> bool {
        h.ids.last() == Some(&self.eos) || h.emitted() >= self.max_len
    }

    fn rank(&self, h: &Hypothesis) -> f32 {
        match self.length_penalty {
            Some(alpha) => h.score / (h.emitted().max(1) as f32).powf(alpha),
            None => h.score,
        }
    }
}

/// Heap entry ordered by rank, then insertion order, so the heap top is
/// the worst candidate and the first-seen of equal candidates survives.
struct Ranked {
    rank: f32,
    seq: usize,
    hyp: Hypothesis,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .total_cmp(&other.rank)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Keeps the `k` best candidates seen so far.
struct TopK {
    k: usize,
    heap: BinaryHeap<Ranked>,
    seen: usize,
}

impl TopK {
    fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
            seen: 0,
        }
    }

    fn push(&mut self, rank: f32, hyp: Hypothesis) {
        self.heap.push(Ranked {
            rank,
            seq: self.seen,
            hyp,
        });
        self.seen += 1;
        if self.heap.len() > self.k {
            self.heap.pop();
        }
    }

    /// Best first.
    fn into_sorted(self) -> Vec<Hypothesis> {
        self.heap.into_sorted_vec().into_iter().map(|r| r.hyp).collect()
    }
}

fn neg_log(p: f32) -> f32 {
    -p.clamp(f32::MIN_POSITIVE, 1.0).ln()
}

/// Runs beam search from a single BOS hypothesis and returns the surviving
/// hypotheses, best first. At most `beam_size` are returned.
pub fn beam_search<M: StepModel>(model: &mut M, opts: &BeamSearchOptions) -> Vec<Hypothesis> {
    let beam = opts.beam_size.max(1);
    let mut arena = StateArena::new();
    let init = model.initial_state();
    let mut beams = vec![Hypothesis {
        ids: vec![opts.bos],
        score: 0.0,
        state: arena.push(init),
    }];

    while beams.iter().any(|h| !opts.is_terminal(h)) {
        let mut top = TopK::new(beam);
        for h in beams {
            if opts.is_terminal(&h) {
                let rank = opts.rank(&h);
                top.push(rank, h);
                continue;
            }
            let last = h.ids.last().copied().unwrap_or(opts.bos);
            let (probs, next) = model.step(last, arena.get(h.state));
            let state = arena.push(next);
            for id in top_n_indices(&probs, beam) {
                let mut ids = h.ids.clone();
                ids.push(id);
                let child = Hypothesis {
                    ids,
                    score: h.score + neg_log(probs[id]),
                    state,
                };
                let rank = opts.rank(&child);
                top.push(rank, child);
            }
        }
        beams = top.into_sorted();
    }
    log::debug!("beam search kept {} states", arena.len());
    beams
}

/// Follows the argmax token at each step.
pub fn greedy_decode<M: StepModel>(model: &mut M, max_len: usize, bos: usize, eos: usize) -> Vec<usize> {
    let mut ids = vec![bos];
    let mut state = model.initial_state();
    while ids.len() <= max_len {
        let last = ids.last().copied().unwrap_or(bos);
        let (probs, next) = model.step(last, &state);
        let id = argmax(&probs);
        ids.push(id);
        state = next;
        if id == eos {
            break;
        }
    }
    ids
}

/// Step-wise decoding of one encoded source sentence with a [`Seq2SeqModel`].
pub struct ModelStepper<'m, 'g, 'a> {
    model: &'m Seq2SeqModel,
    graph: &'g mut ComputeGraph<'a>,
    pre: AttentionPreProcessResult,
    init: DecoderState,
}

impl<'m, 'g, 'a> ModelStepper<'m, 'g, 'a> {
    pub fn new(model: &'m Seq2SeqModel, graph: &'g mut ComputeGraph<'a>, tokens: &[String]) -> Self {
        let (pre, init) = model.begin_decoding(graph, tokens);
        Self {
            model,
            graph,
            pre,
            init,
        }
    }
}

impl StepModel for ModelStepper<'_, '_, '_> {
    type State = DecoderState;

    fn initial_state(&mut self) -> DecoderState {
        self.init.clone()
    }

    fn step(&mut self, last: usize, state: &DecoderState) -> (Vec<f32>, DecoderState) {
        self.model.decode_step(self.graph, last, &self.pre, state)
    }
}

/// Decodes `tokens` with the weights in `store` and returns the target
/// token sequences of the final hypotheses, best first.
pub fn translate(
    model: &Seq2SeqModel,
    store: &ParamStore,
    tokens: &[String],
    opts: &BeamSearchOptions,
) -> Vec<Vec<String>> {
    let mut g = ComputeGraph::new(ParamView::single(store), false);
    let mut stepper = ModelStepper::new(model, &mut g, tokens);
    beam_search(&mut stepper, opts)
        .into_iter()
        .map(|h| model.vocab().tgt_tokens(&h.ids))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fixed next-token distributions indexed by the last token.
    struct Table(Vec<Vec<f32>>);

    impl StepModel for Table {
        type State = usize;

        fn initial_state(&mut self) -> usize {
            0
        }

        fn step(&mut self, last: usize, state: &usize) -> (Vec<f32>, usize) {
            (self.0[last].clone(), state + 1)
        }
    }

    #[test]
    fn ties_keep_first_seen() {
        let mut top = TopK::new(1);
        let h = |id| Hypothesis {
            ids: vec![id],
            score: 1.0,
            state: StateHandle(0),
        };
        top.push(1.0, h(7));
        top.push(1.0, h(8));
        assert_eq!(top.into_sorted()[0].ids, vec![7]);
    }

    #[test]
    fn stops_at_length_cap() {
        // token 0 is EOS, never likely
        let mut m = Table(vec![vec![0.0, 0.1, 0.9]; 3]);
        let opts = BeamSearchOptions {
            bos: 1,
            eos: 0,
            ..BeamSearchOptions::new(2, 4)
        };
        let out = beam_search(&mut m, &opts);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|h| h.emitted() == 4));
        assert_eq!(out[0].ids, vec![1, 2, 2, 2, 2]);
    }

    #[test]
    fn length_penalty_changes_ranking_only() {
        let table = vec![vec![0.0; 3], vec![0.4, 0.0, 0.6], vec![0.9, 0.0, 0.1]];
        let base = BeamSearchOptions {
            bos: 1,
            eos: 0,
            ..BeamSearchOptions::new(2, 5)
        };
        let plain = beam_search(&mut Table(table.clone()), &base);
        let penalized = beam_search(
            &mut Table(table),
            &BeamSearchOptions {
                length_penalty: Some(1.0),
                ..base
            },
        );
        let find = |hs: &[Hypothesis], ids: &[usize]| hs.iter().find(|h| h.ids == ids).map(|h| h.score);
        assert_eq!(find(&plain, &[1, 2, 0]), find(&penalized, &[1, 2, 0]));
    }
}
