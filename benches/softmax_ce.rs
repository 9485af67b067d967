use attnseq::autograd::ComputeGraph;
use attnseq::math::Matrix;
use attnseq::rng::rng_from_seed;
use attnseq::tensor::{ParamBuilder, ParamStore, ParamView};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_softmax_ce(c: &mut Criterion) {
    let (rows, vocab) = (64, 8000);
    let mut store = ParamStore::new(0);
    let mut rng = rng_from_seed(Some(3));
    let id = ParamBuilder::new(&mut store, &mut rng).normal("logits", rows, vocab);
    let targets: Vec<Option<usize>> = (0..rows)
        .map(|r| if r % 7 == 6 { None } else { Some(r * 31 % vocab) })
        .collect();

    c.bench_function("softmax_ce_forward", |b| {
        b.iter(|| {
            let mut g = ComputeGraph::new(ParamView::single(&store), false);
            let x = g.param(id);
            g.softmax_cross_entropy(x, black_box(&targets)).1
        })
    });
    c.bench_function("softmax_ce_backward", |b| {
        b.iter(|| {
            let mut g = ComputeGraph::new(ParamView::single(&store), true);
            let x = g.param(id);
            let _ = g.softmax_cross_entropy(x, black_box(&targets));
            g.backward().map(|grads| grads.0.len()).unwrap_or(0)
        })
    });
    c.bench_function("row_softmax", |b| {
        let m = store.owned(id).map(|t| t.weight.clone()).unwrap_or_else(|| Matrix::zeros(rows, vocab));
        b.iter(|| black_box(&m).softmax())
    });
}

criterion_group!(benches, bench_softmax_ce);
criterion_main!(benches);
