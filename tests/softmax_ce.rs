use attnseq::autograd::ComputeGraph;
use attnseq::math::{argmax, Matrix};
use attnseq::rng::rng_from_seed;
use attnseq::tensor::{ParamBuilder, ParamStore, ParamView};

fn logits_store(values: Vec<f32>, rows: usize, cols: usize) -> (ParamStore, attnseq::tensor::ParamId) {
    let mut store = ParamStore::new(0);
    let mut rng = rng_from_seed(Some(0));
    let id = ParamBuilder::new(&mut store, &mut rng).zeros("logits", rows, cols);
    store.owned_mut(id).unwrap().weight = Matrix::from_vec(rows, cols, values);
    (store, id)
}

#[test]
fn cost_and_gradient_match_manual_softmax() {
    let logits = vec![1.0, 2.0, 0.5, 0.3, -1.0, 2.5];
    let (store, id) = logits_store(logits.clone(), 2, 3);

    let mut g = ComputeGraph::new(ParamView::single(&store), true);
    let x = g.param(id);
    let (probs, cost) = g.softmax_cross_entropy(x, &[Some(1), None]);
    let p = g.value(probs).clone();
    let grads = g.backward().unwrap();

    let row0 = &logits[..3];
    let max = row0.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = row0.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    let expected: Vec<f32> = exps.iter().map(|e| e / sum).collect();

    for (a, b) in p.row(0).iter().zip(&expected) {
        assert!((a - b).abs() < 1e-6);
    }
    assert!((cost + expected[1].ln()).abs() < 1e-4);
    assert_eq!(argmax(p.row(1)), 2);

    let grad = grads.get(id).unwrap();
    for (c, e) in expected.iter().enumerate() {
        let target = if c == 1 { 1.0 } else { 0.0 };
        assert!((grad.get(0, c) - (e - target)).abs() < 1e-6);
    }
    assert!(grad.row(1).iter().all(|v| *v == 0.0));
}

#[test]
fn masked_rows_add_no_cost() {
    let (store, id) = logits_store(vec![0.0; 8], 2, 4);
    let mut g = ComputeGraph::new(ParamView::single(&store), false);
    let x = g.param(id);
    let (_, cost) = g.softmax_cross_entropy(x, &[Some(0), None]);
    assert!((cost - 4f32.ln()).abs() < 1e-4);
    assert!(g.backward().is_err());
}
