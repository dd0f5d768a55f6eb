use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};
use supcon::{
    contrastive::{PairIndex, RelationTensor, SimilarityMatrix},
    nn::losses::{ContrastiveEngine, LossKind, DEFAULT_TEMPERATURE_SCALE},
    tensor::{l2_normalize_rows, Shape, Tensor},
};

fn unit_rows(rng: &mut StdRng, n: usize, d: usize) -> Tensor<2> {
    let data = (0..n * d).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    l2_normalize_rows(&Tensor::from_vec(data, Shape::new([n, d])).unwrap()).0
}

fn inputs(batch: usize) -> (RelationTensor, SimilarityMatrix) {
    let mut rng = StdRng::seed_from_u64(batch as u64);
    let labels: Vec<i64> = (0..batch).map(|_| rng.gen_range(0..10)).collect();
    let queries = unit_rows(&mut rng, batch, 128);
    let keys = unit_rows(&mut rng, batch, 128);
    let relations = RelationTensor::from_labels(&labels, &labels, &PairIndex::identity(batch)).unwrap();
    let similarities = SimilarityMatrix::compute(&queries, &keys).unwrap();
    (relations, similarities)
}

/// Forward pass of every variant over growing global batches
fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("contrastive_forward");

    for batch in [64, 256, 1024] {
        let (relations, similarities) = inputs(batch);
        group.throughput(Throughput::Elements((batch * batch) as u64));

        for kind in [LossKind::SimClr, LossKind::SupCon, LossKind::PartialSupCon] {
            let engine = ContrastiveEngine::new(kind, DEFAULT_TEMPERATURE_SCALE).unwrap();
            group.bench_with_input(BenchmarkId::new(kind.as_str(), batch), &batch, |b, _| {
                b.iter(|| black_box(engine.forward(&relations, &similarities).unwrap()));
            });
        }
    }

    group.finish();
}

fn bench_backward(c: &mut Criterion) {
    let mut group = c.benchmark_group("contrastive_backward");

    for batch in [64, 256] {
        let (relations, similarities) = inputs(batch);
        let upstream = vec![1.0 / batch as f32; batch];
        let engine = ContrastiveEngine::new(LossKind::PartialSupCon, DEFAULT_TEMPERATURE_SCALE).unwrap();

        group.bench_with_input(BenchmarkId::new("partial-supcon", batch), &batch, |b, _| {
            b.iter(|| black_box(engine.forward_backward(&relations, &similarities, &upstream).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_forward, bench_backward);
criterion_main!(benches);
