use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use graph_alloc::{
    BufferOptions, ChunkAllocator, GraphAllocator, GraphPlanner, GraphView, PlanRequest,
    TensorDesc,
};

fn linear_chain(layers: usize, activation_size: usize) -> GraphView {
    let leaf = TensorDesc::leaf(0, activation_size);
    let mut nodes = Vec::with_capacity(layers);
    for layer in 0..layers {
        let id = (layer + 1) as u64;
        let mut node = TensorDesc::node(id, activation_size, &[id - 1]);
        if layer == layers - 1 {
            node = node.as_output();
        }
        nodes.push(node);
    }
    GraphView::new(vec![leaf], nodes)
}

fn bench_chunk_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_allocator");
    group.bench_function("allocate_release_churn", |b| {
        let mut rng = StdRng::seed_from_u64(7);
        let sizes: Vec<usize> = (0..256).map(|_| rng.gen_range(64..4096)).collect();
        b.iter(|| {
            let mut alloc = ChunkAllocator::new(64, 1 << 20).unwrap();
            let mut live = Vec::with_capacity(sizes.len());
            for &size in &sizes {
                live.push(alloc.allocate(size).unwrap());
            }
            // release every other allocation, then refill the gaps
            for placement in live.iter().step_by(2) {
                alloc
                    .release(placement.chunk, placement.offset, placement.size)
                    .unwrap();
            }
            for &size in sizes.iter().step_by(2) {
                black_box(alloc.allocate(size).unwrap());
            }
        });
    });
    group.finish();
}

fn bench_plan_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("planner");
    for layers in [16usize, 64, 256] {
        let graph = linear_chain(layers, 4096);
        group.bench_with_input(
            BenchmarkId::new("linear_chain", layers),
            &graph,
            |b, graph| {
                let planner = GraphPlanner::new();
                b.iter(|| {
                    let request = PlanRequest::new(black_box(graph), 1);
                    black_box(planner.plan(&request).unwrap());
                });
            },
        );
    }
    group.finish();
}

fn bench_alloc_graph_steady_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("orchestrator");
    group.bench_function("alloc_graph_reuse", |b| {
        let graph = linear_chain(32, 4096);
        let mut alloc = GraphAllocator::new();
        alloc.initialize(&[BufferOptions::new(64, 1 << 24)]).unwrap();
        alloc.reserve(&graph, None, None).unwrap();
        b.iter(|| {
            alloc.alloc_graph(black_box(&graph)).unwrap();
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_chunk_churn,
    bench_plan_chain,
    bench_alloc_graph_steady_state
);
criterion_main!(benches);
