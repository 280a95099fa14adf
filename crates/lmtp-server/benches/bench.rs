use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use lmtp_core::kwargs::Kwargs;
use lmtp_server::server::call::GenerateCall;
use lmtp_server::server::batch::GenerateBatch;
use lmtp_server::server::streaming::topk::top_k;
use std::collections::HashMap;
use std::hint::black_box;

fn make_calls(count: usize, prompt_len: usize) -> Vec<GenerateCall> {
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    (0..count)
        .map(|i| {
            let prompt = (0..prompt_len).map(|j| ((i + j) % 255) as u32).collect();
            GenerateCall::new(prompt, HashMap::new(), Kwargs::new(), i as u64, tx.clone())
        })
        .collect()
}

fn batch_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("generate_batch_from_calls");

    for batch_size in [1usize, 8, 32, 64] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_function(format!("batch_size_{batch_size}"), |b| {
            b.iter_batched(
                || make_calls(batch_size, 128),
                |calls| {
                    black_box(GenerateBatch::from_calls(calls));
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn top_k_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("top_k");

    for vocab_size in [1_000usize, 32_000, 128_000] {
        let row: Vec<f32> = (0..vocab_size).map(|i| (i as f32).sin()).collect();
        group.throughput(Throughput::Elements(vocab_size as u64));
        group.bench_function(format!("vocab_{vocab_size}"), |b| {
            b.iter(|| black_box(top_k(&row, 10)));
        });
    }

    group.finish();
}

criterion_group!(benches, batch_construction, top_k_selection);
criterion_main!(benches);
