use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use notesafe_engine::{MutationOutcome, NoteMutator};
use notesafe_test_utils::{AppendingMutator, FailingMutator, VaultFixture};
use std::sync::Arc;

fn image_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("attachments/img-{i:03}.png")).collect()
}

fn vault_with(count: usize) -> (VaultFixture, Vec<std::path::PathBuf>) {
    let vault = VaultFixture::new();
    let names = image_names(count);
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let (_, paths) = vault.note_with_images("bench.md", &refs);
    (vault, paths)
}

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("notesafe/commit");
    for count in [1_usize, 8, 32] {
        let (vault, _) = vault_with(count);
        let processor = vault.processor_with(|c| c.with_retain_backups(false));
        let mutator: Arc<dyn NoteMutator> = Arc::new(AppendingMutator::new("x"));

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| black_box(processor.process_note_with_images("bench.md", &mutator)));
        });
    }
    group.finish();
}

fn bench_rollback(c: &mut Criterion) {
    let mut group = c.benchmark_group("notesafe/rollback");
    for count in [1_usize, 8, 32] {
        let (vault, paths) = vault_with(count);
        let processor = vault.processor();
        let mutator = Arc::new(FailingMutator::corrupting(paths));

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| black_box(processor.process_note_with_images("bench.md", &mutator)));
        });
    }
    group.finish();
}

fn bench_noop_overhead(c: &mut Criterion) {
    let (vault, _) = vault_with(0);
    let processor = vault.processor();
    let noop = Arc::new(|_: &std::path::Path| -> anyhow::Result<MutationOutcome> {
        Ok(MutationOutcome::Success)
    });

    c.bench_function("notesafe/no_images", |b| {
        b.iter(|| black_box(processor.process_note_with_images("bench.md", &noop)));
    });
}

criterion_group!(benches, bench_commit, bench_rollback, bench_noop_overhead);
criterion_main!(benches);
