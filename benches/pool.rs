use std::sync::mpsc;

use criterion::*;

fn criterion_benchmark(c: &mut Criterion) {
    let threads = num_cpus::get().max(1);

    let tasks = 1000;

    let mut group = c.benchmark_group("pool");
    group.sample_size(10);

    group.bench_function("dynpool", |b| {
        b.iter_batched(
            || dynpool::ThreadPool::builder().max_size(threads).build(),
            |pool| {
                let (tx, rx) = mpsc::channel();

                for _ in 0..tasks {
                    let tx = tx.clone();
                    pool.submit(move || {
                        let _ = tx.send(black_box(8 + 9));
                    });
                }

                drop(tx);
                assert_eq!(rx.iter().count(), tasks);

                pool.shutdown();
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("dynpool-fixed", |b| {
        b.iter_batched(
            || dynpool::ThreadPool::fixed(threads),
            |pool| {
                let (tx, rx) = mpsc::channel();

                for _ in 0..tasks {
                    let tx = tx.clone();
                    pool.submit(move || {
                        let _ = tx.send(black_box(8 + 9));
                    });
                }

                drop(tx);
                assert_eq!(rx.iter().count(), tasks);

                pool.shutdown();
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("threadpool", |b| {
        b.iter_batched(
            || threadpool::ThreadPool::new(threads),
            |pool| {
                for _ in 0..tasks {
                    pool.execute(|| {
                        let _ = black_box(8 + 9);
                    });
                }

                pool.join();
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
