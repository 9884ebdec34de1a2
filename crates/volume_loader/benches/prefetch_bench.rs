use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::{ArrayD, IxDyn};
use std::thread;
use std::time::Duration;
use volume_loader::{
    sampler::RandomLocation, stages::Normalize, Array, ArrayKey, ArraySource, ArraySpec,
    BatchRequest, InMemorySource, PipelineBuilder, PrefetchConfig, ProviderSpec, Roi,
};

/// Benchmarks for batch production.
///
/// This measures:
/// 1. Sampling overhead: random placement + crop from an in-memory volume
/// 2. Prefetch scaling: pulls from a source with fixed read latency, for
///    growing worker counts
///
/// To run these, use:
/// ```bash
/// cargo bench --bench prefetch_bench
/// ```

const PATCH: i64 = 64;

/// Source whose every read costs `latency`, standing in for disk I/O.
struct SlowSource {
    latency: Duration,
}

impl ArraySource for SlowSource {
    fn specs(&self) -> ProviderSpec {
        ProviderSpec::new().with_array("raw", ArraySpec::new(Roi::new([0, 0], [1024, 1024]), [1, 1]))
    }

    fn read(&self, _key: &ArrayKey, roi: &Roi) -> anyhow::Result<ArrayD<f32>> {
        thread::sleep(self.latency);
        let shape: Vec<usize> = roi.shape().iter().map(|s| s as usize).collect();
        Ok(ArrayD::zeros(IxDyn(&shape)))
    }
}

fn patch_request() -> BatchRequest {
    BatchRequest::new().with_array("raw", Roi::new([0, 0], [PATCH, PATCH]))
}

/// Measure sampling + cropping on the calling thread
fn bench_sampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("Sampling");

    for &size in &[256i64, 1024] {
        let volume = Array::filled(0.5, &[], Roi::new([0, 0], [size, size]), [1, 1]).unwrap();
        let pipeline = PipelineBuilder::source(InMemorySource::new().with_array("raw", volume))
            .then(RandomLocation::new())
            .then(Normalize::new("raw", 2.0))
            .build()
            .unwrap();
        let request = patch_request();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("random_location", size), &pipeline, |b, p| {
            let mut batches = p.batches(&request);
            b.iter(|| {
                let batch = batches.next().unwrap().unwrap();
                black_box(batch);
            })
        });
    }
    group.finish();
}

/// Measure pulls through the prefetch cache with a 2ms source
fn bench_prefetch(c: &mut Criterion) {
    let mut group = c.benchmark_group("Prefetch");
    group.sample_size(20);

    for &workers in &[1usize, 2, 4, 8] {
        let config = PrefetchConfig::builder()
            .num_workers(workers)
            .capacity(workers * 2)
            .poll_interval(Duration::from_millis(10))
            .build()
            .unwrap();
        let pipeline = PipelineBuilder::source(SlowSource {
            latency: Duration::from_millis(2),
        })
        .then(RandomLocation::new())
        .prefetch(config)
        .build()
        .unwrap();
        let request = patch_request();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("workers", workers), &pipeline, |b, p| {
            b.iter(|| {
                let batch = p.request_batch(&request).unwrap();
                black_box(batch);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sampling, bench_prefetch);
criterion_main!(benches);
