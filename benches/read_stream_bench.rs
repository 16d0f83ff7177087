// Read stream throughput benchmarks: sequential vs. random access patterns
// under the adaptive look-ahead distance controller.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::io::Write as _;
use std::os::unix::io::AsRawFd;

use aio_engine::method::SyncMethod;
use aio_engine::read_stream::{BlockNumber, BlockSource, ReadStream, ReadStreamFlags};
use aio_engine::{AioConfig, AioEngine, SubjectId};

struct SequentialSource {
    next: BlockNumber,
    end: BlockNumber,
}

impl BlockSource for SequentialSource {
    fn next_block(&mut self) -> Option<BlockNumber> {
        if self.next >= self.end {
            return None;
        }
        let block = self.next;
        self.next += 1;
        Some(block)
    }

    fn is_cached(&self, _block: BlockNumber) -> bool {
        false
    }
}

struct RandomSource {
    order: std::vec::IntoIter<BlockNumber>,
}

impl BlockSource for RandomSource {
    fn next_block(&mut self) -> Option<BlockNumber> {
        self.order.next()
    }

    fn is_cached(&self, _block: BlockNumber) -> bool {
        false
    }
}

fn scratch_file(block_count: u32) -> (tempfile::NamedTempFile, i32) {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let page = vec![0u8; 8192];
    for _ in 0..block_count {
        file.write_all(&page).unwrap();
    }
    file.flush().unwrap();
    let fd = file.as_file().as_raw_fd();
    (file, fd)
}

fn bench_sequential_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_stream_sequential");
    for block_count in [256u32, 1024, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(block_count), &block_count, |b, &block_count| {
            let (_file, fd) = scratch_file(block_count);
            b.iter(|| {
                let config = AioConfig::default();
                let engine = AioEngine::with_method(config, Box::new(SyncMethod::new())).unwrap();
                let backend_id = engine.register_backend().unwrap();
                let source = SequentialSource { next: 0, end: block_count };
                let mut stream = ReadStream::begin(
                    engine,
                    backend_id,
                    fd,
                    SubjectId::RawFile,
                    0,
                    ReadStreamFlags::SEQUENTIAL,
                    Box::new(source),
                );
                while let Some(buffer) = stream.next() {
                    black_box(buffer.bytes[0]);
                }
            });
        });
    }
    group.finish();
}

fn bench_random_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_stream_random");
    for block_count in [256u32, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(block_count), &block_count, |b, &block_count| {
            let (_file, fd) = scratch_file(block_count);
            let mut order: Vec<BlockNumber> = (0..block_count).collect();
            // Deterministic shuffle: reverse in chunks of 7, avoids pulling
            // in a `rand` dependency just for benchmark input shaping.
            for chunk in order.chunks_mut(7) {
                chunk.reverse();
            }
            b.iter(|| {
                let mut config = AioConfig::default();
                config.effective_io_concurrency = 8;
                let engine = AioEngine::with_method(config, Box::new(SyncMethod::new())).unwrap();
                let backend_id = engine.register_backend().unwrap();
                let source = RandomSource { order: order.clone().into_iter() };
                let mut stream = ReadStream::begin(
                    engine,
                    backend_id,
                    fd,
                    SubjectId::RawFile,
                    0,
                    ReadStreamFlags::NONE,
                    Box::new(source),
                );
                while let Some(buffer) = stream.next() {
                    black_box(buffer.bytes[0]);
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sequential_scan, bench_random_scan);
criterion_main!(benches);
