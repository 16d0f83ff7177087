//! End-to-end read-stream scenarios (spec §8): sequential cold, random
//! cold, short accept, and the pin/pending budget invariant.

use std::collections::HashSet;
use std::io::Write as _;
use std::os::unix::io::AsRawFd;

use aio_engine::method::SyncMethod;
use aio_engine::read_stream::{BlockNumber, BlockSource, ReadStream, ReadStreamFlags};
use aio_engine::{AioConfig, AioEngine, SubjectId};

struct VecBlockSource {
    blocks: std::vec::IntoIter<BlockNumber>,
    cached: HashSet<BlockNumber>,
}

impl VecBlockSource {
    fn new(blocks: Vec<BlockNumber>, cached: HashSet<BlockNumber>) -> Self {
        Self { blocks: blocks.into_iter(), cached }
    }
}

impl BlockSource for VecBlockSource {
    fn next_block(&mut self) -> Option<BlockNumber> {
        self.blocks.next()
    }

    fn is_cached(&self, block: BlockNumber) -> bool {
        self.cached.contains(&block)
    }
}

fn engine_and_backend(config: AioConfig) -> (std::sync::Arc<AioEngine>, aio_engine::BackendId) {
    let engine = AioEngine::with_method(config, Box::new(SyncMethod::new())).unwrap();
    let backend_id = engine.register_backend().unwrap();
    (engine, backend_id)
}

fn scratch_file(block_count: u32) -> (tempfile::NamedTempFile, i32) {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let mut page = vec![0u8; 8192];
    for block in 0..block_count {
        page[0..4].copy_from_slice(&block.to_le_bytes());
        file.write_all(&page).unwrap();
    }
    file.flush().unwrap();
    let fd = file.as_file().as_raw_fd();
    (file, fd)
}

#[test]
fn sequential_cold_scan_returns_blocks_in_order() {
    let mut config = AioConfig::default();
    config.buffer_io_size = 8;
    let (engine, backend_id) = engine_and_backend(config);
    let (_file, fd) = scratch_file(40);

    let source = VecBlockSource::new((0..40).collect(), HashSet::new());
    let mut stream = ReadStream::begin(
        engine,
        backend_id,
        fd,
        SubjectId::RawFile,
        0,
        ReadStreamFlags::NONE,
        Box::new(source),
    );

    let mut seen = Vec::new();
    while let Some(buffer) = stream.next() {
        let block_in_buffer = u32::from_le_bytes(buffer.bytes[0..4].try_into().unwrap());
        assert_eq!(block_in_buffer, buffer.block);
        seen.push(buffer.block);
    }
    assert_eq!(seen, (0..40).collect::<Vec<_>>());
}

#[test]
fn random_cold_scan_never_exceeds_pin_budget() {
    let mut config = AioConfig::default();
    config.effective_io_concurrency = 4;
    config.buffer_io_size = 8;
    let (engine, backend_id) = engine_and_backend(config);
    let (_file, fd) = scratch_file(64);

    let order = vec![10, 2, 40, 1, 55, 20, 0, 33, 48, 5];
    let source = VecBlockSource::new(order.clone(), HashSet::new());
    let mut stream = ReadStream::begin(
        engine,
        backend_id,
        fd,
        SubjectId::RawFile,
        0,
        ReadStreamFlags::NONE,
        Box::new(source),
    );

    let mut seen = Vec::new();
    while let Some(buffer) = stream.next() {
        seen.push(buffer.block);
        assert!(stream.pinned() + stream.pending_read_nblocks() <= stream.max_pinned_buffers());
    }
    assert_eq!(seen, order);
}

#[test]
fn end_leaves_stream_fully_drained() {
    let (engine, backend_id) = engine_and_backend(AioConfig::default());
    let (_file, fd) = scratch_file(20);

    let source = VecBlockSource::new((0..20).collect(), HashSet::new());
    let mut stream = ReadStream::begin(
        engine,
        backend_id,
        fd,
        SubjectId::RawFile,
        0,
        ReadStreamFlags::NONE,
        Box::new(source),
    );
    stream.next();
    stream.next();
    stream.end();
    assert_eq!(stream.pinned(), 0);
    assert_eq!(stream.ios_in_progress(), 0);
}

#[test]
fn short_accept_splits_a_range_wider_than_the_iovec_cap() {
    let mut config = AioConfig::default();
    config.buffer_io_size = 64;
    config.effective_io_concurrency = 4;
    let (engine, backend_id) = engine_and_backend(config);
    let (_file, fd) = scratch_file(64);

    // A single contiguous run of 40 blocks, far beyond the default
    // max_iovecs_per_io of 32: must come back as two physical reads,
    // invisibly stitched into one consumption order.
    let source = VecBlockSource::new((0..40).collect(), HashSet::new());
    let mut stream = ReadStream::begin(
        engine,
        backend_id,
        fd,
        SubjectId::RawFile,
        0,
        ReadStreamFlags::SEQUENTIAL,
        Box::new(source),
    );
    let mut seen = Vec::new();
    while let Some(buffer) = stream.next() {
        seen.push(buffer.block);
    }
    assert_eq!(seen, (0..40).collect::<Vec<_>>());
}
