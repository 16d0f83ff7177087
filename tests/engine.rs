//! Engine-level integration tests: handle lifecycle, invariant enforcement,
//! and the resource-owner teardown scenarios from spec §5.

use std::io::Write as _;
use std::os::unix::io::AsRawFd;

use aio_engine::method::SyncMethod;
use aio_engine::{AioConfig, AioEngine, ResourceOwner, SubjectId};

fn engine_with(config: AioConfig) -> (std::sync::Arc<AioEngine>, aio_engine::BackendId) {
    let engine = AioEngine::with_method(config, Box::new(SyncMethod::new())).unwrap();
    let backend_id = engine.register_backend().unwrap();
    (engine, backend_id)
}

fn scratch_file(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn round_trip_write_then_read() {
    let (engine, backend_id) = engine_with(AioConfig::default());
    let file = scratch_file(&[0u8; 4096]);
    let fd = file.as_file().as_raw_fd();

    let handle_ref = engine.acquire(backend_id).unwrap();
    engine.set_subject(handle_ref, SubjectId::RawFile, fd as u64).unwrap();
    let mut payload = b"hello aio engine".to_vec();
    payload.resize(4096, 0);
    let slice: &mut [u8] = &mut payload;
    engine.prepare_write(backend_id, handle_ref, fd, 0, &mut [slice]).unwrap();
    let result = engine.wait(handle_ref);
    assert!(result.is_ok());
    // The handle is terminal (COMPLETED_LOCAL) here, not HANDED_OUT: use
    // `reclaim`, not `release` (see `release_is_only_valid_from_handed_out`).
    engine.reclaim(backend_id, handle_ref).unwrap();

    let handle_ref = engine.acquire(backend_id).unwrap();
    engine.set_subject(handle_ref, SubjectId::RawFile, fd as u64).unwrap();
    let mut read_buf = vec![0u8; 4096];
    let slice: &mut [u8] = &mut read_buf;
    engine.prepare_read(backend_id, handle_ref, fd, 0, &mut [slice]).unwrap();
    let result = engine.wait(handle_ref);
    assert!(result.is_ok());
    assert_eq!(&read_buf[..16], b"hello aio engine");
    engine.reclaim(backend_id, handle_ref).unwrap();
}

#[test]
fn double_acquire_on_same_backend_is_rejected() {
    let (engine, backend_id) = engine_with(AioConfig::default());
    let first = engine.acquire_nb(backend_id).unwrap().unwrap();
    let second = engine.acquire_nb(backend_id);
    assert!(second.is_err());
    engine.release(backend_id, first).unwrap();
}

#[test]
fn backend_can_acquire_again_once_a_prior_handle_is_prepared() {
    // A backend's "handed out" marker only covers the HANDED_OUT window
    // (spec §8.7 `handed_out_io`): once a handle is prepared, this backend
    // must be able to build another one even before the first completes.
    let (engine, backend_id) = engine_with(AioConfig::default());
    let file = scratch_file(&[0u8; 4096]);
    let fd = file.as_file().as_raw_fd();

    let first = engine.acquire(backend_id).unwrap();
    let mut buf_a = vec![0u8; 4096];
    let slice_a: &mut [u8] = &mut buf_a;
    engine.prepare_read(backend_id, first, fd, 0, &mut [slice_a]).unwrap();

    // Still succeeds: `first` left HANDED_OUT the moment it was prepared.
    let second = engine.acquire(backend_id).unwrap();
    let mut buf_b = vec![0u8; 4096];
    let slice_b: &mut [u8] = &mut buf_b;
    engine.prepare_read(backend_id, second, fd, 0, &mut [slice_b]).unwrap();

    engine.wait(first);
    engine.reclaim(backend_id, first).unwrap();
    engine.wait(second);
    engine.reclaim(backend_id, second).unwrap();

    // And a backend is not permanently exhausted either: a third acquire
    // after both completions reclaim still succeeds without blocking.
    let third = engine.acquire_nb(backend_id).unwrap();
    assert!(third.is_some());
}

#[test]
fn release_is_only_valid_from_handed_out() {
    let (engine, backend_id) = engine_with(AioConfig::default());
    let file = scratch_file(&[0u8; 4096]);
    let fd = file.as_file().as_raw_fd();
    let handle_ref = engine.acquire(backend_id).unwrap();
    let mut buf = vec![0u8; 4096];
    let slice: &mut [u8] = &mut buf;
    engine.prepare_read(backend_id, handle_ref, fd, 0, &mut [slice]).unwrap();
    engine.wait(handle_ref);
    // handle is now terminal, not HANDED_OUT; release must fail.
    assert!(engine.release(backend_id, handle_ref).is_err());
}

#[test]
fn stale_handle_reference_is_rejected_after_reclaim() {
    let (engine, backend_id) = engine_with(AioConfig::default());
    let handle_ref = engine.acquire(backend_id).unwrap();
    engine.release(backend_id, handle_ref).unwrap();
    // Same index, stale generation: using it again must fail.
    assert!(engine.set_subject(handle_ref, SubjectId::RawFile, 0).is_err());
}

#[test]
fn resource_owner_reclaims_abandoned_handed_out_handle_on_normal_teardown() {
    let (engine, backend_id) = engine_with(AioConfig::default());
    let owner = ResourceOwner::new();
    let handle_ref = engine.acquire(backend_id).unwrap();
    engine.bind_resource_owner(handle_ref, owner.id()).unwrap();
    owner.register(handle_ref);

    owner.teardown(&engine, false);

    // The handle pool should have the slot back: a fresh acquire succeeds
    // immediately without blocking.
    let reacquired = engine.acquire_nb(backend_id).unwrap();
    assert!(reacquired.is_some());
}

#[test]
fn resource_owner_leaves_completed_handle_alone_on_abort() {
    let (engine, backend_id) = engine_with(AioConfig::default());
    let file = scratch_file(&[0u8; 4096]);
    let fd = file.as_file().as_raw_fd();
    let owner = ResourceOwner::new();

    let handle_ref = engine.acquire(backend_id).unwrap();
    engine.bind_resource_owner(handle_ref, owner.id()).unwrap();
    owner.register(handle_ref);
    let mut buf = vec![0u8; 4096];
    let slice: &mut [u8] = &mut buf;
    // SyncMethod runs inline, so prepare_read already leaves the handle
    // terminal (COMPLETED_LOCAL) by the time teardown walks it; this
    // exercises the "left alone" branch rather than force_submit, which is
    // the realistic outcome for a synchronous method backend.
    engine.prepare_read(backend_id, handle_ref, fd, 0, &mut [slice]).unwrap();
    owner.teardown(&engine, true);
}

#[test]
fn metrics_count_completed_reads() {
    let (engine, backend_id) = engine_with(AioConfig::default());
    let file = scratch_file(&[1u8; 4096]);
    let fd = file.as_file().as_raw_fd();
    let handle_ref = engine.acquire(backend_id).unwrap();
    let mut buf = vec![0u8; 4096];
    let slice: &mut [u8] = &mut buf;
    engine.prepare_read(backend_id, handle_ref, fd, 0, &mut [slice]).unwrap();
    engine.wait(handle_ref);
    let snapshot = engine.metrics().snapshot();
    assert_eq!(snapshot.reads, 1);
    assert_eq!(snapshot.bytes_read, 4096);
}

#[test]
fn second_bounce_buffer_is_rejected_until_the_first_is_associated() {
    let (engine, backend_id) = engine_with(AioConfig::default());
    let handle_ref = engine.acquire(backend_id).unwrap();

    let bb = engine.acquire_bounce_buffer(backend_id).unwrap();
    assert!(engine.acquire_bounce_buffer(backend_id).is_err());

    engine.associate_bounce_buffer(backend_id, handle_ref, bb).unwrap();
    // Attached to the handle now; this backend may hand out another.
    let second = engine.acquire_bounce_buffer(backend_id).unwrap();
    assert_ne!(bb, second);
}

#[test]
fn snapshot_handles_reports_idle_pool_at_startup() {
    let (engine, _backend_id) = engine_with(AioConfig::default());
    let snapshot = engine.snapshot_handles();
    assert!(!snapshot.is_empty());
    assert!(snapshot.iter().all(|h| h.state == aio_engine::HandleState::Idle));
}
