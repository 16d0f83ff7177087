//! The adaptive look-ahead read stream (spec §4.7): consumes block numbers
//! from a caller-supplied [`BlockSource`], coalesces consecutive blocks into
//! physical reads up to `buffer_io_size`, issues prefetch advice when
//! random, and produces a serial sequence of buffers to the consumer.
//!
//! The buffer-pool pin/unpin machinery is out of scope (spec §1); this
//! stream owns its own fixed pool of page-sized scratch slots instead of
//! delegating to an external pinned-buffer pool (see DESIGN.md, Open
//! Question: read-stream buffer ownership).

mod distance;

pub use distance::{DistanceController, Regime};

use std::collections::VecDeque;
use std::sync::Arc;

use crate::backend::BackendId;
use crate::engine::AioEngine;
use crate::handle::HandleRef;
use crate::subject::SubjectId;

/// A relation block number. `INVALID_BLOCK` is the callback's "end of
/// stream" sentinel (spec §4.7 "a callback return of invalid block number").
pub type BlockNumber = u32;
pub const INVALID_BLOCK: BlockNumber = u32::MAX;

/// Page size used for every read-stream scratch slot. Matches PostgreSQL's
/// default `BLCKSZ`.
pub const BLOCK_SIZE: usize = 8192;

/// A single vectored read is capped at this many iovecs regardless of how
/// many blocks `buffer_io_size` would otherwise coalesce, mirroring a real
/// platform's `IOV_MAX`. Exercises the "short accept" path in spec §4.7
/// step 3 whenever a coalesced range grows past it.
const DEFAULT_MAX_IOVECS_PER_IO: usize = 32;

/// External collaborator supplying the block sequence and cache status
/// (spec §1 "consumes block numbers from a caller-supplied callback";
/// buffer-pool pin/unpin is out of scope, so this trait only ever asks
/// "do you already have this one").
pub trait BlockSource: Send {
    /// Returns the next block number to read, or `None` at end of stream.
    fn next_block(&mut self) -> Option<BlockNumber>;

    /// True if `block` is already resident and needs no I/O (regime A).
    fn is_cached(&self, block: BlockNumber) -> bool;
}

/// Flags accepted by [`ReadStream::begin`] (spec §6 "Flags:
/// `{SEQUENTIAL, FULL, MAINTENANCE}`"). Hand-rolled rather than pulling in
/// the `bitflags` crate, matching [`crate::config::DirectIoFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadStreamFlags(u8);

impl ReadStreamFlags {
    pub const NONE: ReadStreamFlags = ReadStreamFlags(0);
    /// The caller already knows access is sequential; suppresses advice.
    pub const SEQUENTIAL: ReadStreamFlags = ReadStreamFlags(0b001);
    /// Start at maximum look-ahead distance rather than ramping up from 1.
    pub const FULL: ReadStreamFlags = ReadStreamFlags(0b010);
    /// Use `maintenance_io_concurrency` instead of `effective_io_concurrency`.
    pub const MAINTENANCE: ReadStreamFlags = ReadStreamFlags(0b100);

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for ReadStreamFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        ReadStreamFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct ReadStreamConfig {
    max_pinned_buffers: usize,
    buffer_io_size: u32,
    max_ios: usize,
    advice_enabled: bool,
    max_iovecs_per_io: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeState {
    Pending,
    InFlight { handle_ref: HandleRef, advice_issued: bool },
    Ready,
}

#[derive(Debug, Clone, Copy)]
struct Range {
    start_slot: usize,
    start_block: BlockNumber,
    len: u32,
    consumed: u32,
    /// Whether this range continued the stream's running sequential cursor
    /// when it was opened (spec §4.7 "sequential-detection cursor").
    sequential: bool,
    state: RangeState,
}

struct Slot {
    buffer: Box<[u8]>,
}

/// One buffer handed back by [`ReadStream::next`], borrowed for as long as
/// the caller holds onto it (the next `next`/`end` call may reuse the slot).
pub struct ReadBuffer<'a> {
    pub block: BlockNumber,
    pub bytes: &'a [u8],
}

/// Per-caller look-ahead engine sitting on top of [`AioEngine`] (spec §4.7).
pub struct ReadStream {
    engine: Arc<AioEngine>,
    backend_id: BackendId,
    fd: i32,
    subject: SubjectId,
    subject_data: u64,
    config: ReadStreamConfig,
    source: Box<dyn BlockSource>,

    slots: Vec<Slot>,
    head: usize,

    pinned: usize,
    pending_read_nblocks: usize,
    ios_in_progress: usize,

    pending: Option<Range>,
    ranges: VecDeque<Range>,

    distance: DistanceController,
    next_expected: Option<BlockNumber>,
    unget: Option<BlockNumber>,
    ended: bool,
    drained: bool,
}

impl ReadStream {
    /// Begins a new stream (spec §6 `begin`). `fd` is an already-open,
    /// caller-owned file description for the relation/fork being scanned;
    /// relation-file reopen machinery is out of scope (spec §1).
    pub fn begin(
        engine: Arc<AioEngine>,
        backend_id: BackendId,
        fd: i32,
        subject: SubjectId,
        subject_data: u64,
        flags: ReadStreamFlags,
        source: Box<dyn BlockSource>,
    ) -> Self {
        let aio_config = engine.config();
        let maintenance = flags.contains(ReadStreamFlags::MAINTENANCE);
        let max_ios = aio_config.effective_max_ios(maintenance);
        let advice_enabled = !aio_config.advice_disabled_by_config(maintenance)
            && !aio_config.direct_io_forbids_advice()
            && !flags.contains(ReadStreamFlags::SEQUENTIAL);
        // Spec §4.7: "Upper bound on pinned buffers is max(4 * max_ios,
        // buffer_io_size)".
        let max_pinned_buffers = (4 * max_ios).max(aio_config.buffer_io_size as usize);
        let capacity = max_pinned_buffers + 1; // + one scratch slot

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot { buffer: vec![0u8; BLOCK_SIZE].into_boxed_slice() });

        let config = ReadStreamConfig {
            max_pinned_buffers,
            buffer_io_size: aio_config.buffer_io_size,
            max_ios,
            advice_enabled,
            max_iovecs_per_io: DEFAULT_MAX_IOVECS_PER_IO,
        };

        let distance = DistanceController::new(
            max_pinned_buffers as u32,
            config.buffer_io_size,
            max_ios as u32,
            advice_enabled,
            flags.contains(ReadStreamFlags::FULL),
        );

        let mut stream = Self {
            engine,
            backend_id,
            fd,
            subject,
            subject_data,
            config,
            source,
            slots,
            head: 0,
            pinned: 0,
            pending_read_nblocks: 0,
            ios_in_progress: 0,
            pending: None,
            ranges: VecDeque::new(),
            distance,
            next_expected: None,
            unget: None,
            ended: false,
            drained: false,
        };
        stream.look_ahead();
        stream
    }

    pub fn distance(&self) -> u32 {
        self.distance.distance()
    }

    /// Upper bound on `pinned + pending_read_nblocks` for the lifetime of
    /// this stream (spec §8 invariant 7), fixed at `begin` time.
    pub fn max_pinned_buffers(&self) -> usize {
        self.config.max_pinned_buffers
    }

    pub fn pinned(&self) -> usize {
        self.pinned
    }

    pub fn pending_read_nblocks(&self) -> usize {
        self.pending_read_nblocks
    }

    pub fn ios_in_progress(&self) -> usize {
        self.ios_in_progress
    }

    fn take_next_block(&mut self) -> Option<BlockNumber> {
        if let Some(block) = self.unget.take() {
            return Some(block);
        }
        self.source.next_block()
    }

    /// Pushes a block back for the next call to read (spec §4.7 "a
    /// single-slot 'unget' register").
    #[allow(dead_code)]
    fn unget(&mut self, block: BlockNumber) {
        debug_assert!(self.unget.is_none(), "unget register already occupied");
        self.unget = Some(block);
    }

    /// Look-ahead loop (spec §4.7): grows pending/in-flight work while
    /// budget remains.
    fn look_ahead(&mut self) {
        if self.ended {
            return;
        }
        while self.pinned + self.pending_read_nblocks < self.distance() as usize
            && self.ios_in_progress < self.config.max_ios
        {
            let Some(block) = self.take_next_block() else {
                self.close_pending_if_any();
                self.ended = true;
                self.distance.end_of_stream();
                return;
            };
            self.observe_block(block);
        }
        // Budget or in-flight cap reached with nothing ready to hand out:
        // submit the range accumulated so far rather than waiting for a
        // future call to extend it, or a small distance (regime A's
        // initial 1) would stall the stream forever.
        if self.ranges.is_empty() {
            self.close_pending_if_any();
        }
    }

    fn observe_block(&mut self, block: BlockNumber) {
        let is_sequential = self.next_expected == Some(block);
        self.next_expected = Some(block + 1);

        if self.source.is_cached(block) {
            self.close_pending_if_any();
            self.fill_cached_slot(block);
            self.distance.observe_cached();
            return;
        }

        let extends = self.pending.as_ref().is_some_and(|pending| {
            pending.start_block + pending.len == block && pending.len < self.config.buffer_io_size
        });
        if extends {
            self.grow_pending(block);
        } else {
            self.close_pending_if_any();
            self.open_pending(block, is_sequential);
        }
        if self
            .pending
            .as_ref()
            .is_some_and(|p| p.len >= self.config.buffer_io_size || p.start_slot + p.len as usize >= self.slots.len())
        {
            self.close_pending_if_any();
        }
    }

    fn fill_cached_slot(&mut self, block: BlockNumber) {
        let start_slot = self.head;
        self.head = (self.head + 1) % self.slots.len();
        self.ranges.push_back(Range {
            start_slot,
            start_block: block,
            len: 1,
            consumed: 0,
            sequential: true,
            state: RangeState::Ready,
        });
        self.pinned += 1;
    }

    fn open_pending(&mut self, block: BlockNumber, sequential: bool) {
        let start_slot = self.head;
        self.head = (self.head + 1) % self.slots.len();
        self.pending = Some(Range {
            start_slot,
            start_block: block,
            len: 1,
            consumed: 0,
            sequential,
            state: RangeState::Pending,
        });
        self.pending_read_nblocks += 1;
    }

    fn grow_pending(&mut self, block: BlockNumber) {
        debug_assert_eq!(self.head, {
            let pending = self.pending.as_ref().unwrap();
            (pending.start_slot + pending.len as usize) % self.slots.len()
        });
        let _ = block;
        self.head = (self.head + 1) % self.slots.len();
        let pending = self.pending.as_mut().unwrap();
        pending.len += 1;
        self.pending_read_nblocks += 1;
    }

    /// Closes the pending range (if any) by submitting it through the
    /// engine (spec §4.7 step 3 "`StartReadBuffers`").
    fn close_pending_if_any(&mut self) {
        let Some(range) = self.pending.take() else { return };
        self.start_read(range);
    }

    fn start_read(&mut self, mut range: Range) {
        let accept = range.len.min(self.config.max_iovecs_per_io as u32).max(1);
        if accept < range.len {
            let suffix = Range {
                start_slot: (range.start_slot + accept as usize) % self.slots.len(),
                start_block: range.start_block + accept,
                len: range.len - accept,
                consumed: 0,
                sequential: true,
                state: RangeState::Pending,
            };
            range.len = accept;
            self.pending = Some(suffix);
        }

        let handle_ref = match self.engine.acquire(self.backend_id) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "read stream failed to acquire a handle; dropping range");
                self.pending_read_nblocks -= range.len as usize;
                return;
            }
        };
        if let Err(e) = self.engine.set_subject(handle_ref, self.subject, self.subject_data) {
            tracing::warn!(error = %e, "read stream failed to set subject");
        }

        let advice_issued = !range.sequential && self.config.advice_enabled;
        let offset = range.start_block as u64 * BLOCK_SIZE as u64;
        let end = range.start_slot + range.len as usize;
        let mut iov: Vec<&mut [u8]> = self.slots[range.start_slot..end]
            .iter_mut()
            .map(|slot| slot.buffer.as_mut())
            .collect();

        if let Err(e) = self.engine.prepare_read(self.backend_id, handle_ref, self.fd, offset, &mut iov) {
            tracing::warn!(error = %e, "read stream failed to prepare a read");
            let _ = self.engine.release(self.backend_id, handle_ref);
            self.pending_read_nblocks -= range.len as usize;
            return;
        }

        self.ios_in_progress += 1;
        self.distance.observe_io(advice_issued);
        range.state = RangeState::InFlight { handle_ref, advice_issued };
        self.ranges.push_back(range);
    }

    /// Consumes the next buffer (spec §6 `next`). Returns `None` once the
    /// stream is exhausted.
    pub fn next(&mut self) -> Option<ReadBuffer<'_>> {
        loop {
            if self.ranges.is_empty() {
                self.look_ahead();
                if self.ranges.is_empty() {
                    return None;
                }
            }

            if let RangeState::InFlight { handle_ref, .. } = self.ranges.front().unwrap().state {
                let result = self.engine.wait(handle_ref);
                self.ios_in_progress -= 1;
                if !result.is_ok() {
                    tracing::warn!(?handle_ref, detail = result.detail, "read stream I/O failed");
                }
                if let Err(e) = self.engine.reclaim(self.backend_id, handle_ref) {
                    tracing::warn!(error = %e, "read stream failed to reclaim a completed handle");
                }
                let front = self.ranges.front_mut().unwrap();
                self.pending_read_nblocks -= front.len as usize;
                self.pinned += front.len as usize;
                front.state = RangeState::Ready;
            }

            let front = self.ranges.front_mut().unwrap();
            let slot_index = (front.start_slot + front.consumed as usize) % self.slots.len();
            let block = front.start_block + front.consumed;
            front.consumed += 1;
            let exhausted = front.consumed >= front.len;
            self.pinned -= 1;
            if exhausted {
                self.ranges.pop_front();
            }

            self.look_ahead();
            let bytes: &[u8] = &self.slots[slot_index].buffer;
            return Some(ReadBuffer { block, bytes });
        }
    }

    fn drain(&mut self) {
        if self.drained {
            return;
        }
        self.drained = true;
        self.close_pending_if_any();
        while let Some(range) = self.ranges.pop_front() {
            if let RangeState::InFlight { handle_ref, .. } = range.state {
                let _ = self.engine.wait(handle_ref);
                self.ios_in_progress -= 1;
                let _ = self.engine.reclaim(self.backend_id, handle_ref);
            }
        }
        self.pinned = 0;
        self.pending_read_nblocks = 0;
    }

    /// Ends the stream (spec §6 `end`): drains outstanding I/O so that
    /// `pinned == 0 && ios_in_progress == 0` afterward (spec §8 invariant 6).
    pub fn end(&mut self) {
        self.drain();
    }
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        self.drain();
    }
}
