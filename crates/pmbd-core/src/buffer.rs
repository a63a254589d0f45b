//! Per-device DRAM write buffer.
//!
//! Each buffer is a fixed ring of block-sized slots shadowing recently
//! written physical blocks. The ring is described by `pos_dirty`,
//! `pos_clean`, and `num_dirty`:
//!
//! ```text
//!    pos_dirty --v       v-- pos_clean
//!        [  clean  | DIRTY | clean  ]
//! ```
//!
//! The half-open segment `[pos_dirty, pos_clean)` (mod capacity) holds
//! exactly `num_dirty` slots, all marked dirty. Allocation advances
//! `pos_clean`; flushing advances `pos_dirty`. The buffer lock protects
//! the triple; the flush lock serialises flushers and owns the sort
//! scratch.
//!
//! The flush algorithm itself lives on the device (it needs the region,
//! the permission gate, and the checksum store); this module provides the
//! ring mechanics the device drives: reserve, snapshot, commit.

use parking_lot::{Mutex, MutexGuard};
use pmbd_error::PmbdError;
use pmbd_region::ByteArena;
use pmbd_types::{Bbn, Pbn};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, trace};

use crate::config::BufferConfig;
use crate::pbi::BlockLink;

/// Dirty ratio at which the background flusher starts unconditionally.
pub const FLUSH_HIGH_WATERMARK: f64 = 0.7;
/// Dirty ratio the flusher drains down to, and the idle-flush floor.
pub const FLUSH_LOW_WATERMARK: f64 = 0.1;
/// Device idle time that triggers an early flush (2 ms).
pub const FLUSH_IDLE_TIMEOUT_NS: u64 = 2_000_000;
/// Background flusher tick.
pub const SYNCER_TICK: Duration = Duration::from_millis(1);

/// Who asked for a flush; decides the skip-if-done-already check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushCaller {
    /// A writer that found the buffer full. Skips when no longer full.
    Allocator,
    /// The background flusher. Skips when the buffer is empty.
    Syncer,
    /// Barrier or teardown. Never skips.
    Destroyer,
}

/// Per-slot metadata. If `dirty` is set, `pbn` names a block whose PBI
/// links back to this slot.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlotInfo {
    pub pbn: Option<Pbn>,
    pub dirty: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct RingState {
    pos_dirty: u64,
    pos_clean: u64,
    num_dirty: u64,
}

/// Sort scratch owned by the flush lock: holding the guard is holding
/// the exclusive right to flush.
#[derive(Debug, Default)]
pub struct SortScratch {
    pub entries: Vec<(Pbn, Bbn)>,
}

#[derive(Debug)]
pub struct WriteBuffer {
    id: usize,
    capacity: u64,
    block_size: usize,
    batch: u64,
    space: ByteArena,
    slots: Box<[Mutex<SlotInfo>]>,
    ring: Mutex<RingState>,
    flush: Mutex<SortScratch>,
}

/// Snapshot of one buffer's ring state.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BufferMetrics {
    pub id: usize,
    pub capacity: u64,
    pub num_dirty: u64,
    pub pos_dirty: u64,
    pub pos_clean: u64,
}

impl WriteBuffer {
    #[must_use]
    pub fn new(id: usize, config: &BufferConfig, block_size: u32) -> Self {
        let block_size = block_size as usize;
        let capacity = config.size_bytes / block_size as u64;
        let mut slots = Vec::with_capacity(capacity as usize);
        slots.resize_with(capacity as usize, || Mutex::new(SlotInfo::default()));
        info!(
            target: "pmbd::buffer",
            event = "buffer_create",
            id,
            capacity,
            batch = config.batch
        );
        let scratch = SortScratch {
            entries: Vec::with_capacity(capacity as usize),
        };
        Self {
            id,
            capacity,
            block_size,
            batch: config.batch,
            space: ByteArena::new(capacity as usize * block_size),
            slots: slots.into_boxed_slice(),
            ring: Mutex::new(RingState::default()),
            flush: Mutex::new(scratch),
        }
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn batch(&self) -> u64 {
        self.batch
    }

    #[must_use]
    pub fn num_dirty(&self) -> u64 {
        self.ring.lock().num_dirty
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_dirty() == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.num_dirty() >= self.capacity
    }

    #[must_use]
    pub fn above_high_watermark(&self) -> bool {
        self.num_dirty() as f64 >= self.capacity as f64 * FLUSH_HIGH_WATERMARK
    }

    #[must_use]
    pub fn above_low_watermark(&self) -> bool {
        self.num_dirty() as f64 >= self.capacity as f64 * FLUSH_LOW_WATERMARK
    }

    #[must_use]
    pub fn metrics(&self) -> BufferMetrics {
        let ring = self.ring.lock();
        BufferMetrics {
            id: self.id,
            capacity: self.capacity,
            num_dirty: ring.num_dirty,
            pos_dirty: ring.pos_dirty,
            pos_clean: ring.pos_clean,
        }
    }

    fn next_pos(&self, pos: u64) -> u64 {
        (pos + 1) % self.capacity
    }

    #[must_use]
    pub fn slot(&self, bbn: Bbn) -> MutexGuard<'_, SlotInfo> {
        self.slots[usize::try_from(bbn.0).expect("bbn fits usize")].lock()
    }

    /// Byte offset of a slot inside the buffer space.
    fn slot_offset(&self, bbn: Bbn) -> usize {
        usize::try_from(bbn.0).expect("bbn fits usize") * self.block_size
    }

    /// Copy out of a slot. Caller holds the owning block's PBI lock.
    pub fn read_slot(&self, bbn: Bbn, offset_in_block: usize, dst: &mut [u8]) {
        debug_assert!(offset_in_block + dst.len() <= self.block_size);
        self.space.read_into(self.slot_offset(bbn) + offset_in_block, dst);
    }

    /// Copy into a slot. Caller holds the owning block's PBI lock.
    pub fn write_slot(&self, bbn: Bbn, offset_in_block: usize, src: &[u8]) {
        debug_assert!(offset_in_block + src.len() <= self.block_size);
        self.space.write_from(self.slot_offset(bbn) + offset_in_block, src);
    }

    /// Whole-slot copy into a caller buffer.
    #[must_use]
    pub fn slot_bytes(&self, bbn: Bbn) -> Vec<u8> {
        self.space.to_vec(self.slot_offset(bbn), self.block_size)
    }

    /// Resolve a block's buffer link, validating the back-pointer.
    ///
    /// Caller holds the block's PBI lock. A link whose slot does not point
    /// back at the block means the PBI ↔ BBI invariant broke somewhere.
    #[must_use]
    pub fn lookup(&self, pbn: Pbn, link: &BlockLink) -> Option<Bbn> {
        let bbn = link.bbn?;
        if bbn.0 >= self.capacity {
            panic!(
                "{}",
                PmbdError::InternalInvariant(format!(
                    "{pbn} links to {bbn} beyond buffer {} capacity {}",
                    self.id, self.capacity
                ))
            );
        }
        let slot = self.slot(bbn);
        if slot.pbn != Some(pbn) {
            panic!(
                "{}",
                PmbdError::InternalInvariant(format!(
                    "{pbn} links to {bbn} but the slot points back to {:?}",
                    slot.pbn
                ))
            );
        }
        Some(bbn)
    }

    /// Reserve the slot at `pos_clean` for `pbn`, or report a full buffer.
    ///
    /// The slot is marked dirty and linked before any data lands in it;
    /// that is safe because the caller holds the block's PBI lock, which
    /// excludes every reader of the block. The caller still has to set the
    /// PBI side of the link.
    #[must_use]
    pub fn try_reserve(&self, pbn: Pbn) -> Option<Bbn> {
        let mut ring = self.ring.lock();
        if ring.num_dirty >= self.capacity {
            return None;
        }
        let pos = ring.pos_clean;
        ring.pos_clean = self.next_pos(pos);
        ring.num_dirty += 1;

        // Mark while the buffer lock is still held: the instant
        // `num_dirty` grows, this slot is inside the dirty segment a
        // flusher may scan, and it must never look clean there.
        let bbn = Bbn(pos);
        {
            let mut slot = self.slot(bbn);
            slot.dirty = true;
            slot.pbn = Some(pbn);
        }
        drop(ring);

        trace!(
            target: "pmbd::buffer",
            event = "slot_reserve",
            buffer = self.id,
            pbn = pbn.0,
            bbn = bbn.0
        );
        Some(bbn)
    }

    /// Take the flush lock; the guard carries the sort scratch.
    #[must_use]
    pub fn begin_flush(&self) -> MutexGuard<'_, SortScratch> {
        self.flush.lock()
    }

    /// Snapshot up to `n_target` dirty `(pbn, bbn)` pairs into the scratch,
    /// scanning from `pos_dirty`. Returns the scan start position.
    ///
    /// Caller holds the flush lock. Finding a clean slot inside the dirty
    /// segment is fatal: allocation marks slots dirty while still under
    /// the buffer lock, so the segment can never contain one.
    pub fn collect_dirty(&self, scratch: &mut Vec<(Pbn, Bbn)>, n_target: u64) -> u64 {
        scratch.clear();
        let ring = self.ring.lock();
        let to_scan = n_target.min(ring.num_dirty);
        let start = ring.pos_dirty;
        let mut pos = start;
        for _ in 0..to_scan {
            let bbn = Bbn(pos);
            let slot = self.slot(bbn);
            let Some(pbn) = slot.pbn.filter(|_| slot.dirty) else {
                panic!(
                    "{}",
                    PmbdError::InternalInvariant(format!(
                        "clean slot {bbn} inside the dirty segment of buffer {} \
                         (pos_dirty={} pos_clean={} num_dirty={})",
                        self.id, ring.pos_dirty, ring.pos_clean, ring.num_dirty
                    ))
                );
            };
            scratch.push((pbn, bbn));
            pos = self.next_pos(pos);
        }
        start
    }

    /// Advance the ring past `cleaned` flushed slots.
    ///
    /// `pos_dirty` advances by count, not by sort order; the ring stays
    /// well-formed because the scan in [`Self::collect_dirty`] started at
    /// `pos_dirty`, so the cleaned set is a prefix of the dirty segment
    /// by count.
    pub fn commit_flush(&self, scan_start: u64, cleaned: u64) {
        if cleaned == 0 {
            return;
        }
        let mut ring = self.ring.lock();
        ring.pos_dirty = (scan_start + cleaned) % self.capacity;
        ring.num_dirty = ring.num_dirty.checked_sub(cleaned).unwrap_or_else(|| {
            panic!(
                "{}",
                PmbdError::InternalInvariant(format!(
                    "buffer {} cleaned {cleaned} slots with only {} dirty",
                    self.id, ring.num_dirty
                ))
            )
        });
    }

    /// Whether the ring triple, the slot dirty bits, and the segment
    /// layout agree (testable property of the ring).
    #[must_use]
    pub fn ring_is_well_formed(&self) -> bool {
        let ring = self.ring.lock();
        let marked_dirty = (0..self.capacity)
            .filter(|bbn| self.slot(Bbn(*bbn)).dirty)
            .count() as u64;
        let distance = (ring.pos_clean + self.capacity - ring.pos_dirty) % self.capacity;
        let segment_ok = if ring.num_dirty == self.capacity {
            ring.pos_dirty == ring.pos_clean
        } else {
            distance == ring.num_dirty
        };
        marked_dirty == ring.num_dirty && segment_ok
    }
}

/// Handle for one background flusher thread.
///
/// Shutdown is cooperative: the stop flag is checked between batches and
/// the worker drains its buffer before exiting. Drop joins, so a device
/// going away never leaves a flusher running.
#[derive(Debug)]
pub struct Syncer {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl Syncer {
    pub(crate) fn spawn<F>(name: String, body: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let join = std::thread::Builder::new()
            .name(name)
            .spawn(move || body(stop_flag))
            .expect("spawn syncer thread");
        Self {
            stop,
            join: Some(join),
        }
    }

    /// Request shutdown and block until the worker has drained and exited.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Syncer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
