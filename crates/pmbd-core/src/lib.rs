#![forbid(unsafe_code)]
//! Persistent-memory block device emulator core.
//!
//! A [`Device`] presents one byte-addressable memory region as a block
//! device with emulated latency/bandwidth and in-process corruption
//! protection. The request surface is `read` / `write` / `flush`;
//! everything else (the permission gate, the DRAM write buffer with its
//! background flushers, the checksum table, the barrier discipline) hangs
//! off the configuration record.
//!
//! Write path shapes:
//!
//! - **unbuffered**: PBI locks over the extent, one RW window, the
//!   policy-selected store, optional verify and checksum refresh;
//! - **buffered**: each block lands in a DRAM slot; background flushers
//!   sort the dirty set by block number and stream maximal contiguous
//!   runs through one RW window each, which is what amortises the
//!   O(pages) cost of PTE windows.
//!
//! FUA on the buffered path intentionally writes twice: the slot copy is
//! what subsequent reads see, the direct copy is what makes the write
//! durable before completion.

pub mod buffer;
pub mod checksum;
pub mod config;
pub mod pbi;
pub mod stats;

pub use buffer::{BufferMetrics, FlushCaller, WriteBuffer};
pub use config::{BufferConfig, DeviceConfig};
pub use stats::{Stage, StatsSnapshot};

use buffer::{FLUSH_IDLE_TIMEOUT_NS, SYNCER_TICK, Syncer};
use checksum::ChecksumStore;
use parking_lot::{Mutex, RwLock};
use pmbd_emul::Emulator;
use pmbd_error::{PmbdError, Result};
use pmbd_region::{CopyPolicy, MemPool, MemRegion, copy};
use pmbd_types::{Bbn, CacheMode, DeviceGeometry, Dir, Pbn, ReqFlags, SectorNumber, SimMode};
use stats::DeviceStats;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info};

/// One activated PMBD device.
///
/// Dropping the device stops and joins the background flushers (which
/// drain their buffers first), then tears the region down.
pub struct Device {
    inner: Arc<DeviceInner>,
    syncers: Vec<Syncer>,
}

struct DeviceInner {
    config: DeviceConfig,
    geometry: DeviceGeometry,
    policy: CopyPolicy,
    region: MemRegion,
    pbi: pbi::PbiTable,
    checksums: Option<ChecksumStore>,
    buffers: Vec<WriteBuffer>,
    emul: Emulator,
    stats: DeviceStats,
    /// Writers hold this shared while admitting; the barrier holds it
    /// exclusively while draining.
    barrier_gate: RwLock<()>,
    in_flight_writes: AtomicU64,
    /// Test stub invoked between RW-window close and write verification.
    verify_stub: Mutex<Option<Box<dyn Fn(&MemRegion) + Send + Sync>>>,
}

impl Device {
    /// Activate a device: validate the configuration, map and protect the
    /// region, build the index/checksum/buffer spaces, start the
    /// background flushers.
    pub fn activate(pool: &MemPool, config: DeviceConfig) -> Result<Self> {
        let config = config.validated()?;
        let geometry = config.geometry()?;
        let total_bytes = usize::try_from(geometry.total_bytes())
            .map_err(|_| PmbdError::BadConfig("capacity does not fit usize".to_owned()))?;

        let region = pool.map(total_bytes, config.wrprot, config.wpmode)?;
        region.set_cacheability(config.cache)?;

        let policy = CopyPolicy {
            nts: config.nts,
            ntl: config.ntl,
            clflush: config.clflush,
            subupdate: config.subupdate,
            cache: config.cache,
        };

        let buffers = match &config.buffer {
            Some(buffer_config) => (0..buffer_config.count)
                .map(|id| WriteBuffer::new(id as usize, buffer_config, geometry.block_size()))
                .collect(),
            None => Vec::new(),
        };

        let inner = Arc::new(DeviceInner {
            geometry,
            policy,
            region,
            pbi: pbi::PbiTable::new(geometry.total_blocks()),
            checksums: config
                .checksum
                .then(|| ChecksumStore::new(geometry.total_blocks(), geometry.block_size())),
            buffers,
            emul: Emulator::new(config.emul),
            stats: DeviceStats::new(config.timestat),
            barrier_gate: RwLock::new(()),
            in_flight_writes: AtomicU64::new(0),
            verify_stub: Mutex::new(None),
            config,
        });

        let syncers = (0..inner.buffers.len())
            .map(|idx| {
                let worker = Arc::clone(&inner);
                Syncer::spawn(format!("pmbd-syncer{idx}"), move |stop| {
                    worker.syncer_worker(idx, &stop);
                })
            })
            .collect();

        info!(
            target: "pmbd::device",
            event = "device_activate",
            sectors = inner.geometry.num_sectors(),
            blocks = inner.geometry.total_blocks(),
            cache = inner.config.cache.as_str(),
            wrprot = inner.config.wrprot,
            buffered = !inner.buffers.is_empty()
        );

        Ok(Self { inner, syncers })
    }

    /// Read `dst.len()` bytes starting at `sector`.
    pub fn read(&self, sector: SectorNumber, dst: &mut [u8]) -> Result<()> {
        self.inner.submit_read(sector, dst)
    }

    /// Write `src` starting at `sector`.
    pub fn write(&self, sector: SectorNumber, src: &[u8], flags: ReqFlags) -> Result<()> {
        self.inner.submit_write(sector, src, flags)
    }

    /// Flush: an empty FLUSH-flagged write. Returns only after every
    /// previously completed write is durable in the region (when `wb` is
    /// enabled; otherwise it completes immediately).
    pub fn flush(&self) -> Result<()> {
        self.write(SectorNumber(0), &[], ReqFlags::FLUSH)
    }

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn geometry(&self) -> DeviceGeometry {
        self.inner.geometry
    }

    /// The backing region, for diagnostics and durability checks.
    #[must_use]
    pub fn region(&self) -> &MemRegion {
        &self.inner.region
    }

    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    #[must_use]
    pub fn buffer_metrics(&self) -> Vec<BufferMetrics> {
        self.inner.buffers.iter().map(WriteBuffer::metrics).collect()
    }

    /// Synchronously drain one buffer (diagnostic / test control).
    pub fn drain_buffer(&self, idx: usize) -> Result<u64> {
        let buffer = self.inner.buffers.get(idx).ok_or_else(|| {
            PmbdError::BadConfig(format!("no buffer {idx} on this device"))
        })?;
        let mut cleaned = 0;
        while !buffer.is_empty() {
            cleaned += self
                .inner
                .check_and_flush(buffer, buffer.capacity(), FlushCaller::Destroyer);
        }
        Ok(cleaned)
    }

    /// Synchronously drain every buffer.
    pub fn drain_buffers(&self) -> Result<u64> {
        let mut cleaned = 0;
        for idx in 0..self.inner.buffers.len() {
            cleaned += self.drain_buffer(idx)?;
        }
        Ok(cleaned)
    }

    /// The block a sector belongs to, and its current buffer link.
    #[doc(hidden)]
    #[must_use]
    pub fn debug_block_link(&self, pbn: Pbn) -> Option<Bbn> {
        self.inner.pbi.lock(pbn).bbn
    }

    /// Direct buffer access for invariant checks in tests.
    #[doc(hidden)]
    #[must_use]
    pub fn debug_buffers(&self) -> &[WriteBuffer] {
        &self.inner.buffers
    }

    /// Install a stub run between RW-window close and write verification.
    #[doc(hidden)]
    pub fn set_verify_stub(&self, stub: impl Fn(&MemRegion) + Send + Sync + 'static) {
        *self.inner.verify_stub.lock() = Some(Box::new(stub));
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Stop flushers first; each drains its buffer before exiting, so
        // nothing dirty is lost when the region goes away.
        for syncer in &mut self.syncers {
            syncer.shutdown();
        }
        info!(target: "pmbd::device", event = "device_teardown");
    }
}

impl DeviceInner {
    fn buffered(&self) -> bool {
        !self.buffers.is_empty()
    }

    /// Buffer routing: `(pbn / stride) % count`.
    fn route(&self, pbn: Pbn) -> &WriteBuffer {
        let buffer_config = self.config.buffer.as_ref().expect("buffered device");
        let idx = (pbn.0 / buffer_config.stride) % u64::from(buffer_config.count);
        &self.buffers[usize::try_from(idx).expect("buffer index fits usize")]
    }

    // ── dispatcher ─────────────────────────────────────────────────────

    fn submit_read(&self, sector: SectorNumber, dst: &mut [u8]) -> Result<()> {
        let num_sectors = self.geometry.bytes_to_sectors(dst.len());
        let whole_request = self.config.emul.simmode == SimMode::WholeDevice;
        let emul_start = if whole_request {
            self.emul.start(num_sectors, Dir::Read)
        } else {
            0
        };

        let t_work = self.stats.stamp();
        let result = self.read_body(sector, dst);
        self.stats.record_stage(Stage::Work, Dir::Read, t_work);

        if whole_request {
            self.emul.end(num_sectors, Dir::Read, emul_start);
        }
        self.stats.count_request(Dir::Read, num_sectors);
        result
    }

    fn submit_write(&self, sector: SectorNumber, src: &[u8], flags: ReqFlags) -> Result<()> {
        let t_prepare = self.stats.stamp();
        let num_sectors = self.geometry.bytes_to_sectors(src.len());

        // A FLUSH-flagged write runs the barrier before admission.
        if flags.contains(ReqFlags::FLUSH) && self.config.wb {
            self.write_barrier();
        }

        // Admission: hold the gate shared while registering in-flight, so
        // a draining barrier either sees the counter or blocks us here.
        {
            let _gate = self.barrier_gate.read();
            self.in_flight_writes.fetch_add(1, Ordering::AcqRel);
        }
        self.stats.record_stage(Stage::Prepare, Dir::Write, t_prepare);

        let whole_request = self.config.emul.simmode == SimMode::WholeDevice;
        let emul_start = if whole_request {
            self.emul.start(num_sectors, Dir::Write)
        } else {
            0
        };

        let t_work = self.stats.stamp();
        let result = self.write_body(sector, src, flags);
        self.stats.record_stage(Stage::Work, Dir::Write, t_work);

        let t_endio = self.stats.stamp();
        if whole_request {
            self.emul.end(num_sectors, Dir::Write, emul_start);
        }
        self.in_flight_writes.fetch_sub(1, Ordering::AcqRel);
        self.stats.record_stage(Stage::Endio, Dir::Write, t_endio);

        self.stats.count_request(Dir::Write, num_sectors);
        if flags.contains(ReqFlags::FLUSH) {
            self.stats.count_barrier();
        }
        if flags.contains(ReqFlags::FUA) {
            self.stats.count_fua();
        }
        result
    }

    fn check_range(&self, sector: SectorNumber, len: usize) -> Result<()> {
        if !self.geometry.contains(sector, len) {
            return Err(PmbdError::OutOfRange {
                sector: sector.0,
                len_bytes: len,
                capacity_sectors: self.geometry.num_sectors(),
            });
        }
        Ok(())
    }

    fn read_body(&self, sector: SectorNumber, dst: &mut [u8]) -> Result<()> {
        self.check_range(sector, dst.len())?;
        if dst.is_empty() {
            return Ok(());
        }
        self.stats.touch_access_time();
        if self.buffered() {
            self.copy_from_buffered(sector, dst);
        } else {
            self.copy_from_unbuffered(sector, dst);
        }
        Ok(())
    }

    fn write_body(&self, sector: SectorNumber, src: &[u8], flags: ReqFlags) -> Result<()> {
        self.check_range(sector, src.len())?;
        if src.is_empty() {
            // The FLUSH-only case; completing it is not an error.
            return Ok(());
        }
        self.stats.touch_access_time();
        let do_fua = self.config.fua && flags.contains(ReqFlags::FUA);

        if self.buffered() {
            self.copy_to_buffered(sector, src);
            if do_fua {
                // Double write, on purpose: the slot copy is what reads
                // observe, the direct copy is what is durable on return.
                self.copy_to_unbuffered(sector, src, true);
            }
        } else {
            self.copy_to_unbuffered(sector, src, do_fua);
        }
        Ok(())
    }

    // ── region copy wrappers (emulation + stage accounting) ────────────

    /// One store into the region: PM-space emulation bracket, the policy
    /// copy, flush path, slowdown, pause.
    fn memcpy_to_region(&self, offset: usize, src: &[u8], do_fua: bool) {
        let sectors = self.geometry.bytes_to_sectors(src.len());
        let pm_scoped = self.config.emul.simmode == SimMode::PmOnly;
        let emul_start = if pm_scoped {
            self.emul.start(sectors, Dir::Write)
        } else {
            0
        };

        let copy_start = self.emul.clock().now_cycles();
        let t_memcpy = self.stats.stamp();
        copy::store_to_region(&self.region, offset, src, self.policy);
        self.stats.record_stage(Stage::Memcpy, Dir::Write, t_memcpy);
        let copy_end = self.emul.clock().now_cycles();

        if self.policy.clflush || (do_fua && self.policy.fua_needs_clflush()) {
            let t_flush = self.stats.stamp();
            let _ = copy::flush_cache_lines(offset, src.len());
            self.stats.record_stage(Stage::Clflush, Dir::Write, t_flush);
        }

        if self.emul.params().slowdown_enabled() {
            let t_slow = self.stats.stamp();
            self.emul.rdwr_slowdown(Dir::Write, copy_start, copy_end);
            self.stats.record_stage(Stage::Slowdown, Dir::Write, t_slow);
        }
        if pm_scoped {
            self.emul.end(sectors, Dir::Write, emul_start);
        }
        let t_pause = self.stats.stamp();
        self.emul.rdwr_pause(src.len(), Dir::Write);
        self.stats.record_stage(Stage::Pause, Dir::Write, t_pause);
    }

    /// One load from the region, with the same bracketing as stores.
    fn memcpy_from_region(&self, offset: usize, dst: &mut [u8]) {
        let sectors = self.geometry.bytes_to_sectors(dst.len());
        let pm_scoped = self.config.emul.simmode == SimMode::PmOnly;
        let emul_start = if pm_scoped {
            self.emul.start(sectors, Dir::Read)
        } else {
            0
        };

        let copy_start = self.emul.clock().now_cycles();
        let t_memcpy = self.stats.stamp();
        copy::load_from_region(&self.region, offset, dst, self.policy);
        self.stats.record_stage(Stage::Memcpy, Dir::Read, t_memcpy);
        let copy_end = self.emul.clock().now_cycles();

        if self.emul.params().slowdown_enabled() {
            let t_slow = self.stats.stamp();
            self.emul.rdwr_slowdown(Dir::Read, copy_start, copy_end);
            self.stats.record_stage(Stage::Slowdown, Dir::Read, t_slow);
        }
        if pm_scoped {
            self.emul.end(sectors, Dir::Read, emul_start);
        }
        let t_pause = self.stats.stamp();
        self.emul.rdwr_pause(dst.len(), Dir::Read);
        self.stats.record_stage(Stage::Pause, Dir::Read, t_pause);
    }

    /// Read back the just-written range and compare. A mismatch means a
    /// stray store landed inside the RW window; the process dies loudly.
    fn verify_write(&self, offset: usize, expected: &[u8]) {
        if let Some(stub) = self.verify_stub.lock().as_ref() {
            stub(&self.region);
        }
        let t = self.stats.stamp();
        if !self.region.range_eq(offset, expected) {
            let pbn = self.geometry.byte_to_pbn(offset as u64);
            error!(
                target: "pmbd::device",
                event = "write_verification_failed",
                pbn = pbn.0,
                offset,
                len = expected.len()
            );
            panic!("{}", PmbdError::WriteVerificationFailed { pbn: pbn.0 });
        }
        self.stats.record_stage(Stage::Wrverify, Dir::Write, t);
    }

    fn checksum_on_write(&self, offset: u64, len: usize) {
        if let Some(checksums) = &self.checksums {
            let t = self.stats.stamp();
            checksums.on_write(&self.region, self.geometry, offset, len);
            self.stats.record_stage(Stage::Checksum, Dir::Write, t);
        }
    }

    fn checksum_on_read(&self, offset: u64, len: usize) {
        if let Some(checksums) = &self.checksums {
            let t = self.stats.stamp();
            let _ = checksums.on_read(&self.region, self.geometry, offset, len, &self.stats);
            self.stats.record_stage(Stage::Checksum, Dir::Read, t);
        }
    }

    // ── unbuffered paths ───────────────────────────────────────────────

    fn copy_to_unbuffered(&self, sector: SectorNumber, src: &[u8], do_fua: bool) {
        let offset = self.geometry.sector_to_byte(sector);
        let first = self.geometry.byte_to_pbn(offset);
        let last = self.geometry.byte_to_pbn(offset + src.len() as u64 - 1);
        let offset = usize::try_from(offset).expect("offset fits usize");

        let _guards = self
            .config
            .lock
            .then(|| self.pbi.lock_range(first, last));

        let t_rw = self.stats.stamp();
        let window = self.region.gate().open_range(offset, src.len());
        self.stats.record_stage(Stage::SetpagesRw, Dir::Write, t_rw);

        self.memcpy_to_region(offset, src, do_fua);

        let t_ro = self.stats.stamp();
        drop(window);
        self.stats.record_stage(Stage::SetpagesRo, Dir::Write, t_ro);

        if self.config.wrverify {
            self.verify_write(offset, src);
        }
        self.checksum_on_write(offset as u64, src.len());
    }

    fn copy_from_unbuffered(&self, sector: SectorNumber, dst: &mut [u8]) {
        let offset = self.geometry.sector_to_byte(sector);
        let first = self.geometry.byte_to_pbn(offset);
        let last = self.geometry.byte_to_pbn(offset + dst.len() as u64 - 1);

        let _guards = self
            .config
            .lock
            .then(|| self.pbi.lock_range(first, last));

        self.checksum_on_read(offset, dst.len());
        self.memcpy_from_region(usize::try_from(offset).expect("offset fits usize"), dst);
    }

    // ── buffered paths ─────────────────────────────────────────────────

    /// Walk the extent block by block; each block's bytes land in its
    /// buffer slot under the block's PBI lock.
    fn copy_to_buffered(&self, sector: SectorNumber, src: &[u8]) {
        let block_size = self.geometry.block_size() as u64;
        let byte_start = self.geometry.sector_to_byte(sector);
        let byte_end = byte_start + src.len() as u64;
        let first = self.geometry.byte_to_pbn(byte_start);
        let last = self.geometry.byte_to_pbn(byte_end - 1);

        let mut src_pos = 0_usize;
        for pbn in first.0..=last.0 {
            let pbn = Pbn(pbn);
            let block_byte = self.geometry.pbn_to_byte(pbn);
            let seg_start = byte_start.max(block_byte);
            let seg_end = byte_end.min(block_byte + block_size);
            let seg_len = usize::try_from(seg_end - seg_start).expect("segment fits usize");
            let offset_in_block = usize::try_from(seg_start - block_byte).expect("offset");

            let buffer = self.route(pbn);
            let mut link = self.pbi.lock(pbn);
            let bbn = match buffer.lookup(pbn, &link) {
                Some(bbn) => bbn,
                None => {
                    let bbn = self.alloc_slot(buffer, pbn);
                    link.bbn = Some(bbn);
                    if seg_len < block_size as usize {
                        // Unaligned edge: populate the slot from the
                        // region before applying the partial write.
                        let mut block = vec![0_u8; block_size as usize];
                        self.memcpy_from_region(
                            usize::try_from(block_byte).expect("offset"),
                            &mut block,
                        );
                        buffer.write_slot(bbn, 0, &block);
                    }
                    bbn
                }
            };

            buffer.write_slot(bbn, offset_in_block, &src[src_pos..src_pos + seg_len]);
            buffer.slot(bbn).dirty = true;
            drop(link);
            src_pos += seg_len;
        }
    }

    fn copy_from_buffered(&self, sector: SectorNumber, dst: &mut [u8]) {
        let block_size = self.geometry.block_size() as u64;
        let byte_start = self.geometry.sector_to_byte(sector);
        let byte_end = byte_start + dst.len() as u64;
        let first = self.geometry.byte_to_pbn(byte_start);
        let last = self.geometry.byte_to_pbn(byte_end - 1);

        let mut dst_pos = 0_usize;
        for pbn in first.0..=last.0 {
            let pbn = Pbn(pbn);
            let block_byte = self.geometry.pbn_to_byte(pbn);
            let seg_start = byte_start.max(block_byte);
            let seg_end = byte_end.min(block_byte + block_size);
            let seg_len = usize::try_from(seg_end - seg_start).expect("segment fits usize");
            let offset_in_block = usize::try_from(seg_start - block_byte).expect("offset");

            let buffer = self.route(pbn);
            let link = self.pbi.lock(pbn);
            let segment = &mut dst[dst_pos..dst_pos + seg_len];
            if let Some(bbn) = buffer.lookup(pbn, &link) {
                // Buffered: the slot holds the newest copy.
                buffer.read_slot(bbn, offset_in_block, segment);
            } else {
                self.checksum_on_read(seg_start, seg_len);
                self.memcpy_from_region(
                    usize::try_from(seg_start).expect("offset fits usize"),
                    segment,
                );
            }
            drop(link);
            dst_pos += seg_len;
        }
    }

    /// Reserve a slot for `pbn`, synchronously flushing one batch
    /// whenever the buffer is full. Caller holds the block's PBI lock;
    /// that cannot deadlock against the flusher because a block being
    /// allocated is by definition not in the dirty set being flushed.
    fn alloc_slot(&self, buffer: &WriteBuffer, pbn: Pbn) -> Bbn {
        loop {
            if let Some(bbn) = buffer.try_reserve(pbn) {
                return bbn;
            }
            // Only a batch, not the whole buffer: the writer needs a few
            // free slots, not a drained ring.
            let _ = self.check_and_flush(buffer, buffer.batch(), FlushCaller::Allocator);
        }
    }

    // ── flushing ───────────────────────────────────────────────────────

    /// Entry point shared by the allocator, the background flusher, and
    /// the barrier/teardown path. Re-checks the trigger once inside, since
    /// someone else may have flushed while this caller waited.
    fn check_and_flush(&self, buffer: &WriteBuffer, n_target: u64, caller: FlushCaller) -> u64 {
        match caller {
            FlushCaller::Destroyer => {}
            FlushCaller::Syncer => {
                if buffer.is_empty() {
                    return 0;
                }
            }
            FlushCaller::Allocator => {
                if !buffer.is_full() {
                    return 0;
                }
            }
        }
        self.flush_buffer(buffer, n_target)
    }

    /// Clean up to `n_target` slots: snapshot the dirty segment, sort by
    /// PBN (PTE mode), stream maximal contiguous runs, then advance the
    /// ring by the cleaned count.
    fn flush_buffer(&self, buffer: &WriteBuffer, n_target: u64) -> u64 {
        let mut flush_guard = buffer.begin_flush();
        let mut entries = std::mem::take(&mut flush_guard.entries);

        let scan_start = buffer.collect_dirty(&mut entries, n_target);
        if entries.is_empty() {
            flush_guard.entries = entries;
            return 0;
        }

        // Sorting buys contiguous runs, which buys wide RW windows. Under
        // CR0 windows are free and the copy order does not matter.
        if self.config.wpmode == pmbd_types::WpMode::Pte {
            entries.sort_unstable_by_key(|(pbn, _)| *pbn);
        }

        let mut cleaned = 0_u64;
        let mut run_start = 0_usize;
        for i in 1..=entries.len() {
            let run_breaks =
                i == entries.len() || !entries[i - 1].0.is_followed_by(entries[i].0);
            if run_breaks {
                cleaned += self.flush_run(buffer, &entries[run_start..i]);
                run_start = i;
            }
        }

        buffer.commit_flush(scan_start, cleaned);
        flush_guard.entries = entries;
        drop(flush_guard);

        debug!(
            target: "pmbd::buffer",
            event = "buffer_flush",
            buffer = buffer.id(),
            cleaned,
            remaining = buffer.num_dirty()
        );
        cleaned
    }

    /// Flush one maximal run of contiguous PBNs through a single RW
    /// window. PBI locks are taken per block in the copy pass and held
    /// through verification and unlink, so readers never observe a
    /// half-flushed block.
    fn flush_run(&self, buffer: &WriteBuffer, run: &[(Pbn, Bbn)]) -> u64 {
        let first = run[0].0;
        let last = run[run.len() - 1].0;
        let run_offset = usize::try_from(self.geometry.pbn_to_byte(first)).expect("offset");
        let run_len = usize::try_from(
            (last.0 - first.0 + 1) * u64::from(self.geometry.block_size()),
        )
        .expect("run length fits usize");

        let t_rw = self.stats.stamp();
        let window = self.region.gate().open_range(run_offset, run_len);
        self.stats.record_stage(Stage::SetpagesRw, Dir::Write, t_rw);

        // Copy pass: lock each block, stream its slot into the region,
        // mark the slot clean. Guards accumulate so the second pass runs
        // under the same exclusion.
        let mut guards = Vec::with_capacity(run.len());
        for (pbn, bbn) in run {
            let link = self.pbi.lock(*pbn);
            if link.bbn != Some(*bbn) {
                panic!(
                    "{}",
                    PmbdError::InternalInvariant(format!(
                        "flush found {pbn} unlinked from {bbn} mid-run"
                    ))
                );
            }
            let mut slot = buffer.slot(*bbn);
            if slot.dirty {
                let bytes = buffer.slot_bytes(*bbn);
                let offset = usize::try_from(self.geometry.pbn_to_byte(*pbn)).expect("offset");
                drop(slot);
                self.memcpy_to_region(offset, &bytes, false);
                buffer.slot(*bbn).dirty = false;
            } else {
                drop(slot);
            }
            guards.push(link);
        }

        let t_ro = self.stats.stamp();
        drop(window);
        self.stats.record_stage(Stage::SetpagesRo, Dir::Write, t_ro);

        // Finish pass: verify, refresh checksums, unlink both ends,
        // release each block.
        for ((pbn, bbn), mut link) in run.iter().zip(guards) {
            let offset = self.geometry.pbn_to_byte(*pbn);
            if self.config.wrverify {
                let bytes = buffer.slot_bytes(*bbn);
                self.verify_write(usize::try_from(offset).expect("offset"), &bytes);
            }
            self.checksum_on_write(offset, self.geometry.block_size() as usize);
            buffer.slot(*bbn).pbn = None;
            link.bbn = None;
        }

        run.len() as u64
    }

    // ── barrier ────────────────────────────────────────────────────────

    /// Drain in-flight writes, flush every buffer, and issue whatever
    /// global durability step the cacheability still needs.
    fn write_barrier(&self) {
        let t_barrier = self.stats.stamp();
        let _gate = self.barrier_gate.write();

        while self.in_flight_writes.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }

        for buffer in &self.buffers {
            while !buffer.is_empty() {
                let _ = self.check_and_flush(buffer, buffer.capacity(), FlushCaller::Destroyer);
            }
        }

        match self.config.cache {
            CacheMode::Wb => {
                if !self.config.nts && !self.config.clflush {
                    // No per-range ordering was issued; drop the whole
                    // cache to the medium.
                    let t_flush = self.stats.stamp();
                    copy::full_cache_writeback();
                    self.stats
                        .record_stage(Stage::ClflushAll, Dir::Write, t_flush);
                }
                // nts: each copy ended in a store-fence.
                // clflush: each range was flushed line by line.
            }
            // WC/UC−: store-fences were issued per copy. UC: strongly
            // ordered already.
            CacheMode::Wc | CacheMode::UcMinus | CacheMode::Uc => {}
        }

        self.stats.record_stage(Stage::Barrier, Dir::Write, t_barrier);
        debug!(target: "pmbd::device", event = "write_barrier_done");
    }

    // ── background flusher ─────────────────────────────────────────────

    /// One buffer's cooperative flusher: flush on the high watermark or
    /// on device idle, drain fully on stop.
    fn syncer_worker(&self, idx: usize, stop: &AtomicBool) {
        let buffer = &self.buffers[idx];
        info!(
            target: "pmbd::buffer",
            event = "syncer_start",
            buffer = buffer.id()
        );
        while !stop.load(Ordering::Acquire) {
            let mut do_flush = buffer.above_high_watermark();
            if !do_flush
                && self.stats.idle_ns() > FLUSH_IDLE_TIMEOUT_NS
                && buffer.above_low_watermark()
            {
                do_flush = true;
            }
            if do_flush {
                // Batch at a time, so writers waiting on a full buffer get
                // free slots without waiting for a whole drain.
                loop {
                    let _ = self.check_and_flush(buffer, buffer.batch(), FlushCaller::Syncer);
                    if !buffer.above_low_watermark() || stop.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
            std::thread::sleep(SYNCER_TICK);
        }

        // Mandatory drain on shutdown.
        while !buffer.is_empty() {
            let _ = self.check_and_flush(buffer, buffer.capacity(), FlushCaller::Destroyer);
        }
        info!(
            target: "pmbd::buffer",
            event = "syncer_stop",
            buffer = buffer.id()
        );
    }
}
