#![forbid(unsafe_code)]
//! Latency and bandwidth emulation.
//!
//! Two independent mechanisms, applied to reads and writes separately:
//!
//! - **Access time**: each request measures its real elapsed cycles; if it
//!   came in under the configured `rdlat`/`wrlat`, the deficit is
//!   busy-waited. No lock is held during the wait.
//! - **Bandwidth**: consecutive requests are grouped into a per-direction
//!   batch `{start_cycle, end_cycle, sectors}` guarded by a device-level
//!   batch lock. When a batch closes (interval, duration, or volume
//!   bound), the emulated transfer time for its sectors is compared with
//!   the real elapsed time and the deficit busy-waited while the batch
//!   lock is held.
//!
//! Busy-waiting keeps reading the cycle counter, which both prevents the
//! clock source from idling and gives a stable elapsed-time estimate.
//! Delays above 10 ms surrender the processor for the millisecond part
//! and busy-wait only the remainder; that path is forbidden under the
//! batch lock.

use parking_lot::Mutex;
use pmbd_types::{Dir, SimMode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::trace;

/// Nominal cycle frequency: one emulated cycle per nanosecond (1 GHz).
pub const CYCLES_PER_US: u64 = 1_000;

/// Largest delay the synchronous spin path will serve, in nanoseconds.
const MAX_SYNC_SLOWDOWN_NS: u64 = 10_000_000;

/// Maximum gap between two requests of the same batch (1 ms).
const BATCH_MAX_INTERVAL_NS: u64 = 1_000_000;
/// Maximum duration of one batch (10 ms).
const BATCH_MAX_DURATION_NS: u64 = 10_000_000;
/// Maximum sectors accumulated in one batch.
const BATCH_MAX_SECTORS: u64 = 4096;
/// Minimum sectors for a closing batch to be worth shaping.
const BATCH_MIN_SECTORS: u64 = 256;

/// Convert emulated cycles to nanoseconds.
#[must_use]
pub fn cycle_to_ns(cycles: u64) -> u64 {
    u64::try_from(u128::from(cycles) * 1_000 / u128::from(CYCLES_PER_US)).unwrap_or(u64::MAX)
}

/// Convert nanoseconds to emulated cycles.
#[must_use]
pub fn ns_to_cycle(ns: u64) -> u64 {
    u64::try_from(u128::from(ns) * u128::from(CYCLES_PER_US) / 1_000).unwrap_or(u64::MAX)
}

/// Monotonic cycle counter for the emulation clock domain.
#[derive(Debug, Clone)]
pub struct CycleClock {
    epoch: Instant,
}

impl Default for CycleClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Current cycle count (monotonic, starts near zero).
    #[must_use]
    pub fn now_cycles(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Per-device emulation parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulParams {
    /// Minimum read access latency in nanoseconds (0 disables).
    pub rdlat_ns: u64,
    /// Minimum write access latency in nanoseconds (0 disables).
    pub wrlat_ns: u64,
    /// Read bandwidth cap in MB/s (0 disables).
    pub rdbw_mbs: u64,
    /// Write bandwidth cap in MB/s (0 disables).
    pub wrbw_mbs: u64,
    /// Read slowdown factor: X−1 extra cycles per observed cycle.
    pub rdsx: u32,
    /// Write slowdown factor.
    pub wrsx: u32,
    /// Fixed read pause in cycles per 4 KiB.
    pub rdpause_cycles: u64,
    /// Fixed write pause in cycles per 4 KiB.
    pub wrpause_cycles: u64,
    /// Whether emulation wraps whole requests or each region memcpy.
    pub simmode: SimMode,
}

impl EmulParams {
    /// Whether any latency/bandwidth emulation is configured.
    #[must_use]
    pub fn emulation_enabled(&self) -> bool {
        self.rdlat_ns > 0 || self.wrlat_ns > 0 || self.rdbw_mbs > 0 || self.wrbw_mbs > 0
    }

    /// Whether a relative slowdown factor is configured.
    #[must_use]
    pub fn slowdown_enabled(&self) -> bool {
        self.rdsx > 1 || self.wrsx > 1
    }

    #[must_use]
    fn lat_ns(&self, dir: Dir) -> u64 {
        match dir {
            Dir::Read => self.rdlat_ns,
            Dir::Write => self.wrlat_ns,
        }
    }

    #[must_use]
    fn bw_mbs(&self, dir: Dir) -> u64 {
        match dir {
            Dir::Read => self.rdbw_mbs,
            Dir::Write => self.wrbw_mbs,
        }
    }

    #[must_use]
    fn sx(&self, dir: Dir) -> u32 {
        match dir {
            Dir::Read => self.rdsx,
            Dir::Write => self.wrsx,
        }
    }

    #[must_use]
    fn pause_cycles(&self, dir: Dir) -> u64 {
        match dir {
            Dir::Read => self.rdpause_cycles,
            Dir::Write => self.wrpause_cycles,
        }
    }

    /// Emulated transfer time for `sectors` at the direction's bandwidth.
    #[must_use]
    pub fn transfer_time_ns(&self, sectors: u64, dir: Dir) -> u64 {
        let bw = self.bw_mbs(dir);
        if bw == 0 {
            return 0;
        }
        let bytes = u128::from(sectors) * u128::from(pmbd_types::SECTOR_SIZE);
        let denominator = u128::from(bw) * (1_u128 << 20);
        let ns = bytes * 1_000_000_000_u128 / denominator;
        u64::try_from(ns).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BatchState {
    start_cycle: u64,
    end_cycle: u64,
    sectors: u64,
}

/// Per-device latency/bandwidth emulator.
#[derive(Debug)]
pub struct Emulator {
    params: EmulParams,
    clock: CycleClock,
    /// Guards the per-direction batch state. The shaping spin happens
    /// while this is held, which is what slows every concurrent stream.
    batch: Mutex<[BatchState; 2]>,
}

impl Emulator {
    #[must_use]
    pub fn new(params: EmulParams) -> Self {
        Self {
            params,
            clock: CycleClock::new(),
            batch: Mutex::new([BatchState::default(); 2]),
        }
    }

    #[must_use]
    pub fn params(&self) -> &EmulParams {
        &self.params
    }

    #[must_use]
    pub fn clock(&self) -> &CycleClock {
        &self.clock
    }

    /// Start the emulation bracket; returns the start cycle (0 when no
    /// emulation is configured or the request is empty).
    #[must_use]
    pub fn start(&self, num_sectors: u64, _dir: Dir) -> u64 {
        if self.params.emulation_enabled() && num_sectors > 0 {
            self.clock.now_cycles()
        } else {
            0
        }
    }

    /// Close the emulation bracket: bandwidth shaping first, then the
    /// access-time deficit, so the request observes at least the
    /// configured latency after transfer shaping already slowed it.
    pub fn end(&self, num_sectors: u64, dir: Dir, start_cycle: u64) {
        if !self.params.emulation_enabled() || num_sectors == 0 {
            return;
        }
        if self.params.bw_mbs(dir) > 0 {
            self.shape_transfer(num_sectors, dir);
        }
        if self.params.lat_ns(dir) > 0 {
            let end_cycle = self.clock.now_cycles();
            self.pad_access_time(start_cycle, end_cycle, dir);
        }
    }

    /// Bandwidth shaping: account the request into the direction's batch
    /// and busy-wait the emulated-vs-real deficit when the batch closes.
    fn shape_transfer(&self, num_sectors: u64, dir: Dir) {
        let mut batches = self.batch.lock();
        let state = &mut batches[dir.index()];
        let now = self.clock.now_cycles();

        if state.start_cycle == 0 {
            state.start_cycle = now;
            state.end_cycle = now;
            return;
        }

        let mut new_batch = false;
        let mut end_batch = false;

        let interval_ns = cycle_to_ns(now.saturating_sub(state.end_cycle));
        if interval_ns >= BATCH_MAX_INTERVAL_NS {
            // Too distant: break into two batches.
            new_batch = true;
            end_batch = true;
        } else {
            state.sectors += num_sectors;
            state.end_cycle = now;
        }

        let duration_ns = cycle_to_ns(state.end_cycle.saturating_sub(state.start_cycle));
        if duration_ns >= BATCH_MAX_DURATION_NS {
            end_batch = true;
        }
        if state.sectors >= BATCH_MAX_SECTORS {
            end_batch = true;
        }

        if end_batch {
            if state.sectors >= BATCH_MIN_SECTORS {
                let real_ns = cycle_to_ns(state.end_cycle.saturating_sub(state.start_cycle));
                let emul_ns = self.params.transfer_time_ns(state.sectors, dir);
                if emul_ns > real_ns {
                    trace!(
                        target: "pmbd::emul",
                        event = "batch_close",
                        dir = dir.as_str(),
                        sectors = state.sectors,
                        deficit_ns = emul_ns - real_ns
                    );
                    // Still under the batch lock: sleeping is forbidden here.
                    self.slowdown_ns(emul_ns - real_ns, true);
                }
            }
            state.sectors = 0;
            state.start_cycle = now;
            state.end_cycle = now;
        }
        if new_batch {
            state.sectors = num_sectors;
            state.start_cycle = now;
            state.end_cycle = now;
        }
    }

    /// Access-time padding: busy-wait whatever the request finished early.
    ///
    /// Applied per request without any lock; overlapping requests pad
    /// independently.
    fn pad_access_time(&self, start_cycle: u64, end_cycle: u64, dir: Dir) {
        let real_ns = cycle_to_ns(end_cycle.saturating_sub(start_cycle));
        let emul_ns = self.params.lat_ns(dir);
        if emul_ns > real_ns {
            self.slowdown_ns(emul_ns - real_ns, false);
        }
    }

    /// Relative slowdown: X−1 extra cycles for every cycle a copy took.
    pub fn rdwr_slowdown(&self, dir: Dir, start_cycle: u64, end_cycle: u64) {
        let sx = u64::from(self.params.sx(dir));
        if sx > 1 {
            let observed = end_cycle.saturating_sub(start_cycle);
            self.spin_cycles(observed.saturating_mul(sx - 1));
        }
    }

    /// Fixed pause per 4 KiB of transferred data.
    pub fn rdwr_pause(&self, bytes: usize, dir: Dir) {
        let per_block = self.params.pause_cycles(dir);
        if per_block > 0 && bytes > 0 {
            let blocks = (bytes as u64).div_ceil(u64::from(pmbd_types::BLOCK_SIZE));
            self.spin_cycles(per_block.saturating_mul(blocks));
        }
    }

    /// Delay by `ns`. Under 10 ms (or whenever a lock is held) this spins;
    /// above it, the millisecond part sleeps and the remainder spins.
    pub fn slowdown_ns(&self, ns: u64, in_lock: bool) {
        if ns == 0 {
            return;
        }
        if ns > MAX_SYNC_SLOWDOWN_NS && !in_lock {
            let ms = ns / 1_000_000;
            let rest = ns - ms * 1_000_000;
            std::thread::sleep(Duration::from_millis(ms));
            self.spin_ns(rest);
        } else {
            self.spin_ns(ns);
        }
    }

    fn spin_ns(&self, ns: u64) {
        self.spin_cycles(ns_to_cycle(ns));
    }

    fn spin_cycles(&self, cycles: u64) {
        if cycles == 0 {
            return;
        }
        let start = self.clock.now_cycles();
        while self.clock.now_cycles().saturating_sub(start) < cycles {
            std::hint::spin_loop();
        }
    }
}
