//! Per-device counters and optional stage timing.
//!
//! Request/sector/barrier/FUA counters are always live. The per-stage
//! cycle breakdown only records when `timestat` is enabled, because the
//! extra clock reads are themselves a measurable slowdown.
//!
//! The last-access timestamp kept here also feeds the background
//! flusher's idle check.

use pmbd_emul::CycleClock;
use pmbd_types::Dir;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Labelled pipeline stages for the timing breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prepare,
    Work,
    Endio,
    Memcpy,
    Clflush,
    ClflushAll,
    Wrverify,
    Checksum,
    SetpagesRo,
    SetpagesRw,
    Pause,
    Slowdown,
    Barrier,
}

impl Stage {
    pub const ALL: [Stage; 13] = [
        Stage::Prepare,
        Stage::Work,
        Stage::Endio,
        Stage::Memcpy,
        Stage::Clflush,
        Stage::ClflushAll,
        Stage::Wrverify,
        Stage::Checksum,
        Stage::SetpagesRo,
        Stage::SetpagesRw,
        Stage::Pause,
        Stage::Slowdown,
        Stage::Barrier,
    ];

    fn index(self) -> usize {
        match self {
            Self::Prepare => 0,
            Self::Work => 1,
            Self::Endio => 2,
            Self::Memcpy => 3,
            Self::Clflush => 4,
            Self::ClflushAll => 5,
            Self::Wrverify => 6,
            Self::Checksum => 7,
            Self::SetpagesRo => 8,
            Self::SetpagesRw => 9,
            Self::Pause => 10,
            Self::Slowdown => 11,
            Self::Barrier => 12,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Work => "work",
            Self::Endio => "endio",
            Self::Memcpy => "memcpy",
            Self::Clflush => "clflush",
            Self::ClflushAll => "clflush_all",
            Self::Wrverify => "wrverify",
            Self::Checksum => "checksum",
            Self::SetpagesRo => "setpages_ro",
            Self::SetpagesRw => "setpages_rw",
            Self::Pause => "pause",
            Self::Slowdown => "slowdown",
            Self::Barrier => "barrier",
        }
    }
}

const NUM_STAGES: usize = Stage::ALL.len();

/// Live counters for one device.
#[derive(Debug)]
pub struct DeviceStats {
    clock: CycleClock,
    timestat: bool,
    requests: [AtomicU64; 2],
    sectors: [AtomicU64; 2],
    barriers: AtomicU64,
    fua_requests: AtomicU64,
    checksum_mismatches: AtomicU64,
    last_access_cycle: AtomicU64,
    stage_cycles: [[AtomicU64; 2]; NUM_STAGES],
}

impl DeviceStats {
    #[must_use]
    pub fn new(timestat: bool) -> Self {
        Self {
            clock: CycleClock::new(),
            timestat,
            requests: [AtomicU64::new(0), AtomicU64::new(0)],
            sectors: [AtomicU64::new(0), AtomicU64::new(0)],
            barriers: AtomicU64::new(0),
            fua_requests: AtomicU64::new(0),
            checksum_mismatches: AtomicU64::new(0),
            last_access_cycle: AtomicU64::new(0),
            stage_cycles: std::array::from_fn(|_| [AtomicU64::new(0), AtomicU64::new(0)]),
        }
    }

    pub fn count_request(&self, dir: Dir, num_sectors: u64) {
        self.requests[dir.index()].fetch_add(1, Ordering::Relaxed);
        self.sectors[dir.index()].fetch_add(num_sectors, Ordering::Relaxed);
    }

    pub fn count_barrier(&self) {
        self.barriers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_fua(&self) {
        self.fua_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_checksum_mismatch(&self) {
        self.checksum_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Note an access for the idle detector.
    pub fn touch_access_time(&self) {
        self.last_access_cycle
            .store(self.clock.now_cycles(), Ordering::Relaxed);
    }

    /// Nanoseconds since the last request, for the flusher idle check.
    #[must_use]
    pub fn idle_ns(&self) -> u64 {
        let last = self.last_access_cycle.load(Ordering::Relaxed);
        pmbd_emul::cycle_to_ns(self.clock.now_cycles().saturating_sub(last))
    }

    /// Take a stage timestamp. Returns 0 when timing is disabled, so the
    /// matching [`Self::record_stage`] is a no-op.
    #[must_use]
    pub fn stamp(&self) -> u64 {
        if self.timestat {
            self.clock.now_cycles()
        } else {
            0
        }
    }

    /// Record elapsed cycles for `stage` since a [`Self::stamp`].
    pub fn record_stage(&self, stage: Stage, dir: Dir, start_cycle: u64) {
        if !self.timestat || start_cycle == 0 {
            return;
        }
        let elapsed = self.clock.now_cycles().saturating_sub(start_cycle);
        self.stage_cycles[stage.index()][dir.index()].fetch_add(elapsed, Ordering::Relaxed);
    }

    /// Frozen point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let stages = Stage::ALL
            .iter()
            .map(|stage| StageCycles {
                stage: *stage,
                read_cycles: self.stage_cycles[stage.index()][Dir::Read.index()]
                    .load(Ordering::Relaxed),
                write_cycles: self.stage_cycles[stage.index()][Dir::Write.index()]
                    .load(Ordering::Relaxed),
            })
            .collect();
        StatsSnapshot {
            requests_read: self.requests[Dir::Read.index()].load(Ordering::Relaxed),
            requests_write: self.requests[Dir::Write.index()].load(Ordering::Relaxed),
            sectors_read: self.sectors[Dir::Read.index()].load(Ordering::Relaxed),
            sectors_write: self.sectors[Dir::Write.index()].load(Ordering::Relaxed),
            barriers: self.barriers.load(Ordering::Relaxed),
            fua_requests: self.fua_requests.load(Ordering::Relaxed),
            checksum_mismatches: self.checksum_mismatches.load(Ordering::Relaxed),
            stages,
        }
    }
}

/// Cycle totals for one stage, split by direction.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StageCycles {
    pub stage: Stage,
    pub read_cycles: u64,
    pub write_cycles: u64,
}

/// Serializable snapshot of the per-device counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub requests_read: u64,
    pub requests_write: u64,
    pub sectors_read: u64,
    pub sectors_write: u64,
    pub barriers: u64,
    pub fua_requests: u64,
    pub checksum_mismatches: u64,
    pub stages: Vec<StageCycles>,
}
