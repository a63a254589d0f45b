#![forbid(unsafe_code)]
//! End-to-end scenarios on the unbuffered paths: write protection,
//! checksums, non-temporal stores, latency emulation, verification.

use pmbd_core::{Device, DeviceConfig};
use pmbd_error::PmbdError;
use pmbd_region::MemPool;
use pmbd_types::{ReqFlags, SectorNumber};
use std::time::{Duration, Instant};

const BLOCK_SIZE: usize = 4096;
/// 16-block device (128 sectors), the standard test geometry.
const CAPACITY_SECTORS: u64 = 128;

fn pool() -> MemPool {
    MemPool::new(64 << 20)
}

fn activate(options: &str) -> Device {
    let config = DeviceConfig::from_option_str(CAPACITY_SECTORS, options).expect("config");
    Device::activate(&pool(), config).expect("activate")
}

#[test]
fn protected_checksummed_write_read_cycle() {
    // wrprot=on, wpmode=PTE, buf=off, checksum=on.
    let device = activate("wrprotY;wpmode0;bufsize0;checksumY");

    let payload = vec![0xAA_u8; BLOCK_SIZE];
    device
        .write(SectorNumber(0), &payload, ReqFlags::empty())
        .expect("write");

    let mut back = vec![0_u8; BLOCK_SIZE];
    device.read(SectorNumber(0), &mut back).expect("read");
    assert_eq!(back, payload);
    assert_eq!(device.stats_snapshot().checksum_mismatches, 0);
}

#[test]
fn cr0_mode_serves_protected_writes() {
    let device = activate("wrprotY;wpmode1");

    let payload = vec![0x5A_u8; BLOCK_SIZE * 2];
    device
        .write(SectorNumber(8), &payload, ReqFlags::empty())
        .expect("write");

    let mut back = vec![0_u8; BLOCK_SIZE * 2];
    device.read(SectorNumber(8), &mut back).expect("read");
    assert_eq!(back, payload);
}

#[test]
fn nts_write_barrier_persists_unaligned_sector() {
    // nts=on, cache=WB, wb=on; one sector at an unaligned block offset.
    let device = activate("ntsY;cacheWB;wbY");

    let payload = vec![0x6D_u8; 512];
    device
        .write(SectorNumber(1), &payload, ReqFlags::empty())
        .expect("write");
    device.flush().expect("flush");

    assert!(device.region().range_eq(512, &payload));
    // The first sector stays untouched.
    assert!(device.region().range_eq(0, &[0_u8; 512]));
}

#[test]
fn read_latency_floor_is_enforced_per_request() {
    let device = activate("rdlat100000;rdbw0");

    let mut dst = vec![0_u8; 512];
    for _ in 0..1000 {
        let start = Instant::now();
        device.read(SectorNumber(0), &mut dst).expect("read");
        assert!(
            start.elapsed() >= Duration::from_nanos(100_000),
            "a read completed below the configured access time"
        );
    }
}

#[test]
fn write_latency_does_not_apply_to_reads() {
    let device = activate("wrlat5000000");

    let mut dst = vec![0_u8; 512];
    let start = Instant::now();
    device.read(SectorNumber(0), &mut dst).expect("read");
    assert!(start.elapsed() < Duration::from_millis(2));
}

#[test]
fn verification_catches_mutation_behind_the_window() {
    let device = activate("wrprotY;wrverifyY");

    // The stub mutates one region byte between RW-window close and the
    // verify step, standing in for a wild in-process store.
    device.set_verify_stub(|region| region.wild_store(64, 0xBD));

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        device.write(SectorNumber(0), &[0x00_u8; BLOCK_SIZE], ReqFlags::empty())
    }));
    assert!(result.is_err(), "verification mismatch must be fatal");
}

#[test]
fn out_of_range_requests_fail_cleanly() {
    let device = activate("");

    // Exactly at the capacity boundary succeeds.
    device
        .write(
            SectorNumber(CAPACITY_SECTORS - 8),
            &[1_u8; BLOCK_SIZE],
            ReqFlags::empty(),
        )
        .expect("write at boundary");

    // One byte beyond fails.
    let err = device
        .write(
            SectorNumber(CAPACITY_SECTORS - 8),
            &[1_u8; BLOCK_SIZE + 1],
            ReqFlags::empty(),
        )
        .unwrap_err();
    assert!(matches!(err, PmbdError::OutOfRange { .. }));

    // The failed request left no partial progress past the boundary.
    let mut back = vec![0_u8; BLOCK_SIZE];
    device
        .read(SectorNumber(CAPACITY_SECTORS - 8), &mut back)
        .expect("read");
    assert_eq!(back, vec![1_u8; BLOCK_SIZE]);
}

#[test]
fn bad_option_strings_fail_activation() {
    for options in ["wibbleY", "bufsize2", "cacheXX", "rdlatNaN"] {
        let err = DeviceConfig::from_option_str(CAPACITY_SECTORS, options).unwrap_err();
        assert!(matches!(err, PmbdError::BadConfig(_)), "{options}");
    }
}

#[test]
fn uncacheable_modes_round_trip() {
    for options in ["cacheUC", "cacheUC-", "cacheWC", "ntlY"] {
        let device = activate(options);
        let payload = vec![0x33_u8; BLOCK_SIZE];
        device
            .write(SectorNumber(0), &payload, ReqFlags::empty())
            .expect("write");
        let mut back = vec![0_u8; BLOCK_SIZE];
        device.read(SectorNumber(0), &mut back).expect("read");
        assert_eq!(back, payload, "{options}");
    }
}

#[test]
fn corrupted_block_reports_mismatch_but_returns_bytes() {
    let device = activate("checksumY");

    device
        .write(SectorNumber(0), &[0x44_u8; BLOCK_SIZE], ReqFlags::empty())
        .expect("write");
    device.region().wild_store(10, 0x99);

    let mut back = vec![0_u8; BLOCK_SIZE];
    device.read(SectorNumber(0), &mut back).expect("read succeeds anyway");
    assert_eq!(back[10], 0x99, "the read returns what the region holds");
    assert_eq!(device.stats_snapshot().checksum_mismatches, 1);
}

#[test]
fn stats_surface_counts_requests_and_stages() {
    let device = activate("timestatY;wrprotY;checksumY");

    device
        .write(SectorNumber(0), &[7_u8; BLOCK_SIZE], ReqFlags::empty())
        .expect("write");
    let mut back = vec![0_u8; BLOCK_SIZE];
    device.read(SectorNumber(0), &mut back).expect("read");

    let snap = device.stats_snapshot();
    assert_eq!(snap.requests_write, 1);
    assert_eq!(snap.requests_read, 1);
    assert_eq!(snap.sectors_write, 8);
    assert_eq!(snap.sectors_read, 8);

    let cycles_of = |name: &str| {
        snap.stages
            .iter()
            .find(|s| s.stage.as_str() == name)
            .map(|s| (s.read_cycles, s.write_cycles))
            .expect("stage present")
    };
    assert!(cycles_of("memcpy").1 > 0, "write memcpy cycles recorded");
    assert!(cycles_of("memcpy").0 > 0, "read memcpy cycles recorded");
    assert!(cycles_of("checksum").1 > 0, "checksum cycles recorded");
}
