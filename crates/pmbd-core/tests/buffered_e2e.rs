#![forbid(unsafe_code)]
//! End-to-end scenarios on the buffered write path: slot routing,
//! synchronous flush under allocator pressure, the background flusher's
//! watermark and idle triggers, and the PBI ↔ BBI invariants under
//! concurrent load.

use pmbd_core::{Device, DeviceConfig};
use pmbd_region::MemPool;
use pmbd_types::{Pbn, ReqFlags, SectorNumber};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BLOCK_SIZE: usize = 4096;

fn activate(capacity_sectors: u64, options: &str) -> Device {
    let pool = MemPool::new(64 << 20);
    let config = DeviceConfig::from_option_str(capacity_sectors, options).expect("config");
    Device::activate(&pool, config).expect("activate")
}

fn block_payload(pbn: u64, salt: u8) -> Vec<u8> {
    let mut out = vec![salt; BLOCK_SIZE];
    out[..8].copy_from_slice(&pbn.to_le_bytes());
    out
}

fn sector_of(device: &Device, pbn: u64) -> SectorNumber {
    device.geometry().pbn_to_sector(Pbn(pbn))
}

fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, cond: F) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn buffered_write_reads_from_slot_until_flushed() {
    // buf=on, 16 MiB, batch=4, on the 16-block test geometry.
    let device = activate(128, "bufsize16;batch4;wbY");

    let payload = vec![0x11_u8; BLOCK_SIZE];
    device
        .write(SectorNumber(0), &payload, ReqFlags::empty())
        .expect("write");

    // Served from the slot; the region still holds zeroes.
    let mut back = vec![0_u8; BLOCK_SIZE];
    device.read(SectorNumber(0), &mut back).expect("read");
    assert_eq!(back, payload);
    assert!(device.region().range_eq(0, &[0_u8; BLOCK_SIZE]));

    device.flush().expect("flush");

    // Now the region itself holds the bytes and the slot is unlinked.
    assert!(device.region().range_eq(0, &payload));
    assert!(device.debug_block_link(Pbn(0)).is_none());

    let mut back = vec![0_u8; BLOCK_SIZE];
    device.read(SectorNumber(0), &mut back).expect("read after flush");
    assert_eq!(back, payload);
}

#[test]
fn two_buffers_route_by_pbn_and_drain_independently() {
    // buf=on, count=2, stride=1: pbn routes to buffer (pbn mod 2).
    let device = activate(128, "bufsize4;bufnum2;bufstride1");

    for pbn in 0..4_u64 {
        device
            .write(
                sector_of(&device, pbn),
                &block_payload(pbn, 0x20),
                ReqFlags::empty(),
            )
            .expect("write");
    }

    // Force-flush buffer 0 only: even PBNs land in the region, odd ones
    // stay buffered.
    device.drain_buffer(0).expect("drain buffer 0");
    for pbn in [0_u64, 2] {
        let offset = usize::try_from(device.geometry().pbn_to_byte(Pbn(pbn))).unwrap();
        assert!(
            device.region().range_eq(offset, &block_payload(pbn, 0x20)),
            "pbn {pbn} must be in the region"
        );
        assert!(device.debug_block_link(Pbn(pbn)).is_none());
    }
    for pbn in [1_u64, 3] {
        let offset = usize::try_from(device.geometry().pbn_to_byte(Pbn(pbn))).unwrap();
        assert!(
            device.region().range_eq(offset, &[0_u8; BLOCK_SIZE]),
            "pbn {pbn} must still be buffered only"
        );
        assert!(device.debug_block_link(Pbn(pbn)).is_some());
    }

    // Full drain brings the rest over.
    device.drain_buffers().expect("drain all");
    for pbn in 0..4_u64 {
        let offset = usize::try_from(device.geometry().pbn_to_byte(Pbn(pbn))).unwrap();
        assert!(device.region().range_eq(offset, &block_payload(pbn, 0x20)));
    }
}

#[test]
fn full_buffer_forces_synchronous_batch_flush() {
    // 4 MiB buffer = 1024 slots; write 1500 distinct blocks so the
    // allocator has to flush batches synchronously.
    let device = activate(16384, "bufsize4;batch64");

    for pbn in 0..1500_u64 {
        device
            .write(
                sector_of(&device, pbn),
                &block_payload(pbn, 0x42),
                ReqFlags::empty(),
            )
            .expect("write");
    }

    device.drain_buffers().expect("drain");
    for pbn in (0..1500_u64).step_by(97) {
        let offset = usize::try_from(device.geometry().pbn_to_byte(Pbn(pbn))).unwrap();
        assert!(
            device.region().range_eq(offset, &block_payload(pbn, 0x42)),
            "pbn {pbn} lost on the allocator flush path"
        );
    }
    for buffer in device.debug_buffers() {
        assert!(buffer.ring_is_well_formed());
        assert!(buffer.is_empty());
    }
}

#[test]
fn background_flusher_reacts_to_high_watermark() {
    // Capacity 1024 slots; 800 dirty blocks is past the 0.7 mark, so the
    // syncer drains without any explicit flush.
    let device = activate(16384, "bufsize4;batch256");

    for pbn in 0..800_u64 {
        device
            .write(
                sector_of(&device, pbn),
                &block_payload(pbn, 0x61),
                ReqFlags::empty(),
            )
            .expect("write");
    }

    wait_for("syncer to pass the high watermark", Duration::from_secs(5), || {
        device.buffer_metrics()[0].num_dirty < 103
    });
    for buffer in device.debug_buffers() {
        assert!(buffer.ring_is_well_formed());
    }
}

#[test]
fn background_flusher_drains_idle_device() {
    // 150 dirty blocks sits between the low (102) and high (717)
    // watermarks; only the 2 ms idle trigger can flush it.
    let device = activate(16384, "bufsize4");

    for pbn in 0..150_u64 {
        device
            .write(
                sector_of(&device, pbn),
                &block_payload(pbn, 0x13),
                ReqFlags::empty(),
            )
            .expect("write");
    }

    wait_for("idle flush", Duration::from_secs(5), || {
        device.buffer_metrics()[0].num_dirty < 103
    });

    // Whatever was flushed is already readable straight from the region.
    let offset = usize::try_from(device.geometry().pbn_to_byte(Pbn(0))).unwrap();
    wait_for("first block in region", Duration::from_secs(5), || {
        device.region().range_eq(offset, &block_payload(0, 0x13))
    });
}

#[test]
fn teardown_with_dirty_slots_drains_and_exits() {
    let device = activate(16384, "bufsize4");
    for pbn in 0..50_u64 {
        device
            .write(
                sector_of(&device, pbn),
                &block_payload(pbn, 0x55),
                ReqFlags::empty(),
            )
            .expect("write");
    }
    // Drop with dirty slots: the flushers drain and join; nothing hangs.
    drop(device);
}

#[test]
fn concurrent_writers_keep_the_ring_and_links_consistent() {
    let device = Arc::new(activate(16384, "bufsize4;batch32"));
    let mut joins = Vec::new();
    for worker in 0..4_u64 {
        let device = Arc::clone(&device);
        joins.push(std::thread::spawn(move || {
            // Disjoint block ranges per worker, three passes each, so
            // blocks are rewritten while the flusher is active.
            for pass in 0..3_u8 {
                for pbn in (worker * 200)..(worker * 200 + 200) {
                    device
                        .write(
                            sector_of(&device, pbn),
                            &block_payload(pbn, 0x80 + pass),
                            ReqFlags::empty(),
                        )
                        .expect("write");
                }
            }
        }));
    }
    for join in joins {
        join.join().expect("writer thread");
    }

    device.drain_buffers().expect("drain");
    for buffer in device.debug_buffers() {
        assert!(buffer.ring_is_well_formed());
        assert!(buffer.is_empty());
    }
    for pbn in 0..800_u64 {
        let offset = usize::try_from(device.geometry().pbn_to_byte(Pbn(pbn))).unwrap();
        assert!(
            device.region().range_eq(offset, &block_payload(pbn, 0x82)),
            "pbn {pbn} must hold the last pass's bytes"
        );
        assert!(device.debug_block_link(Pbn(pbn)).is_none());
    }
}

#[test]
fn interleaved_reads_see_latest_buffered_write() {
    let device = Arc::new(activate(16384, "bufsize4"));

    device
        .write(sector_of(&device, 3), &block_payload(3, 0x01), ReqFlags::empty())
        .expect("first");
    device
        .write(sector_of(&device, 3), &block_payload(3, 0x02), ReqFlags::empty())
        .expect("second");

    // Never a merge: the read observes the complete second write.
    let mut back = vec![0_u8; BLOCK_SIZE];
    device.read(sector_of(&device, 3), &mut back).expect("read");
    assert_eq!(back, block_payload(3, 0x02));
}

#[test]
fn buffered_fua_doubles_into_the_region() {
    let device = activate(128, "bufsize16");

    let payload = block_payload(2, 0x90);
    device
        .write(sector_of(&device, 2), &payload, ReqFlags::FUA)
        .expect("fua write");

    // Durable immediately, still buffered for readers.
    let offset = usize::try_from(device.geometry().pbn_to_byte(Pbn(2))).unwrap();
    assert!(device.region().range_eq(offset, &payload));
    assert!(device.debug_block_link(Pbn(2)).is_some());
}

#[test]
fn partial_writes_populate_slots_from_the_region() {
    let device = activate(128, "bufsize16;wbY");

    // Seed block 1 through the buffer and flush it down.
    device
        .write(sector_of(&device, 1), &block_payload(1, 0x07), ReqFlags::empty())
        .expect("seed");
    device.flush().expect("flush");

    // A single-sector write to the middle of block 1 must preserve the
    // rest of the block in its freshly allocated slot.
    let mut sector_bytes = vec![0xFE_u8; 512];
    sector_bytes[..2].copy_from_slice(&[0xCA, 0xFE]);
    device
        .write(SectorNumber(11), &sector_bytes, ReqFlags::empty())
        .expect("partial write");

    let mut back = vec![0_u8; BLOCK_SIZE];
    device.read(sector_of(&device, 1), &mut back).expect("read");
    let mut expected = block_payload(1, 0x07);
    expected[1536..2048].copy_from_slice(&sector_bytes);
    assert_eq!(back, expected);

    // And the same bytes survive the trip to the region.
    device.flush().expect("second flush");
    let offset = usize::try_from(device.geometry().pbn_to_byte(Pbn(1))).unwrap();
    assert!(device.region().range_eq(offset, &expected));
}
