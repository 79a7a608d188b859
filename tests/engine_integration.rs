//! End-to-end engine tests over an in-memory disk backend.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel;
use parking_lot::Mutex;

use stripecache::{
    ArrayConfig, CompletionSink, DiskBackend, DiskOp, DiskRequest, IoDirection, IoStatus,
    RequestOutcome, StripeEngine, SECTOR_SIZE,
};

const BLOCK: usize = 4096;

// =============================================================================
// In-memory backend
// =============================================================================

/// RAM-backed devices with synchronous completion and failure injection.
struct RamDisk {
    devices: Vec<Mutex<Vec<u8>>>,
    reads: Vec<AtomicUsize>,
    writes: Vec<AtomicUsize>,
    failing: Mutex<HashSet<usize>>,
}

impl RamDisk {
    fn new(devices: usize, size: usize) -> Arc<Self> {
        Arc::new(Self {
            devices: (0..devices).map(|_| Mutex::new(vec![0u8; size])).collect(),
            reads: (0..devices).map(|_| AtomicUsize::new(0)).collect(),
            writes: (0..devices).map(|_| AtomicUsize::new(0)).collect(),
            failing: Mutex::new(HashSet::new()),
        })
    }

    fn fill_device(&self, device: usize, byte: u8) {
        self.devices[device].lock().fill(byte);
    }

    fn block(&self, device: usize, sector: u64) -> Vec<u8> {
        let offset = sector as usize * SECTOR_SIZE;
        self.devices[device].lock()[offset..offset + BLOCK].to_vec()
    }

    fn fail_device(&self, device: usize) {
        self.failing.lock().insert(device);
    }

    fn read_count(&self, device: usize) -> usize {
        self.reads[device].load(Ordering::SeqCst)
    }
}

impl DiskBackend for RamDisk {
    fn submit(&self, request: DiskRequest, done: &CompletionSink) {
        if self.failing.lock().contains(&request.device) {
            done.failure(request.token);
            return;
        }
        let offset = request.sector as usize * SECTOR_SIZE;
        match request.direction {
            IoDirection::Read => {
                self.reads[request.device].fetch_add(1, Ordering::SeqCst);
                let dev = self.devices[request.device].lock();
                let data = Bytes::copy_from_slice(&dev[offset..offset + request.len]);
                done.success(request.token, Some(data));
            }
            IoDirection::Write => {
                self.writes[request.device].fetch_add(1, Ordering::SeqCst);
                let payload = request.data.expect("write request without payload");
                let mut dev = self.devices[request.device].lock();
                dev[offset..offset + request.len].copy_from_slice(&payload);
                done.success(request.token, None);
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// 4-disk RAID-5, left-symmetric, one 4 KiB block per chunk. With this
/// geometry stripe 0 holds parity on disk 3 and logical sectors 0, 8 and 16
/// land on disks 0, 1 and 2.
fn config() -> ArrayConfig {
    ArrayConfig {
        raid_disks: 4,
        chunk_size: BLOCK,
        buffer_size: BLOCK,
        cache_stripes: 16,
        ..Default::default()
    }
}

fn setup(devices: usize) -> (Arc<StripeEngine>, Arc<RamDisk>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let disk = RamDisk::new(devices, 1 << 20);
    let engine = StripeEngine::new(config(), Arc::clone(&disk) as Arc<dyn DiskBackend>).unwrap();
    engine.start();
    (engine, disk)
}

fn read_block(engine: &StripeEngine, sector: u64) -> RequestOutcome {
    let (tx, rx) = channel::bounded(1);
    engine
        .handle_request(
            sector,
            BLOCK,
            IoDirection::Read,
            None,
            Box::new(move |o| {
                let _ = tx.send(o);
            }),
        )
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).expect("read timed out")
}

fn write_block(engine: &StripeEngine, sector: u64, byte: u8) -> RequestOutcome {
    let (tx, rx) = channel::bounded(1);
    engine
        .handle_request(
            sector,
            BLOCK,
            IoDirection::Write,
            Some(Bytes::from(vec![byte; BLOCK])),
            Box::new(move |o| {
                let _ = tx.send(o);
            }),
        )
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).expect("write timed out")
}

fn xor_fill(a: u8, b: u8, c: u8) -> Vec<u8> {
    vec![a ^ b ^ c; BLOCK]
}

// =============================================================================
// Read and write paths
// =============================================================================

#[test]
fn test_write_then_read_back() {
    let (engine, disk) = setup(4);

    let out = write_block(&engine, 0, 0xAA);
    assert_eq!(out.status, IoStatus::Ok);

    // Data landed on disk 0, parity on disk 3 covers the two zero blocks
    assert_eq!(disk.block(0, 0), vec![0xAA; BLOCK]);
    assert_eq!(disk.block(3, 0), vec![0xAA; BLOCK]);

    // Equal preread costs pick read-modify-write: only the written block
    // and the parity block were preread, the untouched members never were
    assert_eq!(disk.read_count(0), 1);
    assert_eq!(disk.read_count(3), 1);
    assert_eq!(disk.read_count(1), 0);
    assert_eq!(disk.read_count(2), 0);

    let out = read_block(&engine, 0);
    assert_eq!(out.status, IoStatus::Ok);
    assert_eq!(out.data.unwrap(), Bytes::from(vec![0xAA; BLOCK]));

    engine.stop();
}

#[test]
fn test_read_served_from_cache_without_reread() {
    let (engine, disk) = setup(4);

    write_block(&engine, 0, 0x11);
    let reads_after_write = disk.read_count(0);

    // The stripe is still cached and uptodate; no further disk read
    let out = read_block(&engine, 0);
    assert_eq!(out.data.unwrap()[0], 0x11);
    assert_eq!(disk.read_count(0), reads_after_write);

    engine.stop();
}

#[test]
fn test_writes_keep_parity_consistent_across_stripe() {
    let (engine, disk) = setup(4);

    write_block(&engine, 0, 0x0F);
    write_block(&engine, 8, 0x33);
    write_block(&engine, 16, 0x55);

    assert_eq!(disk.block(0, 0), vec![0x0F; BLOCK]);
    assert_eq!(disk.block(1, 0), vec![0x33; BLOCK]);
    assert_eq!(disk.block(2, 0), vec![0x55; BLOCK]);
    assert_eq!(disk.block(3, 0), xor_fill(0x0F, 0x33, 0x55));

    engine.stop();
}

#[test]
fn test_uncached_read_pulls_from_disk() {
    let (engine, disk) = setup(4);
    disk.fill_device(1, 0x77);

    let out = read_block(&engine, 8);
    assert_eq!(out.status, IoStatus::Ok);
    assert_eq!(out.data.unwrap()[0], 0x77);
    assert_eq!(disk.read_count(1), 1);
    // Clean read touches no other member
    assert_eq!(disk.read_count(0), 0);
    assert_eq!(disk.read_count(3), 0);

    engine.stop();
}

// =============================================================================
// Degraded mode
// =============================================================================

#[test]
fn test_degraded_read_reconstructs_lost_block() {
    let (engine, disk) = setup(4);
    disk.fill_device(0, 0x01);
    disk.fill_device(1, 0x02);
    disk.fill_device(2, 0x03);
    disk.fill_device(3, 0x01 ^ 0x02 ^ 0x03);

    engine.notify_io_error(1).unwrap();
    assert_eq!(engine.failed_disks(), 1);

    let out = read_block(&engine, 8);
    assert_eq!(out.status, IoStatus::Ok);
    assert_eq!(out.data.unwrap(), Bytes::from(vec![0x02; BLOCK]));
    // Reconstruction never touched the lost device
    assert_eq!(disk.read_count(1), 0);

    engine.stop();
}

#[test]
fn test_read_failure_triggers_reconstruction() {
    let (engine, disk) = setup(4);
    disk.fill_device(0, 0x0A);
    disk.fill_device(1, 0x0B);
    disk.fill_device(2, 0x0C);
    disk.fill_device(3, 0x0A ^ 0x0B ^ 0x0C);
    disk.fail_device(2);

    // The engine discovers the failure from the I/O error and recovers
    let out = read_block(&engine, 16);
    assert_eq!(out.status, IoStatus::Ok);
    assert_eq!(out.data.unwrap(), Bytes::from(vec![0x0C; BLOCK]));
    assert_eq!(engine.failed_disks(), 1);

    engine.stop();
}

#[test]
fn test_degraded_write_updates_parity_only() {
    let (engine, disk) = setup(4);
    disk.fill_device(1, 0x20);
    disk.fill_device(2, 0x30);
    disk.fill_device(3, 0x20 ^ 0x30);

    engine.notify_io_error(0).unwrap();
    let out = write_block(&engine, 0, 0x99);
    assert_eq!(out.status, IoStatus::Ok);

    // The block itself is unwritable; it lives on in the parity
    assert_eq!(disk.block(3, 0), xor_fill(0x99, 0x20, 0x30));

    // Reconstruct-write preread exactly the surviving untouched blocks
    assert_eq!(disk.read_count(1), 1);
    assert_eq!(disk.read_count(2), 1);
    assert_eq!(disk.read_count(3), 0);

    let out = read_block(&engine, 0);
    assert_eq!(out.data.unwrap(), Bytes::from(vec![0x99; BLOCK]));

    engine.stop();
}

#[test]
fn test_degraded_write_keeps_rmw_when_cheaper() {
    let (engine, disk) = setup(4);
    disk.fill_device(0, 0x11);
    disk.fill_device(1, 0x22);
    disk.fill_device(2, 0x33);
    disk.fill_device(3, 0x11 ^ 0x22 ^ 0x33);

    // Losing a disk the write never touches must not change the strategy:
    // read-modify-write is still cheaper than reconstructing
    engine.notify_io_error(2).unwrap();
    let out = write_block(&engine, 0, 0x77);
    assert_eq!(out.status, IoStatus::Ok);

    assert_eq!(disk.read_count(0), 1);
    assert_eq!(disk.read_count(3), 1);
    assert_eq!(disk.read_count(1), 0);
    assert_eq!(disk.block(3, 0), xor_fill(0x77, 0x22, 0x33));

    // The lost block still reconstructs against the updated parity
    let out = read_block(&engine, 16);
    assert_eq!(out.status, IoStatus::Ok);
    assert_eq!(out.data.unwrap(), Bytes::from(vec![0x33; BLOCK]));

    engine.stop();
}

#[test]
fn test_double_failure_fails_requests() {
    let (engine, disk) = setup(4);
    disk.fill_device(1, 0x44);
    engine.notify_io_error(0).unwrap();
    engine.notify_io_error(2).unwrap();

    let out = read_block(&engine, 0);
    assert_eq!(out.status, IoStatus::Failed);
    assert!(out.data.is_none());
    let out = write_block(&engine, 8, 0x42);
    assert_eq!(out.status, IoStatus::Failed);

    // A surviving disk still serves reads
    let out = read_block(&engine, 8);
    assert_eq!(out.status, IoStatus::Ok);
    assert_eq!(out.data.unwrap()[0], 0x44);

    engine.stop();
}

// =============================================================================
// Resync
// =============================================================================

#[test]
fn test_resync_confirms_good_parity() {
    let (engine, disk) = setup(4);
    disk.fill_device(0, 0x05);
    disk.fill_device(1, 0x06);
    disk.fill_device(2, 0x07);
    disk.fill_device(3, 0x05 ^ 0x06 ^ 0x07);

    let events = engine.sync_events();
    let advanced = engine.sync_step(0).unwrap();
    assert_eq!(advanced, (BLOCK / SECTOR_SIZE) as u64);

    let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(event.sector, 0);
    assert_eq!(event.sectors, (BLOCK / SECTOR_SIZE) as u64);
    assert!(event.ok);
    // Correct parity is never rewritten
    assert_eq!(disk.block(3, 0), xor_fill(0x05, 0x06, 0x07));

    engine.stop();
}

#[test]
fn test_resync_repairs_bad_parity() {
    let (engine, disk) = setup(4);
    disk.fill_device(0, 0x05);
    disk.fill_device(1, 0x06);
    disk.fill_device(2, 0x07);
    // Parity left as zeros: inconsistent

    let events = engine.sync_events();
    engine.sync_step(0).unwrap();
    let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(event.ok);
    assert_eq!(disk.block(3, 0), xor_fill(0x05, 0x06, 0x07));

    engine.stop();
}

#[test]
fn test_resync_aborts_on_double_failure() {
    let (engine, _disk) = setup(4);
    engine.notify_io_error(0).unwrap();
    engine.notify_io_error(1).unwrap();

    let events = engine.sync_events();
    engine.sync_step(0).unwrap();
    let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!event.ok);

    engine.stop();
}

#[test]
fn test_resync_walks_the_array() {
    let (engine, _disk) = setup(4);
    let events = engine.sync_events();

    let mut sector = 0u64;
    for _ in 0..4 {
        sector += engine.sync_step(sector).unwrap();
        assert!(events.recv_timeout(Duration::from_secs(5)).unwrap().ok);
    }
    assert_eq!(sector, 4 * (BLOCK / SECTOR_SIZE) as u64);

    engine.stop();
}

// =============================================================================
// Spare rebuild
// =============================================================================

#[test]
fn test_rebuild_onto_spare() {
    // Five devices: four members and one spare at device 4
    let (engine, disk) = setup(5);
    disk.fill_device(0, 0x01);
    disk.fill_device(1, 0x02);
    disk.fill_device(2, 0x03);
    disk.fill_device(3, 0x01 ^ 0x02 ^ 0x03);

    engine.notify_io_error(2).unwrap();
    engine
        .diskop(DiskOp::HotAdd {
            number: 4,
            device: 4,
        })
        .unwrap();
    engine.diskop(DiskOp::SpareWrite { number: 4 }).unwrap();

    // One resync step reconstructs the lost block onto the spare
    let events = engine.sync_events();
    engine.sync_step(0).unwrap();
    assert!(events.recv_timeout(Duration::from_secs(5)).unwrap().ok);
    assert_eq!(disk.block(4, 0), vec![0x03; BLOCK]);

    // Promote the spare; the array is whole again and the block reads back
    engine.diskop(DiskOp::SpareActive { number: 4 }).unwrap();
    assert_eq!(engine.failed_disks(), 0);
    let out = read_block(&engine, 16);
    assert_eq!(out.data.unwrap(), Bytes::from(vec![0x03; BLOCK]));

    engine.stop();
}

#[test]
fn test_degraded_write_mirrors_to_rebuilding_spare() {
    let (engine, disk) = setup(5);
    engine.notify_io_error(0).unwrap();
    engine
        .diskop(DiskOp::HotAdd {
            number: 4,
            device: 4,
        })
        .unwrap();
    engine.diskop(DiskOp::SpareWrite { number: 4 }).unwrap();

    let out = write_block(&engine, 0, 0x5C);
    assert_eq!(out.status, IoStatus::Ok);
    // The lost member's block went to the spare instead
    assert_eq!(disk.block(4, 0), vec![0x5C; BLOCK]);

    engine.stop();
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_writers_and_readers() {
    let (engine, disk) = setup(4);

    let writers: Vec<_> = (0..3u64)
        .map(|t| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for round in 0..8u8 {
                    let sector = t * 8;
                    let byte = (t as u8) * 16 + round;
                    let out = write_block(&engine, sector, byte);
                    assert_eq!(out.status, IoStatus::Ok);
                    let out = read_block(&engine, sector);
                    assert_eq!(out.status, IoStatus::Ok);
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    // Give the worker a moment to retire the last acknowledged stripes
    std::thread::sleep(Duration::from_millis(200));

    // Whatever the interleaving, parity must cover the final contents
    let expect: Vec<u8> = disk.block(0, 0)
        .iter()
        .zip(disk.block(1, 0))
        .zip(disk.block(2, 0))
        .map(|((a, b), c)| a ^ b ^ c)
        .collect();
    assert_eq!(disk.block(3, 0), expect);
    assert_eq!(engine.cache_stats().active, 0);

    engine.stop();
}
