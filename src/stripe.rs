//! Stripe cache lines
//!
//! A [`Stripe`] is one row of the array held in memory: a per-disk scratch
//! buffer plus pending-request queues for every member disk, keyed by the
//! stripe-aligned per-disk sector. Stripes are allocated once at engine
//! start and re-keyed for the lifetime of the engine.
//!
//! State bits live in an atomic word so list routing never has to take the
//! per-stripe buffer lock; buffer contents and request queues are guarded
//! by the buffer lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::SECTOR_SIZE;
use crate::error::{Error, Result};
use crate::request::{IoDirection, IoStatus, RequestCallback, RequestOutcome};

/// Sentinel sector for a stripe that has never been keyed.
pub const UNKEYED: u64 = u64::MAX;

// =============================================================================
// State bits
// =============================================================================

/// Needs another state-machine pass.
pub const HANDLE: u32 = 1 << 0;
/// Blocked on the preread budget; parked on the delayed list.
pub const DELAYED: u32 = 1 << 1;
/// Part of a background resync.
pub const SYNCING: u32 = 1 << 2;
/// Parity of this stripe verified or repaired during resync.
pub const INSYNC: u32 = 1 << 3;
/// Counted against the global preread budget.
pub const PREREAD_ACTIVE: u32 = 1 << 4;
/// A disk I/O against this stripe has failed at least once.
pub const ERROR: u32 = 1 << 5;

/// Atomic stripe state word.
#[derive(Debug, Default)]
pub struct StripeState(AtomicU32);

impl StripeState {
    pub fn test(&self, bit: u32) -> bool {
        self.0.load(Ordering::SeqCst) & bit != 0
    }

    pub fn set(&self, bit: u32) {
        self.0.fetch_or(bit, Ordering::SeqCst);
    }

    pub fn clear(&self, bit: u32) {
        self.0.fetch_and(!bit, Ordering::SeqCst);
    }

    /// Set `bit`, returning whether it was already set.
    pub fn test_and_set(&self, bit: u32) -> bool {
        self.0.fetch_or(bit, Ordering::SeqCst) & bit != 0
    }

    /// Clear `bit`, returning whether it was set.
    pub fn test_and_clear(&self, bit: u32) -> bool {
        self.0.fetch_and(!bit, Ordering::SeqCst) & bit != 0
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

// =============================================================================
// Pending requests and per-disk slots
// =============================================================================

/// A host request queued on a stripe.
///
/// Ownership transfers to the stripe while queued and back to the caller,
/// via the callback, exactly once.
pub struct PendingIo {
    /// Original logical sector of the request
    pub sector: u64,
    /// Payload for writes
    pub data: Option<Bytes>,
    pub done: RequestCallback,
}

impl PendingIo {
    /// Complete this request, consuming it.
    pub fn complete(self, direction: IoDirection, status: IoStatus, data: Option<Bytes>) {
        (self.done)(RequestOutcome {
            sector: self.sector,
            direction,
            status,
            data,
        });
    }
}

/// Who owns the bytes a read lands in.
///
/// `Direct` is the buffer-swap optimization: a single uncontended read may
/// deliver its payload straight to the one waiting request on completion,
/// after which the slot reverts to `Scratch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backing {
    #[default]
    Scratch,
    Direct,
}

/// Per-member-disk state within one stripe.
pub struct DiskSlot {
    /// Scratch buffer, one stripe width
    pub data: Vec<u8>,
    /// An I/O for this block is in flight
    pub locked: bool,
    /// Buffer contents match (or supersede) the disk
    pub uptodate: bool,
    pub backing: Backing,
    /// Pending reads, FIFO
    pub reads: VecDeque<PendingIo>,
    /// Pending writes, FIFO
    pub writes: VecDeque<PendingIo>,
    /// Writes applied to the buffer but not yet acknowledged to the caller
    pub written: VecDeque<PendingIo>,
}

impl DiskSlot {
    fn alloc(size: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| Error::AllocationFailed { size })?;
        data.resize(size, 0);
        Ok(Self {
            data,
            locked: false,
            uptodate: false,
            backing: Backing::Scratch,
            reads: VecDeque::new(),
            writes: VecDeque::new(),
            written: VecDeque::new(),
        })
    }

    pub fn has_reads(&self) -> bool {
        !self.reads.is_empty()
    }

    pub fn has_writes(&self) -> bool {
        !self.writes.is_empty()
    }

    pub fn has_written(&self) -> bool {
        !self.written.is_empty()
    }

    pub fn is_quiesced(&self) -> bool {
        !self.locked && self.reads.is_empty() && self.writes.is_empty() && self.written.is_empty()
    }
}

// =============================================================================
// Stripe buffer
// =============================================================================

/// Lock-guarded contents of a stripe: key, parity index and per-disk slots.
pub struct StripeBuffer {
    /// Stripe-aligned per-disk sector, or [`UNKEYED`]
    pub sector: u64,
    /// Stripe width in bytes per disk
    pub size: usize,
    /// Parity-disk index for this stripe
    pub pd_idx: usize,
    pub slots: Vec<DiskSlot>,
}

impl StripeBuffer {
    /// Allocate a fully-buffered stripe. Fails without leaking partial
    /// allocations if any single buffer allocation fails.
    pub fn alloc(disks: usize, size: usize) -> Result<Self> {
        let mut slots = Vec::with_capacity(disks);
        for _ in 0..disks {
            slots.push(DiskSlot::alloc(size)?);
        }
        Ok(Self {
            sector: UNKEYED,
            size,
            pd_idx: disks - 1,
            slots,
        })
    }

    /// Sectors covered by this stripe row on each disk.
    pub fn sectors(&self) -> u64 {
        (self.size / SECTOR_SIZE) as u64
    }

    /// Re-key this stripe to a new sector, resetting all per-disk state and
    /// reallocating buffers if the global width changed.
    ///
    /// Panics if any slot still carries requests or in-flight I/O; an idle
    /// stripe never does by construction.
    pub fn rekey(&mut self, sector: u64, size: usize) -> Result<()> {
        for (i, slot) in self.slots.iter().enumerate() {
            assert!(
                slot.is_quiesced(),
                "re-keying stripe {} with busy slot {}",
                self.sector,
                i
            );
        }
        if self.size != size {
            for slot in &mut self.slots {
                let mut data = Vec::new();
                data.try_reserve_exact(size)
                    .map_err(|_| Error::AllocationFailed { size })?;
                data.resize(size, 0);
                slot.data = data;
            }
            self.size = size;
        }
        for slot in &mut self.slots {
            slot.locked = false;
            slot.uptodate = false;
            slot.backing = Backing::Scratch;
        }
        self.sector = sector;
        Ok(())
    }

    /// Queue a read against one disk's block.
    pub fn queue_read(&mut self, disk: usize, sector: u64, done: RequestCallback) {
        self.slots[disk].reads.push_back(PendingIo {
            sector,
            data: None,
            done,
        });
    }

    /// Queue a write against one disk's block.
    pub fn queue_write(&mut self, disk: usize, sector: u64, data: Bytes, done: RequestCallback) {
        self.slots[disk].writes.push_back(PendingIo {
            sector,
            data: Some(data),
            done,
        });
    }

    /// Apply every queued write on `disk` to its buffer, in submission
    /// order, and move them to the written list. The slot becomes uptodate.
    pub fn consume_writes(&mut self, disk: usize) {
        let slot = &mut self.slots[disk];
        while let Some(io) = slot.writes.pop_front() {
            let src = io.data.as_deref().expect("queued write without payload");
            slot.data.copy_from_slice(src);
            slot.written.push_back(io);
        }
        slot.uptodate = true;
    }

    /// Temporarily move the parity buffer out so it can be XOR-destination
    /// while the remaining slots serve as sources.
    pub fn take_parity(&mut self) -> (Vec<u8>, &[DiskSlot]) {
        let pd = self.pd_idx;
        self.take_slot(pd)
    }

    pub fn put_parity(&mut self, data: Vec<u8>) {
        let pd = self.pd_idx;
        self.put_slot(pd, data);
    }

    /// Move one slot's buffer out; the slice of all slots remains readable
    /// for XOR sources (the taken slot reads as empty).
    pub fn take_slot(&mut self, idx: usize) -> (Vec<u8>, &[DiskSlot]) {
        let data = std::mem::take(&mut self.slots[idx].data);
        (data, &self.slots[..])
    }

    pub fn put_slot(&mut self, idx: usize, data: Vec<u8>) {
        debug_assert_eq!(data.len(), self.size);
        self.slots[idx].data = data;
    }
}

/// One cache line of the stripe cache.
pub struct Stripe {
    /// Pool slot index, fixed for the stripe's lifetime
    pub(crate) id: usize,
    pub state: StripeState,
    pub buf: Mutex<StripeBuffer>,
}

impl Stripe {
    pub(crate) fn new(id: usize, disks: usize, size: usize) -> Result<Self> {
        Ok(Self {
            id,
            state: StripeState::default(),
            buf: Mutex::new(StripeBuffer::alloc(disks, size)?),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
