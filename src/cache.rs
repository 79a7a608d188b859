//! Stripe cache
//!
//! Hash table plus idle/ready/delayed lists over a fixed pool of stripes.
//! Every stripe is in exactly one location at a time, tracked by a tagged
//! [`StripeLocation`] whose transitions all go through one controlling
//! method so the reference-count and list-membership invariants cannot
//! drift apart.
//!
//! The cache also owns the global buffer-size protocol: all live stripes
//! share one width, and a width change drains the cache to zero active
//! stripes, unhashes everything, then commits the new size. Buffers are
//! reallocated lazily as stripes are re-keyed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::config::SECTOR_SIZE;
use crate::error::Result;
use crate::stripe::{Stripe, DELAYED, HANDLE, PREREAD_ACTIVE, UNKEYED};

/// Where a stripe currently lives.
///
/// A stripe stays hashed while idle so it can be revived by a later `get`;
/// `Ready` and `Delayed` stripes have zero references but still count as
/// active. All transitions go through [`CacheCore::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripeLocation {
    Active { refs: usize },
    Idle,
    Ready,
    Delayed,
}

/// What `release` did with the stripe, so the caller can wake the worker
/// when work was queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAction {
    /// Still referenced elsewhere
    Busy,
    /// Queued for the background worker
    Queued,
    /// Returned to the idle list
    Idled,
}

/// Cache statistics snapshot.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub capacity: usize,
    pub active: usize,
    pub hits: u64,
    pub misses: u64,
}

// =============================================================================
// Core (everything under the one global lock)
// =============================================================================

struct CacheCore {
    hash: HashMap<u64, usize>,
    stripes: Vec<Option<Arc<Stripe>>>,
    locations: Vec<StripeLocation>,
    free_ids: Vec<usize>,
    idle: VecDeque<usize>,
    ready: VecDeque<usize>,
    delayed: VecDeque<usize>,
    /// Stripes not on the idle list
    active: usize,
    /// Live stripe count
    capacity: usize,
    /// Current global stripe width in bytes
    buffer_size: usize,
    disks: usize,
}

impl CacheCore {
    /// The one place locations change. Maintains the lists, the active
    /// count, and the refcount invariants; panics on violations, which are
    /// logic bugs rather than runtime conditions.
    fn transition(&mut self, id: usize, to: StripeLocation) {
        let from = self.locations[id];
        match from {
            StripeLocation::Idle => {
                let pos = self
                    .idle
                    .iter()
                    .position(|&x| x == id)
                    .expect("idle stripe missing from idle list");
                self.idle.remove(pos);
                self.active += 1;
            }
            StripeLocation::Ready => {
                if let Some(pos) = self.ready.iter().position(|&x| x == id) {
                    self.ready.remove(pos);
                }
            }
            StripeLocation::Delayed => {
                if let Some(pos) = self.delayed.iter().position(|&x| x == id) {
                    self.delayed.remove(pos);
                }
            }
            StripeLocation::Active { .. } => {}
        }
        match to {
            StripeLocation::Idle => {
                assert!(
                    !matches!(from, StripeLocation::Active { refs } if refs > 1),
                    "stripe {} sent idle with outstanding references",
                    id
                );
                self.idle.push_back(id);
                self.active -= 1;
            }
            StripeLocation::Ready => self.ready.push_back(id),
            StripeLocation::Delayed => self.delayed.push_back(id),
            StripeLocation::Active { .. } => {}
        }
        self.locations[id] = to;
    }

    fn stripe(&self, id: usize) -> &Arc<Stripe> {
        self.stripes[id].as_ref().expect("stale stripe id")
    }
}

// =============================================================================
// Stripe cache
// =============================================================================

pub struct StripeCache {
    core: Mutex<CacheCore>,
    /// Signalled on idle availability and on active-count drain
    available: Condvar,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StripeCache {
    pub fn new(disks: usize, buffer_size: usize) -> Self {
        Self {
            core: Mutex::new(CacheCore {
                hash: HashMap::new(),
                stripes: Vec::new(),
                locations: Vec::new(),
                free_ids: Vec::new(),
                idle: VecDeque::new(),
                ready: VecDeque::new(),
                delayed: VecDeque::new(),
                active: 0,
                capacity: 0,
                buffer_size,
                disks,
            }),
            available: Condvar::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Allocate `count` additional fully-buffered stripes onto the idle
    /// list. Fails without committing any stripe whose buffers could not
    /// all be allocated.
    pub fn grow(&self, count: usize) -> Result<()> {
        let mut core = self.core.lock();
        for _ in 0..count {
            let id = core.free_ids.pop().unwrap_or(core.stripes.len());
            let stripe = Arc::new(Stripe::new(id, core.disks, core.buffer_size)?);
            if id == core.stripes.len() {
                core.stripes.push(Some(stripe));
                core.locations.push(StripeLocation::Idle);
            } else {
                core.stripes[id] = Some(stripe);
                core.locations[id] = StripeLocation::Idle;
            }
            core.idle.push_back(id);
            core.capacity += 1;
        }
        debug!(capacity = core.capacity, "stripe cache grown");
        self.available.notify_all();
        Ok(())
    }

    /// Remove up to `count` stripes from the idle list and free them.
    /// Returns the number removed. Panics if a selected stripe has
    /// outstanding references; that must never happen by construction.
    pub fn shrink(&self, count: usize) -> usize {
        let mut core = self.core.lock();
        let mut removed = 0;
        while removed < count {
            let Some(id) = core.idle.pop_front() else {
                break;
            };
            assert_eq!(
                core.locations[id],
                StripeLocation::Idle,
                "non-idle stripe {} on idle list",
                id
            );
            let stripe = core.stripes[id].take().expect("stale stripe id");
            let sector = stripe.buf.lock().sector;
            if sector != UNKEYED {
                core.hash.remove(&sector);
            }
            core.free_ids.push(id);
            core.capacity -= 1;
            removed += 1;
        }
        debug!(removed, capacity = core.capacity, "stripe cache shrunk");
        removed
    }

    /// Acquire the stripe covering `sector`, with one reference taken.
    ///
    /// `size` of zero means "current global width" with `sector` aligned
    /// down to it. A differing `size` engages the resize protocol: block
    /// until no stripe is active, unhash everything, commit the new width.
    /// Returns `Ok(None)` only when `nonblocking` and no stripe was
    /// immediately available.
    pub fn get(&self, sector: u64, size: usize, nonblocking: bool) -> Result<Option<Arc<Stripe>>> {
        let mut core = self.core.lock();

        let (sector, size) = if size == 0 {
            let width = core.buffer_size;
            let row = (width / SECTOR_SIZE) as u64;
            (sector - sector % row, width)
        } else {
            (sector, size)
        };

        if size != core.buffer_size {
            while core.active > 0 {
                self.available.wait(&mut core);
            }
            // Every stripe is idle now; their keys are stale under the new
            // width, so unhash them all before committing.
            core.hash.clear();
            for id in 0..core.stripes.len() {
                if let Some(stripe) = &core.stripes[id] {
                    stripe.buf.lock().sector = UNKEYED;
                }
            }
            core.buffer_size = size;
            debug!(size, "committed new stripe width");
        }

        loop {
            if let Some(&id) = core.hash.get(&sector) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let to = match core.locations[id] {
                    StripeLocation::Active { refs } => StripeLocation::Active { refs: refs + 1 },
                    // Revive: idle and queued stripes carry zero references
                    StripeLocation::Idle | StripeLocation::Ready | StripeLocation::Delayed => {
                        StripeLocation::Active { refs: 1 }
                    }
                };
                core.transition(id, to);
                trace!(sector, id, "stripe cache hit");
                return Ok(Some(core.stripe(id).clone()));
            }

            if let Some(&id) = core.idle.front() {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let stripe = core.stripe(id).clone();
                {
                    let mut buf = stripe.buf.lock();
                    if buf.sector != UNKEYED {
                        let evicted = core.hash.remove(&buf.sector);
                        assert_eq!(evicted, Some(id), "hash desynchronized from stripe key");
                    }
                    buf.rekey(sector, core.buffer_size)?;
                }
                stripe.state.reset();
                let prior = core.hash.insert(sector, id);
                assert!(prior.is_none(), "two stripes keyed to sector {}", sector);
                core.transition(id, StripeLocation::Active { refs: 1 });
                trace!(sector, id, "stripe re-keyed");
                return Ok(Some(stripe));
            }

            if nonblocking {
                return Ok(None);
            }
            self.available.wait(&mut core);
        }
    }

    /// Look up a live stripe without taking a reference. Used by the
    /// completion path, where the in-flight I/O already holds one.
    pub fn find(&self, sector: u64) -> Option<Arc<Stripe>> {
        let core = self.core.lock();
        core.hash.get(&sector).map(|&id| core.stripe(id).clone())
    }

    /// Add references for I/O being put in flight against a held stripe.
    pub fn add_refs(&self, stripe: &Stripe, n: usize) {
        let mut core = self.core.lock();
        match core.locations[stripe.id] {
            StripeLocation::Active { refs } => {
                core.locations[stripe.id] = StripeLocation::Active { refs: refs + n };
            }
            other => panic!("add_refs on unreferenced stripe in {:?}", other),
        }
    }

    /// Drop one reference. At zero the stripe routes to the ready or
    /// delayed list when it needs handling, otherwise back to idle.
    pub fn release(&self, stripe: &Stripe) -> ReleaseAction {
        let mut core = self.core.lock();
        let id = stripe.id;
        match core.locations[id] {
            StripeLocation::Active { refs } if refs > 1 => {
                core.locations[id] = StripeLocation::Active { refs: refs - 1 };
                ReleaseAction::Busy
            }
            StripeLocation::Active { refs: 1 } => {
                if stripe.state.test(HANDLE) {
                    if stripe.state.test(DELAYED) {
                        core.transition(id, StripeLocation::Delayed);
                    } else {
                        core.transition(id, StripeLocation::Ready);
                    }
                    ReleaseAction::Queued
                } else {
                    core.transition(id, StripeLocation::Idle);
                    if core.active * 4 < core.capacity * 3 {
                        self.available.notify_all();
                    }
                    ReleaseAction::Idled
                }
            }
            other => panic!("release of stripe {} in {:?}", id, other),
        }
    }

    /// Pop one ready stripe with a reference taken, for the worker.
    pub fn next_ready(&self) -> Option<Arc<Stripe>> {
        let mut core = self.core.lock();
        let id = *core.ready.front()?;
        core.transition(id, StripeLocation::Active { refs: 1 });
        Some(core.stripe(id).clone())
    }

    pub fn ready_is_empty(&self) -> bool {
        self.core.lock().ready.is_empty()
    }

    /// Promote every delayed stripe to the ready list, marking each as
    /// preread-active. Returns the number of stripes newly counted against
    /// the preread budget.
    pub fn activate_delayed(&self) -> usize {
        let mut core = self.core.lock();
        let mut newly_active = 0;
        while let Some(&id) = core.delayed.front() {
            let stripe = core.stripe(id).clone();
            stripe.state.clear(DELAYED);
            if !stripe.state.test_and_set(PREREAD_ACTIVE) {
                newly_active += 1;
            }
            core.transition(id, StripeLocation::Ready);
        }
        newly_active
    }

    pub fn buffer_size(&self) -> usize {
        self.core.lock().buffer_size
    }

    pub fn stats(&self) -> CacheStats {
        let core = self.core.lock();
        CacheStats {
            capacity: core.capacity,
            active: core.active,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
