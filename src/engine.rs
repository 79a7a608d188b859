//! Stripe cache engine
//!
//! The public facade: owns the cache, the member-disk table, the routing
//! layout and the background worker, and exposes the request, resync and
//! administrative surfaces. Lock order throughout the engine is cache core,
//! then stripe buffer, then disk table; no callback or backend submission
//! runs while any of them is held.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::cache::{CacheStats, ReleaseAction, StripeCache};
use crate::config::{ArrayConfig, SECTOR_SIZE};
use crate::disks::{DiskOp, DiskTable};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::request::{
    CompletionSink, DiskBackend, EngineEvent, IoDirection, IoStatus, IoToken, RequestCallback,
    SyncEvent,
};
use crate::stripe::{Backing, Stripe, ERROR, HANDLE, INSYNC, SYNCING};
use crate::worker;

/// A RAID-4/5 stripe cache engine over an asynchronous disk backend.
///
/// Create with [`StripeEngine::new`], call [`start`] before submitting
/// work and [`stop`] before dropping the last handle.
///
/// [`start`]: StripeEngine::start
/// [`stop`]: StripeEngine::stop
pub struct StripeEngine {
    pub(crate) config: ArrayConfig,
    pub(crate) layout: Layout,
    pub(crate) cache: StripeCache,
    pub(crate) disks: RwLock<DiskTable>,
    pub(crate) backend: Arc<dyn DiskBackend>,
    pub(crate) events_tx: Sender<EngineEvent>,
    pub(crate) events_rx: Receiver<EngineEvent>,
    pub(crate) sink: CompletionSink,
    pub(crate) sync_tx: Sender<SyncEvent>,
    sync_rx: Receiver<SyncEvent>,
    /// Stripes currently counted against the preread budget
    pub(crate) preread_active: AtomicUsize,
    pub(crate) plugged: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl StripeEngine {
    /// Build an engine over `backend`, allocating the stripe cache.
    pub fn new(config: ArrayConfig, backend: Arc<dyn DiskBackend>) -> Result<Arc<Self>> {
        config.validate()?;
        let layout = Layout::new(&config);
        let cache = StripeCache::new(config.raid_disks, config.buffer_size);
        cache.grow(config.cache_stripes)?;
        let disks = RwLock::new(DiskTable::new(config.raid_disks));
        let (events_tx, events_rx) = channel::unbounded();
        let (sync_tx, sync_rx) = channel::unbounded();
        let sink = CompletionSink {
            tx: events_tx.clone(),
        };
        info!(
            raid_disks = config.raid_disks,
            chunk_size = config.chunk_size,
            stripes = config.cache_stripes,
            "stripe engine created"
        );
        Ok(Arc::new(Self {
            config,
            layout,
            cache,
            disks,
            backend,
            events_tx,
            events_rx,
            sink,
            sync_tx,
            sync_rx,
            preread_active: AtomicUsize::new(0),
            plugged: AtomicBool::new(false),
            worker: Mutex::new(None),
            running: AtomicBool::new(false),
        }))
    }

    /// Start the background worker. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("stripe-worker".to_string())
            .spawn(move || worker::run(engine))
            .expect("spawning the stripe worker thread");
        *self.worker.lock() = Some(handle);
        info!("stripe engine started");
    }

    /// Stop accepting work and join the worker. In-flight completions are
    /// drained by the worker before it honors the shutdown. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.events_tx.send(EngineEvent::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        info!("stripe engine stopped");
    }

    // =========================================================================
    // Request surface
    // =========================================================================

    /// Submit one host request covering a full stripe-width block.
    ///
    /// `sector` is a logical array sector aligned to `size`, which must be
    /// a valid stripe width for the configured chunk size. A `size` that
    /// differs from the current global width engages the resize protocol
    /// and blocks until in-flight stripes drain. Writes carry exactly
    /// `size` bytes in `data`; reads pass `None`.
    ///
    /// `done` fires exactly once, outside all engine locks.
    #[instrument(skip(self, data, done))]
    pub fn handle_request(
        &self,
        sector: u64,
        size: usize,
        direction: IoDirection,
        data: Option<Bytes>,
        done: RequestCallback,
    ) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::NotRunning);
        }
        ArrayConfig::validate_buffer_size(size, self.config.chunk_size)?;
        let row = (size / SECTOR_SIZE) as u64;
        if sector % row != 0 {
            return Err(Error::UnalignedRequest { sector, size });
        }
        let payload = match (direction, data) {
            (IoDirection::Write, Some(d)) if d.len() == size => Some(d),
            (IoDirection::Write, Some(d)) => {
                return Err(Error::UnalignedRequest {
                    sector,
                    size: d.len(),
                })
            }
            (IoDirection::Write, None) => return Err(Error::UnalignedRequest { sector, size: 0 }),
            (IoDirection::Read, _) => None,
        };

        let map = self.layout.map_sector(sector);
        let stripe = match self.cache.get(map.sector, size, false)? {
            Some(s) => s,
            None => unreachable!("blocking get always yields a stripe"),
        };
        {
            let mut buf = stripe.buf.lock();
            buf.pd_idx = map.pd_idx;
            match direction {
                IoDirection::Read => buf.queue_read(map.dd_idx, sector, done),
                IoDirection::Write => {
                    buf.queue_write(map.dd_idx, sector, payload.expect("validated above"), done)
                }
            }
        }
        self.handle_stripe(&stripe);
        self.release_stripe(&stripe);
        Ok(())
    }

    /// Defer delayed-write promotion; batches bursts of small writes.
    pub fn plug(&self) {
        self.plugged.store(true, Ordering::SeqCst);
    }

    /// Resume delayed-write promotion and kick the worker.
    pub fn unplug(&self) {
        if self.plugged.swap(false, Ordering::SeqCst) {
            self.wake_worker();
        }
    }

    // =========================================================================
    // Resync surface
    // =========================================================================

    /// Drive one stripe of a background resync.
    ///
    /// `sector` is a per-disk sector. Returns the number of per-disk
    /// sectors this step covers, so the driver can advance its cursor; the
    /// outcome of the step arrives later on [`sync_events`].
    ///
    /// [`sync_events`]: StripeEngine::sync_events
    #[instrument(skip(self))]
    pub fn sync_step(&self, sector: u64) -> Result<u64> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::NotRunning);
        }
        let stripe = match self.cache.get(sector, 0, false)? {
            Some(s) => s,
            None => unreachable!("blocking get always yields a stripe"),
        };
        let sectors = {
            let mut buf = stripe.buf.lock();
            buf.pd_idx = self.layout.parity_disk_for_sector(buf.sector);
            buf.sectors() - (sector - buf.sector)
        };
        stripe.state.set(SYNCING);
        stripe.state.clear(INSYNC);
        self.handle_stripe(&stripe);
        self.release_stripe(&stripe);
        Ok(sectors)
    }

    /// Completion stream for resync steps, one event per finished stripe.
    pub fn sync_events(&self) -> Receiver<SyncEvent> {
        self.sync_rx.clone()
    }

    // =========================================================================
    // Administrative surface
    // =========================================================================

    /// Report a device failure detected outside the engine's own I/O.
    pub fn notify_io_error(&self, device: usize) -> Result<()> {
        self.disks.write().mark_faulty(device)?;
        // Queued stripes touching the device need re-evaluation
        self.wake_worker();
        Ok(())
    }

    /// Perform one validated disk-state transition.
    pub fn diskop(&self, op: DiskOp) -> Result<()> {
        self.disks.write().diskop(op)
    }

    /// Number of failed in-service disks.
    pub fn failed_disks(&self) -> usize {
        self.disks.read().failed()
    }

    /// Add `count` stripes to the cache.
    pub fn grow_cache(&self, count: usize) -> Result<()> {
        self.cache.grow(count)
    }

    /// Remove `count` idle stripes from the cache. Fails (after removing
    /// what it could) when fewer than `count` stripes were idle.
    pub fn shrink_cache(&self, count: usize) -> Result<()> {
        let removed = self.cache.shrink(count);
        if removed < count {
            return Err(Error::CacheExhausted {
                requested: count,
                available: removed,
            });
        }
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // =========================================================================
    // Completion path (worker context)
    // =========================================================================

    /// Apply one disk-I/O completion to its stripe and queue a re-pass.
    pub(crate) fn apply_completion(&self, token: IoToken, data: Option<Bytes>, ok: bool) {
        let stripe = self
            .cache
            .find(token.sector)
            .expect("completion for a stripe no longer in the cache");

        let mut direct = None;
        let mut failed_device = None;
        {
            let mut buf = stripe.buf.lock();
            let size = buf.size;
            let slot = &mut buf.slots[token.disk];
            debug_assert!(slot.locked, "completion for a slot with no I/O in flight");
            slot.locked = false;
            let was_direct = slot.backing == Backing::Direct;
            slot.backing = Backing::Scratch;

            let mut bad = !ok;
            if ok {
                match token.direction {
                    IoDirection::Write => {}
                    IoDirection::Read => match data {
                        Some(payload) if payload.len() == size => {
                            slot.data.copy_from_slice(&payload);
                            slot.uptodate = true;
                            if was_direct {
                                if let Some(io) = slot.reads.pop_front() {
                                    direct = Some((io, payload));
                                }
                            }
                        }
                        _ => bad = true,
                    },
                }
            }
            if bad {
                stripe.state.set(ERROR);
                failed_device = Some(token.device);
                warn!(
                    device = token.device,
                    disk = token.disk,
                    sector = token.sector,
                    ?token.direction,
                    "disk I/O failed"
                );
            }
        }

        if let Some(device) = failed_device {
            if let Err(e) = self.disks.write().mark_faulty(device) {
                warn!(device, error = %e, "could not mark device faulty");
            }
        }
        if let Some((io, payload)) = direct {
            io.complete(IoDirection::Read, IoStatus::Ok, Some(payload));
        }

        stripe.state.set(HANDLE);
        self.release_stripe(&stripe);
    }

    pub(crate) fn release_stripe(&self, stripe: &Arc<Stripe>) {
        if self.cache.release(stripe) == ReleaseAction::Queued {
            self.wake_worker();
        }
    }

    pub(crate) fn wake_worker(&self) {
        let _ = self.events_tx.send(EngineEvent::Wake);
    }
}

// =============================================================================
// Tests
// =============================================================================
