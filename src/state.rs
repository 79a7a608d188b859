//! Stripe state machine
//!
//! `handle_stripe` runs one pass over a stripe: observe per-disk state,
//! satisfy what can be satisfied from buffers already present, and start
//! the reads, parity work or writes that unblock the rest. The pass is
//! re-run, via the HANDLE bit and the ready list, every time something
//! about the stripe changes, and each pass either makes progress or parks
//! the stripe on the delayed list.
//!
//! All decisions happen under the stripe's buffer lock. Host completions,
//! backend submissions and resync events collect in an [`Actions`] batch
//! and are dispatched only after the lock is dropped, so callbacks and
//! backends never run inside engine locks.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::disks::DiskSnapshot;
use crate::engine::StripeEngine;
use crate::parity::{compute_block, compute_parity, is_zero, ParityMethod};
use crate::request::{DiskRequest, IoDirection, IoStatus, IoToken, SyncEvent};
use crate::stripe::{
    Backing, PendingIo, Stripe, StripeBuffer, DELAYED, ERROR, HANDLE, INSYNC, PREREAD_ACTIVE,
    SYNCING,
};

/// A host request resolved by this pass, completed after locks drop.
struct Completion {
    io: PendingIo,
    direction: IoDirection,
    status: IoStatus,
    data: Option<Bytes>,
}

/// Everything a pass decided to do, dispatched outside the buffer lock.
#[derive(Default)]
struct Actions {
    completions: Vec<Completion>,
    ios: Vec<DiskRequest>,
    sync_event: Option<SyncEvent>,
    preread_done: bool,
}

impl Actions {
    fn complete(&mut self, io: PendingIo, direction: IoDirection, status: IoStatus, data: Option<Bytes>) {
        self.completions.push(Completion {
            io,
            direction,
            status,
            data,
        });
    }
}

/// Lock a slot and queue one disk I/O against it.
fn issue_io(
    buf: &mut StripeBuffer,
    disk: usize,
    device: usize,
    direction: IoDirection,
    actions: &mut Actions,
) {
    let data = {
        let slot = &mut buf.slots[disk];
        debug_assert!(!slot.locked, "issuing I/O on an in-flight slot");
        slot.locked = true;
        match direction {
            IoDirection::Write => Some(Bytes::copy_from_slice(&slot.data)),
            IoDirection::Read => None,
        }
    };
    trace!(sector = buf.sector, disk, device, ?direction, "disk I/O queued");
    actions.ios.push(DiskRequest {
        device,
        sector: buf.sector,
        len: buf.size,
        direction,
        data,
        token: IoToken {
            sector: buf.sector,
            disk,
            device,
            direction,
        },
    });
}

impl StripeEngine {
    /// Run one state-machine pass over `stripe`.
    ///
    /// The caller must hold a reference on the stripe and releases it
    /// afterwards; references for I/O put in flight here are added before
    /// any submission happens.
    pub(crate) fn handle_stripe(&self, stripe: &Arc<Stripe>) {
        stripe.state.clear(HANDLE);
        let snap = self.disks.read().snapshot();

        let mut actions = Actions::default();
        {
            let mut buf = stripe.buf.lock();
            self.run_pass(stripe, &mut buf, &snap, &mut actions);
        }

        // Each in-flight I/O holds one stripe reference so the stripe can
        // neither idle nor re-key before its completion is applied.
        if !actions.ios.is_empty() {
            self.cache.add_refs(stripe, actions.ios.len());
        }
        if actions.preread_done {
            self.preread_active.fetch_sub(1, Ordering::SeqCst);
            self.wake_worker();
        }
        for c in actions.completions {
            c.io.complete(c.direction, c.status, c.data);
        }
        for io in actions.ios {
            self.backend.submit(io, &self.sink);
        }
        if let Some(event) = actions.sync_event {
            let _ = self.sync_tx.send(event);
        }
    }

    fn run_pass(
        &self,
        stripe: &Stripe,
        buf: &mut StripeBuffer,
        snap: &DiskSnapshot,
        actions: &mut Actions,
    ) {
        let state = &stripe.state;
        let disks = buf.slots.len();
        let pd = buf.pd_idx;
        let mut syncing = state.test(SYNCING);

        // ---- observe, and satisfy reads from data already present ----
        let mut to_read = 0;
        let mut to_write = 0;
        let mut written = 0;
        let mut locked = 0;
        let mut uptodate = 0;
        let mut failed = 0;
        let mut failed_num = 0;

        for i in 0..disks {
            if buf.slots[i].has_reads() && buf.slots[i].uptodate && !buf.slots[i].locked {
                let data = Bytes::copy_from_slice(&buf.slots[i].data);
                while let Some(io) = buf.slots[i].reads.pop_front() {
                    actions.complete(io, IoDirection::Read, IoStatus::Ok, Some(data.clone()));
                }
            }
            let slot = &buf.slots[i];
            if slot.uptodate {
                uptodate += 1;
            }
            if slot.locked {
                locked += 1;
            }
            if slot.has_reads() {
                to_read += 1;
            }
            if slot.has_writes() {
                to_write += 1;
            }
            if slot.has_written() {
                written += 1;
            }
            if !snap.operational(i) {
                failed += 1;
                failed_num = i;
            }
        }
        trace!(
            sector = buf.sector,
            to_read,
            to_write,
            written,
            locked,
            uptodate,
            failed,
            syncing,
            errored = state.test(ERROR),
            "stripe pass"
        );

        // ---- beyond one failure nothing is recoverable ----
        // Writes and unacked written requests fail outright; reads fail
        // only on the lost disks, the survivors can still be served.
        if failed > 1 {
            if to_read + to_write + written > 0 {
                warn!(
                    sector = buf.sector,
                    failed, "failing stripe requests, array has lost too many disks"
                );
                for i in 0..disks {
                    let slot = &mut buf.slots[i];
                    if !snap.operational(i) {
                        for io in slot.reads.drain(..) {
                            actions.complete(io, IoDirection::Read, IoStatus::Failed, None);
                        }
                    }
                    for io in slot.writes.drain(..) {
                        actions.complete(io, IoDirection::Write, IoStatus::Failed, None);
                    }
                    for io in slot.written.drain(..) {
                        actions.complete(io, IoDirection::Write, IoStatus::Failed, None);
                    }
                }
                to_write = 0;
                written = 0;
                to_read = (0..disks).filter(|&i| buf.slots[i].has_reads()).count();
            }
            if syncing {
                state.clear(SYNCING);
                syncing = false;
                actions.sync_event = Some(SyncEvent {
                    sector: buf.sector,
                    sectors: buf.sectors(),
                    ok: false,
                });
            }
        }

        // ---- acknowledge writes that reached stable parity ----
        if written > 0 {
            let parity_safe = (buf.slots[pd].uptodate && !buf.slots[pd].locked)
                || (failed == 1 && failed_num == pd);
            if parity_safe {
                for i in 0..disks {
                    if i == pd || !buf.slots[i].has_written() {
                        continue;
                    }
                    let block_safe = (buf.slots[i].uptodate && !buf.slots[i].locked)
                        || (failed == 1 && failed_num == i);
                    if block_safe {
                        for io in buf.slots[i].written.drain(..) {
                            actions.complete(io, IoDirection::Write, IoStatus::Ok, None);
                        }
                    }
                }
            }
        }

        // Quiesced after writing: give the preread budget slot back
        let still_written = (0..disks).any(|i| buf.slots[i].has_written());
        if to_write == 0 && locked == 0 && !still_written && state.test_and_clear(PREREAD_ACTIVE) {
            actions.preread_done = true;
        }

        // ---- pull in blocks that reads, resync or reconstruction need ----
        // Degraded writes are not handled here; the rmw/rcw costing below
        // decides what they preread
        let degraded_need = failed == 1 && buf.slots[failed_num].has_reads();
        if to_read > 0 || (syncing && uptodate < disks) || degraded_need {
            for i in 0..disks {
                if buf.slots[i].uptodate || buf.slots[i].locked {
                    continue;
                }
                let wanted = buf.slots[i].has_reads()
                    || syncing
                    || (degraded_need && i != failed_num);
                if !wanted {
                    continue;
                }
                if let Some(device) = snap.device[i] {
                    // Single uncontended read: let the completion hand its
                    // payload straight to the waiting request
                    if buf.slots[i].reads.len() == 1 && to_write == 0 && !syncing && failed == 0 {
                        buf.slots[i].backing = Backing::Direct;
                    }
                    issue_io(buf, i, device, IoDirection::Read, actions);
                    locked += 1;
                } else if uptodate == disks - 1 {
                    compute_block(buf, i);
                    uptodate += 1;
                    state.set(HANDLE);
                }
            }
        }

        // ---- writes: pick a parity strategy, preread, compute, submit ----
        if to_write > 0 {
            // Cost of each strategy in blocks to read; an unreadable block
            // inflates its strategy beyond ever winning
            let mut rmw = 0usize;
            let mut rcw = 0usize;
            for i in 0..disks {
                let slot = &buf.slots[i];
                if slot.locked || slot.uptodate {
                    continue;
                }
                if slot.has_writes() || i == pd {
                    rmw += if snap.operational(i) { 1 } else { 2 * disks };
                } else {
                    rcw += if snap.operational(i) { 1 } else { 2 * disks };
                }
            }

            // Prereads happen only when the chosen strategy still has
            // blocks to fetch; a zero-cost strategy goes straight to the
            // parity computation below
            if rmw > 0 && rcw > 0 {
                let use_rmw = rmw <= rcw;
                let budget_ok = state.test(PREREAD_ACTIVE)
                    || self.preread_active.load(Ordering::SeqCst) < self.config.preread_limit;
                if budget_ok {
                    for i in 0..disks {
                        let slot = &buf.slots[i];
                        if slot.locked || slot.uptodate {
                            continue;
                        }
                        let Some(device) = snap.device[i] else {
                            continue;
                        };
                        let preread = if use_rmw {
                            slot.has_writes() || i == pd
                        } else {
                            !slot.has_writes() && i != pd
                        };
                        if preread {
                            issue_io(buf, i, device, IoDirection::Read, actions);
                            locked += 1;
                        }
                    }
                } else {
                    debug!(sector = buf.sector, "write parked on preread budget");
                    state.set(DELAYED);
                    state.set(HANDLE);
                }
            }

            if locked == 0 && (rmw == 0 || rcw == 0) {
                let method = if rcw == 0 {
                    ParityMethod::ReconstructWrite
                } else {
                    ParityMethod::ReadModifyWrite
                };
                compute_parity(buf, method);
                debug!(sector = buf.sector, ?method, "stripe write committed");

                for i in 0..disks {
                    if !(buf.slots[i].has_written() || i == pd) {
                        continue;
                    }
                    if let Some(device) = snap.device[i] {
                        issue_io(buf, i, device, IoDirection::Write, actions);
                        locked += 1;
                    } else if let Some(spare) = snap.spare_device {
                        // Rebuild in progress: mirror the lost block there
                        issue_io(buf, i, spare, IoDirection::Write, actions);
                        locked += 1;
                    } else {
                        // Block exists only as parity now; ack on re-pass
                        state.set(HANDLE);
                    }
                }
            }
        }

        // ---- resync: verify or repair parity once every block is in ----
        if syncing && locked == 0 && !state.test(INSYNC) && failed <= 1 {
            let mut failed = failed;
            let mut failed_num = failed_num;
            if failed == 0 {
                debug_assert_eq!(uptodate, disks, "resync check before reads finished");
                compute_parity(buf, ParityMethod::Check);
                if is_zero(&buf.slots[pd].data) {
                    state.set(INSYNC);
                } else {
                    warn!(sector = buf.sector, "parity mismatch found during resync");
                    compute_block(buf, pd);
                    failed_num = pd;
                    failed = 1;
                }
            }
            if !state.test(INSYNC) {
                debug_assert_eq!(failed, 1);
                if !buf.slots[failed_num].uptodate {
                    compute_block(buf, failed_num);
                }
                if let Some(device) = snap.device[failed_num] {
                    issue_io(buf, failed_num, device, IoDirection::Write, actions);
                    locked += 1;
                } else if let Some(spare) = snap.spare_device {
                    issue_io(buf, failed_num, spare, IoDirection::Write, actions);
                    locked += 1;
                }
                state.set(INSYNC);
            }
        }
        if syncing && locked == 0 && state.test(INSYNC) {
            state.clear(SYNCING);
            actions.sync_event = Some(SyncEvent {
                sector: buf.sector,
                sectors: buf.sectors(),
                ok: true,
            });
        }
    }
}
