//! Member-disk table and administrative disk operations
//!
//! Tracks the operational state of every member disk plus one optional
//! spare slot. The table is mutated only under the configuration lock the
//! engine wraps around it; the state machine reads a snapshot of the
//! operational flags and reports failures back here rather than mutating
//! the table itself.

use tracing::{info, warn};

use crate::error::{Error, Result};

/// Per-member-disk record.
#[derive(Debug, Clone)]
pub struct DiskInfo {
    /// Stable disk number
    pub number: usize,
    /// Device handle the backend addresses; cleared on hot-remove
    pub device: Option<usize>,
    /// RAID position this disk serves
    pub raid_disk: usize,
    pub operational: bool,
    pub spare: bool,
    /// Spare being rebuilt: receives writes but serves no reads
    pub write_only: bool,
}

/// Administrative disk-state transitions, each validated and atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskOp {
    /// Begin rebuilding onto a spare: it starts receiving writes
    SpareWrite { number: usize },
    /// Promote a rebuilt spare into a failed in-service slot
    SpareActive { number: usize },
    /// Stop using a spare that was being rebuilt
    SpareInactive { number: usize },
    /// Attach a new spare
    HotAdd { number: usize, device: usize },
    /// Detach a non-operational disk
    HotRemove { number: usize },
}

/// Read-only view the state machine works against.
#[derive(Debug, Clone)]
pub struct DiskSnapshot {
    /// Device handle per RAID position; `None` where the member is failed
    /// or has been removed
    pub device: Vec<Option<usize>>,
    /// Device handle of a write-only spare, if a rebuild is underway
    pub spare_device: Option<usize>,
}

impl DiskSnapshot {
    /// Whether the member at RAID position `i` can serve I/O.
    pub fn operational(&self, i: usize) -> bool {
        self.device[i].is_some()
    }
}

// =============================================================================
// Disk table
// =============================================================================

#[derive(Debug)]
pub struct DiskTable {
    raid_disks: usize,
    in_service: Vec<DiskInfo>,
    spare: Option<DiskInfo>,
    working: usize,
    failed: usize,
}

impl DiskTable {
    /// Build a fully-operational table with device handles equal to RAID
    /// positions.
    pub fn new(raid_disks: usize) -> Self {
        let in_service = (0..raid_disks)
            .map(|i| DiskInfo {
                number: i,
                device: Some(i),
                raid_disk: i,
                operational: true,
                spare: false,
                write_only: false,
            })
            .collect();
        Self {
            raid_disks,
            in_service,
            spare: None,
            working: raid_disks,
            failed: 0,
        }
    }

    pub fn working(&self) -> usize {
        self.working
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Snapshot for the state machine: operational flags, device routing
    /// and the rebuild target if any.
    pub fn snapshot(&self) -> DiskSnapshot {
        DiskSnapshot {
            device: self
                .in_service
                .iter()
                .map(|d| if d.operational { d.device } else { None })
                .collect(),
            spare_device: self
                .spare
                .as_ref()
                .filter(|s| s.operational && s.write_only)
                .and_then(|s| s.device),
        }
    }

    /// Mark the disk with device handle `device` non-operational.
    ///
    /// Matches in-service disks and the spare. Reporting an already-failed
    /// spare again is an error (a double fault injected from above);
    /// re-reporting a failed in-service disk is idempotent.
    pub fn mark_faulty(&mut self, device: usize) -> Result<()> {
        if let Some(disk) = self
            .in_service
            .iter_mut()
            .find(|d| d.device == Some(device))
        {
            if disk.operational {
                disk.operational = false;
                self.working -= 1;
                self.failed += 1;
                warn!(
                    device,
                    raid_disk = disk.raid_disk,
                    working = self.working,
                    "disk marked faulty"
                );
            }
            return Ok(());
        }
        if let Some(spare) = self.spare.as_mut().filter(|s| s.device == Some(device)) {
            if !spare.operational {
                return Err(Error::SpareAlreadyFailed {
                    number: spare.number,
                });
            }
            spare.operational = false;
            warn!(device, number = spare.number, "spare marked faulty");
            return Ok(());
        }
        Err(Error::UnknownDevice { device })
    }

    /// Perform one administrative transition. Preconditions are validated
    /// up front; on any violation the table is left untouched.
    pub fn diskop(&mut self, op: DiskOp) -> Result<()> {
        match op {
            DiskOp::SpareWrite { number } => {
                let spare = self.spare_mut(number, "spare_write")?;
                if spare.write_only {
                    return Err(Error::InvalidDiskState {
                        number,
                        op: "spare_write",
                        reason: "already rebuilding",
                    });
                }
                if !spare.operational {
                    return Err(Error::InvalidDiskState {
                        number,
                        op: "spare_write",
                        reason: "spare is non-operational",
                    });
                }
                spare.write_only = true;
                info!(number, "spare rebuild started");
                Ok(())
            }
            DiskOp::SpareActive { number } => {
                {
                    let spare = self.spare_mut(number, "spare_active")?;
                    if !spare.operational || !spare.write_only {
                        return Err(Error::InvalidDiskState {
                            number,
                            op: "spare_active",
                            reason: "spare is not a rebuilt, operational target",
                        });
                    }
                }
                let slot = self
                    .in_service
                    .iter()
                    .position(|d| !d.operational)
                    .ok_or(Error::NoFailedSlot)?;
                // Swap descriptors: the spare takes over the failed slot's
                // position, the failed disk's record moves to the spare
                // slot, preserving both numbers.
                let mut spare = self.spare.take().expect("validated above");
                let mut old = std::mem::replace(&mut self.in_service[slot], spare.clone());
                let raid_disk = old.raid_disk;
                spare.raid_disk = raid_disk;
                spare.spare = false;
                spare.write_only = false;
                self.in_service[slot] = spare;
                old.spare = true;
                old.raid_disk = self.raid_disks;
                self.spare = Some(old);
                self.working += 1;
                self.failed -= 1;
                info!(number, raid_disk, "spare activated into failed slot");
                Ok(())
            }
            DiskOp::SpareInactive { number } => {
                let spare = self.spare_mut(number, "spare_inactive")?;
                if !spare.write_only {
                    return Err(Error::InvalidDiskState {
                        number,
                        op: "spare_inactive",
                        reason: "spare is not rebuilding",
                    });
                }
                spare.write_only = false;
                info!(number, "spare rebuild abandoned");
                Ok(())
            }
            DiskOp::HotAdd { number, device } => {
                if let Some(existing) = &self.spare {
                    return Err(Error::SpareSlotOccupied {
                        number: existing.number,
                    });
                }
                if self.in_service.iter().any(|d| d.number == number) {
                    return Err(Error::InvalidDiskState {
                        number,
                        op: "hot_add",
                        reason: "number already in service",
                    });
                }
                self.spare = Some(DiskInfo {
                    number,
                    device: Some(device),
                    raid_disk: self.raid_disks,
                    operational: true,
                    spare: true,
                    write_only: false,
                });
                info!(number, device, "spare attached");
                Ok(())
            }
            DiskOp::HotRemove { number } => {
                if let Some(spare) = self.spare.as_ref().filter(|s| s.number == number) {
                    if spare.write_only {
                        return Err(Error::InvalidDiskState {
                            number,
                            op: "hot_remove",
                            reason: "spare is rebuilding",
                        });
                    }
                    self.spare = None;
                    info!(number, "spare detached");
                    return Ok(());
                }
                let disk = self
                    .in_service
                    .iter_mut()
                    .find(|d| d.number == number)
                    .ok_or(Error::DiskNotFound { number })?;
                if disk.operational {
                    return Err(Error::InvalidDiskState {
                        number,
                        op: "hot_remove",
                        reason: "disk is still operational",
                    });
                }
                // Failed in-service disks keep their slot (the position
                // must remain addressable); removal forgets the device
                // handle so it no longer resolves and can be re-used.
                disk.device = None;
                info!(number, "failed disk detached");
                Ok(())
            }
        }
    }

    fn spare_mut(&mut self, number: usize, op: &'static str) -> Result<&mut DiskInfo> {
        match self.spare.as_mut() {
            Some(s) if s.number == number => Ok(s),
            Some(_) | None => Err(Error::InvalidDiskState {
                number,
                op,
                reason: "no such spare",
            }),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
