//! Sector routing
//!
//! Maps a logical array sector to its home on the member disks: the
//! stripe-aligned per-disk sector, the data-disk index holding the block,
//! and the parity-disk index for that stripe. Also provides the inverse
//! mapping, used to recover the logical sector a (stripe, disk) pair
//! serves.
//!
//! Level 4 pins parity to the last member; level 5 rotates it by stripe
//! number in one of the four classic layouts.

use crate::config::{ArrayConfig, ParityLayout, RaidLevel};

/// Where a logical sector lives on the array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeMap {
    /// Per-disk sector of the stripe row (the stripe cache key)
    pub sector: u64,
    /// Member index holding the data block
    pub dd_idx: usize,
    /// Member index holding parity for this stripe
    pub pd_idx: usize,
}

/// Geometry-derived routing for one array.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    raid_disks: usize,
    sectors_per_chunk: u64,
    level: RaidLevel,
    layout: ParityLayout,
}

impl Layout {
    pub fn new(config: &ArrayConfig) -> Self {
        Self {
            raid_disks: config.raid_disks,
            sectors_per_chunk: config.sectors_per_chunk(),
            level: config.level,
            layout: config.layout,
        }
    }

    pub fn raid_disks(&self) -> usize {
        self.raid_disks
    }

    fn data_disks(&self) -> usize {
        self.raid_disks - 1
    }

    /// Parity-disk index for a given stripe number.
    pub fn parity_disk(&self, stripe: u64) -> usize {
        let n = self.raid_disks as u64;
        match self.level {
            RaidLevel::Raid4 => self.data_disks(),
            RaidLevel::Raid5 => match self.layout {
                ParityLayout::LeftAsymmetric | ParityLayout::LeftSymmetric => {
                    (self.data_disks() as u64 - stripe % n) as usize % self.raid_disks
                }
                ParityLayout::RightAsymmetric | ParityLayout::RightSymmetric => {
                    (stripe % n) as usize
                }
            },
        }
    }

    /// Parity-disk index for the stripe containing a per-disk sector.
    ///
    /// Stripe rows are chunk-aligned per disk, so the stripe number is
    /// recoverable from the per-disk sector alone. Used by the resync
    /// driver, which walks per-disk sectors rather than logical ones.
    pub fn parity_disk_for_sector(&self, sector: u64) -> usize {
        self.parity_disk(sector / self.sectors_per_chunk)
    }

    /// Map a logical array sector to (stripe sector, data disk, parity disk).
    pub fn map_sector(&self, r_sector: u64) -> StripeMap {
        let chunk_number = r_sector / self.sectors_per_chunk;
        let chunk_offset = r_sector % self.sectors_per_chunk;

        let stripe = chunk_number / self.data_disks() as u64;
        let mut dd_idx = (chunk_number % self.data_disks() as u64) as usize;
        let pd_idx = self.parity_disk(stripe);

        if self.level == RaidLevel::Raid5 {
            match self.layout {
                ParityLayout::LeftAsymmetric | ParityLayout::RightAsymmetric => {
                    // Data indices skip over the parity slot
                    if dd_idx >= pd_idx {
                        dd_idx += 1;
                    }
                }
                ParityLayout::LeftSymmetric | ParityLayout::RightSymmetric => {
                    // Full rotation past the parity slot
                    dd_idx = (pd_idx + 1 + dd_idx) % self.raid_disks;
                }
            }
        }

        StripeMap {
            sector: stripe * self.sectors_per_chunk + chunk_offset,
            dd_idx,
            pd_idx,
        }
    }

    /// Inverse of [`map_sector`]: the logical sector served by a data block
    /// at `sector` on member `disk`.
    ///
    /// `disk` must not be the parity disk for that stripe.
    ///
    /// [`map_sector`]: Layout::map_sector
    pub fn logical_sector(&self, sector: u64, disk: usize) -> u64 {
        let stripe = sector / self.sectors_per_chunk;
        let chunk_offset = sector % self.sectors_per_chunk;
        let pd_idx = self.parity_disk(stripe);

        let dd = match self.level {
            RaidLevel::Raid4 => disk,
            RaidLevel::Raid5 => match self.layout {
                ParityLayout::LeftAsymmetric | ParityLayout::RightAsymmetric => {
                    if disk > pd_idx {
                        disk - 1
                    } else {
                        disk
                    }
                }
                ParityLayout::LeftSymmetric | ParityLayout::RightSymmetric => {
                    (disk + self.raid_disks - 1 - pd_idx) % self.raid_disks
                }
            },
        };
        debug_assert!(dd < self.data_disks());

        let chunk_number = stripe * self.data_disks() as u64 + dd as u64;
        chunk_number * self.sectors_per_chunk + chunk_offset
    }
}

// =============================================================================
// Tests
// =============================================================================
