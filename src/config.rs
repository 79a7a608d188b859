//! Array configuration
//!
//! Describes the geometry of the array (member count, chunk size, RAID
//! level, parity layout) and the tunables of the stripe cache. Parsing of
//! any external configuration format is out of scope; callers build an
//! [`ArrayConfig`] directly and the engine validates it at startup.

use crate::error::{Error, Result};

/// Bytes per sector. All sector arithmetic in the engine uses this unit.
pub const SECTOR_SIZE: usize = 512;

/// Default number of stripes held by the cache.
pub const DEFAULT_CACHE_STRIPES: usize = 256;

/// Default stripe width (bytes per member disk per stripe).
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default cap on stripes concurrently pulling preread data before writing.
pub const DEFAULT_PREREAD_LIMIT: usize = 1;

// =============================================================================
// RAID level and parity layout
// =============================================================================

/// Supported RAID levels.
///
/// Level 4 pins parity to the last member disk; level 5 rotates it
/// according to the configured [`ParityLayout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidLevel {
    Raid4,
    Raid5,
}

/// Parity placement algorithm for level 5.
///
/// The four classic rotations. "Left" counts the parity disk down from the
/// last member as the stripe number grows, "right" counts up from the
/// first. "Symmetric" additionally rotates the data disks past the parity
/// slot instead of merely skipping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParityLayout {
    LeftAsymmetric,
    RightAsymmetric,
    LeftSymmetric,
    RightSymmetric,
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a stripe cache engine instance.
#[derive(Debug, Clone)]
pub struct ArrayConfig {
    /// Number of in-service member disks, including the parity disk
    pub raid_disks: usize,

    /// Chunk size in bytes (contiguous run per disk before rotation)
    pub chunk_size: usize,

    /// RAID level (4 or 5)
    pub level: RaidLevel,

    /// Parity placement for level 5; ignored for level 4
    pub layout: ParityLayout,

    /// Number of stripes to allocate at startup
    pub cache_stripes: usize,

    /// Initial stripe width in bytes per disk
    pub buffer_size: usize,

    /// Maximum stripes concurrently holding preread buffers before writing
    pub preread_limit: usize,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            raid_disks: 4,
            chunk_size: 64 * 1024,
            level: RaidLevel::Raid5,
            layout: ParityLayout::LeftSymmetric,
            cache_stripes: DEFAULT_CACHE_STRIPES,
            buffer_size: DEFAULT_BUFFER_SIZE,
            preread_limit: DEFAULT_PREREAD_LIMIT,
        }
    }
}

impl ArrayConfig {
    /// Validate the configuration, returning a typed error on violation.
    pub fn validate(&self) -> Result<()> {
        if self.raid_disks < 2 {
            return Err(Error::InvalidConfig(format!(
                "raid_disks must be at least 2, got {}",
                self.raid_disks
            )));
        }
        if self.chunk_size < SECTOR_SIZE || !self.chunk_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "chunk_size must be a power of two of at least {} bytes, got {}",
                SECTOR_SIZE, self.chunk_size
            )));
        }
        Self::validate_buffer_size(self.buffer_size, self.chunk_size)?;
        if self.cache_stripes == 0 {
            return Err(Error::InvalidConfig(
                "cache_stripes must be non-zero".to_string(),
            ));
        }
        if self.preread_limit == 0 {
            return Err(Error::InvalidConfig(
                "preread_limit must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate a stripe width against a chunk size.
    ///
    /// Also used when a caller requests a global buffer-size change through
    /// the cache, which must keep the new width compatible with the array
    /// geometry.
    pub fn validate_buffer_size(buffer_size: usize, chunk_size: usize) -> Result<()> {
        if buffer_size < SECTOR_SIZE
            || !buffer_size.is_power_of_two()
            || buffer_size > chunk_size
            || chunk_size % buffer_size != 0
        {
            return Err(Error::InvalidConfig(format!(
                "buffer_size {} must be a power of two between {} and chunk_size {}",
                buffer_size, SECTOR_SIZE, chunk_size
            )));
        }
        Ok(())
    }

    /// Number of data disks (members minus the one parity disk).
    pub fn data_disks(&self) -> usize {
        self.raid_disks - 1
    }

    /// Sectors covered by one chunk on one disk.
    pub fn sectors_per_chunk(&self) -> u64 {
        (self.chunk_size / SECTOR_SIZE) as u64
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config_is_valid() {
        let config = ArrayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.data_disks(), 3);
        assert_eq!(config.sectors_per_chunk(), 128);
    }

    #[test]
    fn test_too_few_disks_rejected() {
        let config = ArrayConfig {
            raid_disks: 1,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::InvalidConfig(_)));
    }

    #[test]
    fn test_chunk_size_must_be_power_of_two() {
        let config = ArrayConfig {
            chunk_size: 3000,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::InvalidConfig(_)));
    }

    #[test]
    fn test_buffer_size_must_divide_chunk() {
        let config = ArrayConfig {
            chunk_size: 4096,
            buffer_size: 8192,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::InvalidConfig(_)));
    }

    #[test]
    fn test_buffer_size_equal_to_chunk_allowed() {
        let config = ArrayConfig {
            chunk_size: 4096,
            buffer_size: 4096,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
