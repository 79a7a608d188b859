//! Error types for the stripe cache engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the stripe cache engine
///
/// Disk I/O failures are *not* represented here: they propagate as data
/// (operational flags plus failure-status completion callbacks), never as
/// error values through the state machine. This enum covers the synchronous
/// configuration, capacity and administrative surfaces only.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid array configuration
    #[error("Invalid array configuration: {0}")]
    InvalidConfig(String),

    /// Buffer allocation failed while growing the stripe pool
    #[error("Stripe buffer allocation of {size} bytes failed")]
    AllocationFailed { size: usize },

    /// The cache has no stripes to shrink
    #[error("Cannot shrink cache below zero: {requested} requested, {available} idle")]
    CacheExhausted { requested: usize, available: usize },

    /// The engine is stopped and cannot accept work
    #[error("Engine is not running")]
    NotRunning,

    /// A request was not aligned to the current stripe width
    #[error("Request at sector {sector} with size {size} is not stripe-aligned")]
    UnalignedRequest { sector: u64, size: usize },

    /// No member disk matches the given device handle
    #[error("No member disk with device handle {device}")]
    UnknownDevice { device: usize },

    /// A faulty spare was reported faulty a second time
    #[error("Spare disk {number} is already non-operational")]
    SpareAlreadyFailed { number: usize },

    /// No disk with the given number exists in the table
    #[error("No disk numbered {number} in the array")]
    DiskNotFound { number: usize },

    /// The spare slot is already occupied
    #[error("Spare slot already holds disk {number}")]
    SpareSlotOccupied { number: usize },

    /// A diskop named a disk in the wrong state for the transition
    #[error("Disk {number} is not in the required state for {op}: {reason}")]
    InvalidDiskState {
        number: usize,
        op: &'static str,
        reason: &'static str,
    },

    /// Spare activation requested but no failed in-service slot exists
    #[error("No failed slot available for spare activation")]
    NoFailedSlot,
}
