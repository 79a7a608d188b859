//! # stripecache
//!
//! A RAID-4/5 stripe cache engine: parity-protected striping over an
//! asynchronous disk backend, with a fixed pool of re-keyable stripe
//! buffers, a per-stripe state machine, XOR parity in read-modify-write
//! and reconstruct-write flavors, degraded-mode reconstruction, a
//! background resync driver and hot-spare rebuild support.
//!
//! ## Architecture
//!
//! - [`cache`]: hash plus idle/ready/delayed lists over the stripe pool
//! - [`stripe`]: one cache line, per-disk buffers and request queues
//! - [`layout`]: logical-sector to (stripe, data disk, parity disk) routing
//! - [`parity`]: XOR engine behind the three parity methods
//! - `state`: the per-stripe state machine
//! - `worker`: background thread draining completions and ready stripes
//! - [`disks`]: member-disk table and administrative transitions
//! - [`engine`]: the public facade tying it all together
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use stripecache::{ArrayConfig, DiskBackend, IoDirection, StripeEngine};
//!
//! # fn demo(backend: Arc<dyn DiskBackend>) -> stripecache::Result<()> {
//! let engine = StripeEngine::new(ArrayConfig::default(), backend)?;
//! engine.start();
//! engine.handle_request(0, 4096, IoDirection::Read, None, Box::new(|outcome| {
//!     println!("read {} bytes", outcome.data.map(|d| d.len()).unwrap_or(0));
//! }))?;
//! engine.stop();
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod disks;
pub mod engine;
pub mod error;
pub mod layout;
pub mod parity;
pub mod request;
mod state;
pub mod stripe;
mod worker;

pub use cache::CacheStats;
pub use config::{ArrayConfig, ParityLayout, RaidLevel, SECTOR_SIZE};
pub use disks::DiskOp;
pub use engine::StripeEngine;
pub use error::{Error, Result};
pub use request::{
    CompletionSink, DiskBackend, DiskRequest, IoDirection, IoStatus, RequestCallback,
    RequestOutcome, SyncEvent,
};
