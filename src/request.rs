//! Request and completion plumbing
//!
//! Host-facing request/callback types, the backend trait the engine drives
//! disk I/O through, and the completion-event channel that turns
//! interrupt-context completions into messages drained by the background
//! worker.

use bytes::Bytes;
use crossbeam::channel::Sender;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// Final status of a host request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Ok,
    Failed,
}

/// What a host request resolved to.
///
/// `data` is populated for successful reads and `None` otherwise.
#[derive(Debug)]
pub struct RequestOutcome {
    pub sector: u64,
    pub direction: IoDirection,
    pub status: IoStatus,
    pub data: Option<Bytes>,
}

/// Completion callback for a host request.
///
/// Invoked exactly once, outside all engine locks, when the request
/// finishes (possibly with failure status). There is no cancellation: a
/// request attached to a stripe always completes.
pub type RequestCallback = Box<dyn FnOnce(RequestOutcome) + Send + 'static>;

// =============================================================================
// Disk backend interface
// =============================================================================

/// Opaque handle identifying one in-flight disk I/O.
///
/// Backends must echo the token unchanged when reporting completion.
#[derive(Debug, Clone)]
pub struct IoToken {
    pub(crate) sector: u64,
    pub(crate) disk: usize,
    pub(crate) device: usize,
    pub(crate) direction: IoDirection,
}

/// One disk I/O the engine wants performed.
#[derive(Debug)]
pub struct DiskRequest {
    /// Device handle to address (already redirected to a spare if needed)
    pub device: usize,
    /// Per-disk sector to transfer at
    pub sector: u64,
    /// Transfer length in bytes
    pub len: usize,
    pub direction: IoDirection,
    /// Payload for writes, `None` for reads
    pub data: Option<Bytes>,
    /// Completion handle, echoed back through the [`CompletionSink`]
    pub token: IoToken,
}

/// Asynchronous block I/O provider.
///
/// `submit` must not block on the transfer; completion is reported through
/// the sink, from any thread. A successful read must deliver exactly
/// `request.len` bytes.
pub trait DiskBackend: Send + Sync {
    fn submit(&self, request: DiskRequest, done: &CompletionSink);
}

// =============================================================================
// Completion events
// =============================================================================

pub(crate) enum EngineEvent {
    IoDone {
        token: IoToken,
        data: Option<Bytes>,
        ok: bool,
    },
    Wake,
    Shutdown,
}

/// Where backends report I/O completion.
///
/// Cheap to clone; completions become events on the worker's queue rather
/// than running engine logic in the completion context.
#[derive(Clone)]
pub struct CompletionSink {
    pub(crate) tx: Sender<EngineEvent>,
}

impl CompletionSink {
    /// Report a successful transfer. Reads pass the data back.
    pub fn success(&self, token: IoToken, data: Option<Bytes>) {
        let _ = self.tx.send(EngineEvent::IoDone {
            token,
            data,
            ok: true,
        });
    }

    /// Report a failed transfer.
    pub fn failure(&self, token: IoToken) {
        let _ = self.tx.send(EngineEvent::IoDone {
            token,
            data: None,
            ok: false,
        });
    }
}

/// Progress report from the resync driver.
///
/// One event per stripe that finishes (or aborts) its resync pass,
/// the message-passing equivalent of a done-sync callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncEvent {
    /// Stripe-aligned per-disk sector
    pub sector: u64,
    /// Sectors covered by this stripe's pass
    pub sectors: u64,
    /// False when the resync of this stripe was aborted
    pub ok: bool,
}
