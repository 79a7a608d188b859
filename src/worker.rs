//! Background worker
//!
//! One thread owns the slow path: it drains completion events from the
//! backend, runs state-machine passes over stripes queued on the ready
//! list, and promotes delayed writes once the ready list empties and the
//! preread budget has room. Everything it does is also safe from request
//! context; the thread exists so completions and deferred work never run
//! inside a caller.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::engine::StripeEngine;
use crate::request::EngineEvent;

pub(crate) fn run(engine: Arc<StripeEngine>) {
    debug!("stripe worker started");
    loop {
        let mut handled = 0usize;
        while let Ok(event) = engine.events_rx.try_recv() {
            match event {
                EngineEvent::IoDone { token, data, ok } => {
                    engine.apply_completion(token, data, ok);
                    handled += 1;
                }
                EngineEvent::Wake => {}
                EngineEvent::Shutdown => {
                    debug!("stripe worker stopping");
                    return;
                }
            }
        }

        // Delayed stripes only start their prereads once no other stripe
        // is ready, the device is unplugged and the budget has room.
        if engine.cache.ready_is_empty()
            && !engine.plugged.load(Ordering::SeqCst)
            && engine.preread_active.load(Ordering::SeqCst) < engine.config.preread_limit
        {
            let promoted = engine.cache.activate_delayed();
            if promoted > 0 {
                engine.preread_active.fetch_add(promoted, Ordering::SeqCst);
                trace!(promoted, "delayed stripes activated");
            }
        }

        if let Some(stripe) = engine.cache.next_ready() {
            engine.handle_stripe(&stripe);
            engine.release_stripe(&stripe);
            continue;
        }
        if handled > 0 {
            continue;
        }

        match engine.events_rx.recv() {
            Ok(EngineEvent::IoDone { token, data, ok }) => engine.apply_completion(token, data, ok),
            Ok(EngineEvent::Wake) => {}
            Ok(EngineEvent::Shutdown) | Err(_) => {
                debug!("stripe worker stopping");
                return;
            }
        }
    }
}
