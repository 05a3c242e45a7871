//! Event notifier
//!
//! Watchers subscribe with an event mask and get kicked over a signalled
//! segment whenever somebody raises an intersecting event. Delivery is
//! coalescing: any number of signals between two acks arrives as a single
//! readiness event, so subscribers re-read registry state rather than
//! counting wakeups.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use hobbes_core::EventMask;

use crate::error::Result;
use crate::registry::Registry;

/// An event subscription.
///
/// Dropping the notifier withdraws both the subscription row and the
/// signalled segment.
pub struct Notifier {
    registry: Registry,
    signal: xemem::SignalFd,
    mask: EventMask,
}

impl Notifier {
    pub fn create(registry: &Registry, mask: EventMask) -> Result<Notifier> {
        let (segid, signal) = xemem::make_signalled(Arc::new(()), None)?;
        registry.create_notifier(segid, mask)?;
        Ok(Notifier {
            registry: registry.clone(),
            signal,
            mask,
        })
    }

    /// The fd to multiplex for event delivery.
    pub fn fd(&self) -> RawFd {
        self.signal.as_raw_fd()
    }

    pub fn mask(&self) -> EventMask {
        self.mask
    }

    /// Acknowledge delivery, draining all coalesced signals.
    pub fn ack(&self) -> Result<u64> {
        Ok(self.signal.ack()?)
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        if let Err(e) = self.registry.delete_notifier(self.signal.segid()) {
            log::warn!("Could not remove notifier row: {}", e);
        }
    }
}

/// Raise events for every subscriber whose mask intersects.
///
/// Notification is advisory: per-subscriber failures are logged and
/// swallowed so a dead watcher never wedges the caller.
pub fn notify(registry: &Registry, mask: EventMask) {
    let segids = match registry.event_subscribers(mask) {
        Ok(segids) => segids,
        Err(e) => {
            log::warn!("Could not enumerate event subscribers: {}", e);
            return;
        }
    };

    log::debug!("Notifying {} subscribers of {:?}", segids.len(), mask);

    for segid in segids {
        if let Err(e) = xemem::signal_segid(segid) {
            log::warn!("Could not signal subscriber {}: {}", segid, e);
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use hobbes_core::EventMask;

    use super::*;
    use crate::registry::testutil::fresh_registry;

    #[test]
    fn events_reach_matching_subscribers() {
        let registry = fresh_registry();

        let enclave_watcher = Notifier::create(&registry, EventMask::ENCLAVE).unwrap();
        let app_watcher = Notifier::create(&registry, EventMask::APPLICATION).unwrap();

        notify(&registry, EventMask::ENCLAVE);
        notify(&registry, EventMask::ENCLAVE);

        // Two events coalesce into one delivery; the wrong-mask watcher
        // stays quiet.
        assert_eq!(enclave_watcher.ack().unwrap(), 2);
        assert_eq!(enclave_watcher.ack().unwrap(), 0);
        assert_eq!(app_watcher.ack().unwrap(), 0);
    }

    #[test]
    fn dropping_a_notifier_unsubscribes() {
        let registry = fresh_registry();

        let watcher = Notifier::create(&registry, EventMask::RESOURCE).unwrap();
        assert_eq!(
            registry
                .event_subscribers(EventMask::RESOURCE)
                .unwrap()
                .len(),
            1
        );

        drop(watcher);
        assert!(registry
            .event_subscribers(EventMask::RESOURCE)
            .unwrap()
            .is_empty());
    }
}
