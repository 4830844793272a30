//! Listener traits and the registries that fan events out to them.
//!
//! Events are delivered inline on the task that received the packet, to
//! keep latency down. Listeners must therefore return quickly and hand
//! anything slow to their own task.

use std::collections::HashSet;
use std::net::IpAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::proto::{BeatPacket, MediaDetails};
use crate::registry::DeviceAnnouncement;
use crate::DeviceUpdate;

/// Receives notification when a component starts or stops.
pub trait LifecycleListener: Send + Sync {
    fn started(&self);
    fn stopped(&self);
}

/// Receives every status update a device sends us.
pub trait DeviceUpdateListener: Send + Sync {
    fn received(&self, update: &DeviceUpdate);
}

/// Receives changes related to the tempo master: who it is, the tempo it
/// dictates, and the beats it plays.
pub trait MasterListener: Send + Sync {
    /// A new master was chosen, or (`None`) the old one resigned.
    fn master_changed(&self, update: Option<&DeviceUpdate>);
    fn tempo_changed(&self, tempo: f64);
    fn new_beat(&self, beat: &BeatPacket);
}

/// Receives answers to media queries.
pub trait MediaDetailsListener: Send + Sync {
    fn details_available(&self, details: &MediaDetails);
}

/// Receives device arrivals and departures from the registry.
pub trait DeviceAnnouncementListener: Send + Sync {
    fn device_found(&self, announcement: &DeviceAnnouncement);
    fn device_lost(&self, announcement: &DeviceAnnouncement);
}

/// Receives every beat packet heard on the beat port.
pub trait BeatListener: Send + Sync {
    fn new_beat(&self, beat: &BeatPacket, source: IpAddr);
}

/// Receives sync-control commands addressed to us.
pub trait SyncCommandListener: Send + Sync {
    fn sync_mode(&self, synced: bool);
    fn become_master(&self);
}

/// Receives fader-start commands from the mixer.
pub trait FaderStartListener: Send + Sync {
    fn faders_changed(&self, start: &HashSet<u8>, stop: &HashSet<u8>);
}

/// Receives the mixer's channels-on-air reports.
pub trait OnAirListener: Send + Sync {
    fn channels_on_air(&self, audible: &HashSet<u8>);
}

/// Receives the two halves of the master handoff conversation.
pub trait MasterHandoffListener: Send + Sync {
    /// Another device asks us to hand the master role to `device_number`.
    fn yield_master_to(&self, device_number: u8);
    /// A device answers our handoff request.
    fn yield_response(&self, device_number: u8, yielded: bool);
}

/// A set of listeners that is snapshotted before iteration, so delivery
/// never holds the lock and a listener can deregister itself mid-event.
pub(crate) struct Listeners<L: ?Sized> {
    items: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized> Listeners<L> {
    pub(crate) fn new() -> Listeners<L> {
        Listeners {
            items: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener. Adding one that is already present does
    /// nothing.
    pub(crate) fn add(&self, listener: Arc<L>) {
        let mut items = self.items.lock().unwrap();
        if !items.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            items.push(listener);
        }
    }

    /// Deregister a listener; unknown listeners are ignored.
    pub(crate) fn remove(&self, listener: &Arc<L>) {
        self.items
            .lock()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        self.items.lock().unwrap().clone()
    }
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Listeners::new()
    }
}

/// Run one listener callback, isolating a panic so that a broken listener
/// cannot halt fan-out or kill the ingest loop.
pub(crate) fn guard<F: FnOnce()>(event: &str, deliver: F) {
    if catch_unwind(AssertUnwindSafe(deliver)).is_err() {
        warn!(target: "vlink", "listener panicked handling {} event", event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    trait Counter: Send + Sync {
        fn bump(&self);
    }

    struct Good(AtomicU32);

    impl Counter for Good {
        fn bump(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Bad;

    impl Counter for Bad {
        fn bump(&self) {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_add_remove_by_identity() {
        let listeners: Listeners<dyn Counter> = Listeners::new();
        let a: Arc<dyn Counter> = Arc::new(Good(AtomicU32::new(0)));
        listeners.add(a.clone());
        listeners.add(a.clone());
        assert_eq!(listeners.snapshot().len(), 1);
        listeners.remove(&a);
        assert!(listeners.snapshot().is_empty());
    }

    #[test]
    fn test_panicking_listener_does_not_stop_fanout() {
        let listeners: Listeners<dyn Counter> = Listeners::new();
        let good = Arc::new(Good(AtomicU32::new(0)));
        listeners.add(Arc::new(Bad) as Arc<dyn Counter>);
        listeners.add(good.clone() as Arc<dyn Counter>);

        for listener in listeners.snapshot() {
            guard("test", || listener.bump());
        }
        assert_eq!(good.0.load(Ordering::SeqCst), 1);
    }
}
