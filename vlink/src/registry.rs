use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::{
    net::UdpSocket,
    sync::watch,
    time::{self, Instant},
};

use crate::listener::{self, DeviceAnnouncementListener, LifecycleListener, Listeners};
use crate::metronome::now_ns;
use crate::proto::{self, Packet};
use crate::Result;

/// How long a device may stay silent before we conclude it has left.
pub const MAX_AGE: Duration = Duration::from_secs(10);

/// A device we have seen announcing itself on the network.
#[derive(Clone, Debug)]
pub struct DeviceAnnouncement {
    pub number: u8,
    pub name: String,
    pub address: IpAddr,
    pub mac_addr: [u8; 6],
    pub last_seen: Instant,
}

impl DeviceAnnouncement {
    fn is_same_device(&self, other: &DeviceAnnouncement) -> bool {
        self.number == other.number && self.name == other.name
    }
}

/// Watches the announcement port and keeps track of which devices are
/// currently part of the DJ Link network.
pub struct DeviceRegistry {
    state: Arc<RegistryState>,
}

pub(crate) struct RegistryState {
    devices: Mutex<HashMap<IpAddr, DeviceAnnouncement>>,
    ignored: Mutex<HashSet<IpAddr>>,
    /// Milliseconds (process-monotonic) at which the first announcement
    /// since start was seen; zero while no device is known.
    first_device_time: AtomicI64,
    running: Mutex<Option<watch::Sender<bool>>>,
    device_listeners: Listeners<dyn DeviceAnnouncementListener>,
    lifecycle_listeners: Listeners<dyn LifecycleListener>,
}

fn now_ms() -> i64 {
    now_ns() / 1_000_000
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        DeviceRegistry {
            state: Arc::new(RegistryState {
                devices: Mutex::new(HashMap::new()),
                ignored: Mutex::new(HashSet::new()),
                first_device_time: AtomicI64::new(0),
                running: Mutex::new(None),
                device_listeners: Listeners::new(),
                lifecycle_listeners: Listeners::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.lock().unwrap().is_some()
    }

    /// Open the announcement port and begin tracking devices. Does nothing
    /// if we are already running.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let socket = UdpSocket::bind(("0.0.0.0", proto::ANNOUNCEMENT_PORT)).await?;
        socket.set_broadcast(true)?;

        let (running_tx, running_rx) = watch::channel(true);
        {
            let mut running = self.state.running.lock().unwrap();
            if running.is_some() {
                return Ok(()); // lost a start race, the other one wins
            }
            *running = Some(running_tx);
        }

        let state = self.state.clone();
        tokio::spawn(async move {
            state.run(socket, running_rx).await;
        });

        info!(target: "vlink", "device registry started");
        for l in self.state.lifecycle_listeners.snapshot() {
            listener::guard("lifecycle started", || l.started());
        }
        Ok(())
    }

    /// Stop watching the network, reporting every known device as lost.
    /// Idempotent.
    pub fn stop(&self) {
        let running = self.state.running.lock().unwrap().take();
        if let Some(running) = running {
            let _ = running.send(false);
            self.state.flush_devices();
            info!(target: "vlink", "device registry stopped");
            for l in self.state.lifecycle_listeners.snapshot() {
                listener::guard("lifecycle stopped", || l.stopped());
            }
        }
    }

    /// A snapshot of the devices currently active on the network.
    pub fn current_devices(&self) -> Vec<DeviceAnnouncement> {
        self.state.devices.lock().unwrap().values().cloned().collect()
    }

    /// The most recent announcement from the device with the given number.
    pub fn latest_announcement_from(&self, device_number: u8) -> Option<DeviceAnnouncement> {
        self.state
            .devices
            .lock()
            .unwrap()
            .values()
            .find(|d| d.number == device_number)
            .cloned()
    }

    /// Process-monotonic milliseconds at which the first announcement was
    /// observed, or zero if no device has been seen (or all have left).
    pub fn first_device_time_ms(&self) -> i64 {
        self.state.first_device_time.load(Ordering::Acquire)
    }

    /// Announcements from this address will be disregarded; the virtual
    /// player registers its own bound address here so it does not track
    /// itself.
    pub fn add_ignored_address(&self, address: IpAddr) {
        self.state.ignored.lock().unwrap().insert(address);
    }

    pub fn remove_ignored_address(&self, address: IpAddr) {
        self.state.ignored.lock().unwrap().remove(&address);
    }

    pub fn add_device_listener(&self, listener: Arc<dyn DeviceAnnouncementListener>) {
        self.state.device_listeners.add(listener);
    }

    pub fn remove_device_listener(&self, listener: &Arc<dyn DeviceAnnouncementListener>) {
        self.state.device_listeners.remove(listener);
    }

    pub fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.state.lifecycle_listeners.add(listener);
    }

    pub fn remove_lifecycle_listener(&self, listener: &Arc<dyn LifecycleListener>) {
        self.state.lifecycle_listeners.remove(listener);
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        DeviceRegistry::new()
    }
}

impl RegistryState {
    async fn run(self: Arc<Self>, socket: UdpSocket, mut running: watch::Receiver<bool>) {
        let mut buf = [0u8; 512];
        let mut expiry = time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = running.changed() => {
                    if !*running.borrow() {
                        return;
                    }
                }
                _ = expiry.tick() => {
                    self.expire(Instant::now());
                }
                res = socket.recv_from(&mut buf) => {
                    match res {
                        Ok((len, src)) => self.handle_datagram(&buf[..len], src),
                        Err(e) => {
                            warn!(target: "vlink", "announcement socket failed, registry stopping: {}", e);
                            self.fail_from_task();
                            return;
                        }
                    }
                }
            }
        }
    }

    fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        if self.ignored.lock().unwrap().contains(&src.ip()) {
            return;
        }
        match Packet::parse(data, proto::ANNOUNCEMENT_PORT) {
            Ok(Packet::Announcement(announcement)) => {
                self.update_device(DeviceAnnouncement {
                    number: announcement.device_number,
                    name: announcement.name,
                    address: src.ip(),
                    mac_addr: announcement.mac_addr,
                    last_seen: Instant::now(),
                });
            }
            Ok(_) => {}
            Err(e) => debug!(target: "vlink", "can't parse announcement: {}", e),
        }
    }

    pub(crate) fn update_device(&self, announcement: DeviceAnnouncement) {
        let (lost, found) = {
            let mut devices = self.devices.lock().unwrap();
            match devices.insert(announcement.address, announcement.clone()) {
                Some(previous) if !previous.is_same_device(&announcement) => {
                    (Some(previous), Some(announcement))
                }
                Some(_) => (None, None), // refresh only
                None => (None, Some(announcement)),
            }
        };

        if let Some(previous) = lost {
            info!(target: "vlink", "device changed at {}: {:?} replaced", previous.address, previous);
            for l in self.device_listeners.snapshot() {
                listener::guard("device lost", || l.device_lost(&previous));
            }
        }
        if let Some(announcement) = found {
            let _ = self.first_device_time.compare_exchange(
                0,
                now_ms(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            info!(target: "vlink", "device found: {:?}", announcement);
            for l in self.device_listeners.snapshot() {
                listener::guard("device found", || l.device_found(&announcement));
            }
        }
    }

    pub(crate) fn expire(&self, now: Instant) {
        let expired: Vec<DeviceAnnouncement> = {
            let mut devices = self.devices.lock().unwrap();
            let stale: Vec<IpAddr> = devices
                .iter()
                .filter(|(_, d)| now.saturating_duration_since(d.last_seen) > MAX_AGE)
                .map(|(addr, _)| *addr)
                .collect();
            let removed = stale.iter().filter_map(|addr| devices.remove(addr)).collect();
            if devices.is_empty() {
                self.first_device_time.store(0, Ordering::Release);
            }
            removed
        };

        for device in expired {
            info!(target: "vlink", "device lost: {:?}", device);
            for l in self.device_listeners.snapshot() {
                listener::guard("device lost", || l.device_lost(&device));
            }
        }
    }

    /// Report everything lost and reset, used when stopping.
    fn flush_devices(&self) {
        let flushed: Vec<DeviceAnnouncement> = {
            let mut devices = self.devices.lock().unwrap();
            self.first_device_time.store(0, Ordering::Release);
            devices.drain().map(|(_, d)| d).collect()
        };
        for device in flushed {
            for l in self.device_listeners.snapshot() {
                listener::guard("device lost", || l.device_lost(&device));
            }
        }
    }

    /// Socket failure inside the run loop: mirror `stop()` without the
    /// handle.
    fn fail_from_task(&self) {
        let running = self.running.lock().unwrap().take();
        if running.is_some() {
            self.flush_devices();
            for l in self.lifecycle_listeners.snapshot() {
                listener::guard("lifecycle stopped", || l.stopped());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        found: Mutex<Vec<u8>>,
        lost: Mutex<Vec<u8>>,
    }

    impl Recorder {
        fn new() -> Arc<Recorder> {
            Arc::new(Recorder {
                found: Mutex::new(Vec::new()),
                lost: Mutex::new(Vec::new()),
            })
        }
    }

    impl DeviceAnnouncementListener for Recorder {
        fn device_found(&self, announcement: &DeviceAnnouncement) {
            self.found.lock().unwrap().push(announcement.number);
        }

        fn device_lost(&self, announcement: &DeviceAnnouncement) {
            self.lost.lock().unwrap().push(announcement.number);
        }
    }

    fn announcement(number: u8, last_octet: u8) -> DeviceAnnouncement {
        DeviceAnnouncement {
            number,
            name: format!("CDJ-{}", number),
            address: IpAddr::from([192, 168, 1, last_octet]),
            mac_addr: [0, 0, 0, 0, 0, last_octet],
            last_seen: Instant::now(),
        }
    }

    #[test]
    fn test_found_and_refresh() {
        let registry = DeviceRegistry::new();
        let recorder = Recorder::new();
        registry.add_device_listener(recorder.clone());

        registry.state.update_device(announcement(2, 12));
        registry.state.update_device(announcement(2, 12));
        assert_eq!(*recorder.found.lock().unwrap(), vec![2]);
        assert!(recorder.lost.lock().unwrap().is_empty());
        assert_eq!(registry.current_devices().len(), 1);
        assert!(registry.first_device_time_ms() > 0);
        assert_eq!(registry.latest_announcement_from(2).unwrap().number, 2);
        assert!(registry.latest_announcement_from(3).is_none());
    }

    #[test]
    fn test_renumbered_device_reports_lost_then_found() {
        let registry = DeviceRegistry::new();
        let recorder = Recorder::new();
        registry.add_device_listener(recorder.clone());

        registry.state.update_device(announcement(2, 12));
        let mut renumbered = announcement(3, 12);
        renumbered.name = "CDJ-3".to_string();
        registry.state.update_device(renumbered);

        assert_eq!(*recorder.found.lock().unwrap(), vec![2, 3]);
        assert_eq!(*recorder.lost.lock().unwrap(), vec![2]);
        assert_eq!(registry.current_devices().len(), 1);
    }

    #[test]
    fn test_expiry_resets_first_device_time() {
        let registry = DeviceRegistry::new();
        let recorder = Recorder::new();
        registry.add_device_listener(recorder.clone());

        registry.state.update_device(announcement(4, 14));
        assert!(registry.first_device_time_ms() > 0);

        registry.state.expire(Instant::now() + MAX_AGE + Duration::from_secs(1));
        assert_eq!(*recorder.lost.lock().unwrap(), vec![4]);
        assert!(registry.current_devices().is_empty());
        assert_eq!(registry.first_device_time_ms(), 0);
    }

    #[test]
    fn test_expiry_keeps_fresh_devices() {
        let registry = DeviceRegistry::new();
        registry.state.update_device(announcement(1, 11));
        registry.state.expire(Instant::now());
        assert_eq!(registry.current_devices().len(), 1);
    }

    #[test]
    fn test_ignored_address_filters_datagrams() {
        let registry = DeviceRegistry::new();
        let ours = IpAddr::from([192, 168, 1, 99]);
        registry.add_ignored_address(ours);

        let pkt = proto::AnnouncementPacket {
            name: "vlink".to_string(),
            device_number: 5,
            mac_addr: [0; 6],
            ip_addr: [192, 168, 1, 99],
        };
        registry
            .state
            .handle_datagram(&pkt.to_bytes(), SocketAddr::new(ours, 50000));
        assert!(registry.current_devices().is_empty());

        registry.remove_ignored_address(ours);
        registry
            .state
            .handle_datagram(&pkt.to_bytes(), SocketAddr::new(ours, 50000));
        assert_eq!(registry.current_devices().len(), 1);
    }
}
