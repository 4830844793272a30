use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::{net::UdpSocket, sync::watch};

use crate::listener::{
    self, BeatListener, FaderStartListener, LifecycleListener, Listeners, MasterHandoffListener,
    OnAirListener, SyncCommandListener,
};
use crate::proto::{self, Packet, SyncCommand};
use crate::Result;

/// Watches the beat port for beat packets and the control commands that
/// share it (sync mode, fader start, channels on air, master handoff) and
/// fans them out to the registered listeners.
pub struct BeatFinder {
    state: Arc<FinderState>,
}

pub(crate) struct FinderState {
    running: Mutex<Option<watch::Sender<bool>>>,
    beat_listeners: Listeners<dyn BeatListener>,
    sync_listeners: Listeners<dyn SyncCommandListener>,
    fader_listeners: Listeners<dyn FaderStartListener>,
    on_air_listeners: Listeners<dyn OnAirListener>,
    handoff_listeners: Listeners<dyn MasterHandoffListener>,
    lifecycle_listeners: Listeners<dyn LifecycleListener>,
}

impl BeatFinder {
    pub fn new() -> BeatFinder {
        BeatFinder {
            state: Arc::new(FinderState {
                running: Mutex::new(None),
                beat_listeners: Listeners::new(),
                sync_listeners: Listeners::new(),
                fader_listeners: Listeners::new(),
                on_air_listeners: Listeners::new(),
                handoff_listeners: Listeners::new(),
                lifecycle_listeners: Listeners::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.lock().unwrap().is_some()
    }

    /// Open the beat port and begin dispatching. Does nothing if already
    /// running.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let socket = UdpSocket::bind(("0.0.0.0", proto::BEAT_PORT)).await?;

        let (running_tx, running_rx) = watch::channel(true);
        {
            let mut running = self.state.running.lock().unwrap();
            if running.is_some() {
                return Ok(());
            }
            *running = Some(running_tx);
        }

        let state = self.state.clone();
        tokio::spawn(async move {
            state.run(socket, running_rx).await;
        });

        info!(target: "vlink", "beat finder started");
        for l in self.state.lifecycle_listeners.snapshot() {
            listener::guard("lifecycle started", || l.started());
        }
        Ok(())
    }

    /// Close the beat port. Idempotent.
    pub fn stop(&self) {
        let running = self.state.running.lock().unwrap().take();
        if let Some(running) = running {
            let _ = running.send(false);
            info!(target: "vlink", "beat finder stopped");
            for l in self.state.lifecycle_listeners.snapshot() {
                listener::guard("lifecycle stopped", || l.stopped());
            }
        }
    }

    pub fn add_beat_listener(&self, listener: Arc<dyn BeatListener>) {
        self.state.beat_listeners.add(listener);
    }

    pub fn remove_beat_listener(&self, listener: &Arc<dyn BeatListener>) {
        self.state.beat_listeners.remove(listener);
    }

    pub fn add_sync_listener(&self, listener: Arc<dyn SyncCommandListener>) {
        self.state.sync_listeners.add(listener);
    }

    pub fn remove_sync_listener(&self, listener: &Arc<dyn SyncCommandListener>) {
        self.state.sync_listeners.remove(listener);
    }

    pub fn add_fader_start_listener(&self, listener: Arc<dyn FaderStartListener>) {
        self.state.fader_listeners.add(listener);
    }

    pub fn remove_fader_start_listener(&self, listener: &Arc<dyn FaderStartListener>) {
        self.state.fader_listeners.remove(listener);
    }

    pub fn add_on_air_listener(&self, listener: Arc<dyn OnAirListener>) {
        self.state.on_air_listeners.add(listener);
    }

    pub fn remove_on_air_listener(&self, listener: &Arc<dyn OnAirListener>) {
        self.state.on_air_listeners.remove(listener);
    }

    pub fn add_master_handoff_listener(&self, listener: Arc<dyn MasterHandoffListener>) {
        self.state.handoff_listeners.add(listener);
    }

    pub fn remove_master_handoff_listener(&self, listener: &Arc<dyn MasterHandoffListener>) {
        self.state.handoff_listeners.remove(listener);
    }

    pub fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.state.lifecycle_listeners.add(listener);
    }

    pub fn remove_lifecycle_listener(&self, listener: &Arc<dyn LifecycleListener>) {
        self.state.lifecycle_listeners.remove(listener);
    }
}

impl Default for BeatFinder {
    fn default() -> Self {
        BeatFinder::new()
    }
}

impl FinderState {
    async fn run(self: Arc<Self>, socket: UdpSocket, mut running: watch::Receiver<bool>) {
        let mut buf = [0u8; 512];
        loop {
            tokio::select! {
                _ = running.changed() => {
                    if !*running.borrow() {
                        return;
                    }
                }
                res = socket.recv_from(&mut buf) => {
                    match res {
                        Ok((len, src)) => self.dispatch(&buf[..len], src),
                        Err(e) => {
                            warn!(target: "vlink", "beat socket failed, beat finder stopping: {}", e);
                            self.fail_from_task();
                            return;
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn dispatch(&self, data: &[u8], src: SocketAddr) {
        match Packet::parse(data, proto::BEAT_PORT) {
            Ok(Packet::Beat(beat)) => {
                for l in self.beat_listeners.snapshot() {
                    listener::guard("beat", || l.new_beat(&beat, src.ip()));
                }
            }
            Ok(Packet::SyncControl(control)) => match control.command() {
                Some(SyncCommand::SyncOn) => {
                    for l in self.sync_listeners.snapshot() {
                        listener::guard("sync mode", || l.sync_mode(true));
                    }
                }
                Some(SyncCommand::SyncOff) => {
                    for l in self.sync_listeners.snapshot() {
                        listener::guard("sync mode", || l.sync_mode(false));
                    }
                }
                Some(SyncCommand::BecomeMaster) => {
                    for l in self.sync_listeners.snapshot() {
                        listener::guard("become master", || l.become_master());
                    }
                }
                None => warn!(
                    target: "vlink",
                    "ignoring sync control packet with unknown command {:#04x}",
                    control.command
                ),
            },
            Ok(Packet::FaderStart(fader)) => {
                let start = fader.start_set();
                let stop = fader.stop_set();
                for l in self.fader_listeners.snapshot() {
                    listener::guard("fader start", || l.faders_changed(&start, &stop));
                }
            }
            Ok(Packet::ChannelsOnAir(channels)) => {
                let audible = channels.on_air_set();
                for l in self.on_air_listeners.snapshot() {
                    listener::guard("channels on air", || l.channels_on_air(&audible));
                }
            }
            Ok(Packet::MasterHandoffRequest(request)) => {
                for l in self.handoff_listeners.snapshot() {
                    listener::guard("master handoff request", || {
                        l.yield_master_to(request.device_number)
                    });
                }
            }
            Ok(Packet::MasterHandoffResponse(response)) => {
                for l in self.handoff_listeners.snapshot() {
                    listener::guard("master handoff response", || {
                        l.yield_response(response.device_number, response.yielded)
                    });
                }
            }
            Ok(other) => debug!(target: "vlink", "ignoring {:?} on beat port", other),
            Err(e) => debug!(target: "vlink", "can't parse beat-port packet: {}", e),
        }
    }

    fn fail_from_task(&self) {
        let running = self.running.lock().unwrap().take();
        if running.is_some() {
            for l in self.lifecycle_listeners.snapshot() {
                listener::guard("lifecycle stopped", || l.stopped());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{assemble, beat_payload, fader_start_payload, BeatFields, PacketType};
    use std::collections::HashSet;
    use std::net::IpAddr;

    struct Recorder {
        beats: Mutex<Vec<(u8, IpAddr)>>,
        faders: Mutex<Vec<(HashSet<u8>, HashSet<u8>)>>,
        sync_modes: Mutex<Vec<bool>>,
    }

    impl Recorder {
        fn new() -> Arc<Recorder> {
            Arc::new(Recorder {
                beats: Mutex::new(Vec::new()),
                faders: Mutex::new(Vec::new()),
                sync_modes: Mutex::new(Vec::new()),
            })
        }
    }

    impl BeatListener for Recorder {
        fn new_beat(&self, beat: &proto::BeatPacket, source: IpAddr) {
            self.beats.lock().unwrap().push((beat.device_number, source));
        }
    }

    impl FaderStartListener for Recorder {
        fn faders_changed(&self, start: &HashSet<u8>, stop: &HashSet<u8>) {
            self.faders.lock().unwrap().push((start.clone(), stop.clone()));
        }
    }

    impl SyncCommandListener for Recorder {
        fn sync_mode(&self, synced: bool) {
            self.sync_modes.lock().unwrap().push(synced);
        }

        fn become_master(&self) {}
    }

    fn source() -> SocketAddr {
        SocketAddr::new(IpAddr::from([192, 168, 1, 7]), proto::BEAT_PORT)
    }

    #[test]
    fn test_dispatches_beats_with_source() {
        let finder = BeatFinder::new();
        let recorder = Recorder::new();
        finder.add_beat_listener(recorder.clone());

        let data = assemble(
            PacketType::Beat,
            "CDJ-2000",
            &beat_payload(&BeatFields {
                device_number: 2,
                beat_interval: 500,
                bar_interval: 2000,
                beats_per_bar: 4,
                beat_within_bar: 1,
                tempo: 120.0,
            }),
        );
        finder.state.dispatch(&data, source());

        assert_eq!(
            *recorder.beats.lock().unwrap(),
            vec![(2, IpAddr::from([192, 168, 1, 7]))]
        );
    }

    #[test]
    fn test_dispatches_fader_start_sets() {
        let finder = BeatFinder::new();
        let recorder = Recorder::new();
        finder.add_fader_start_listener(recorder.clone());

        let start: HashSet<u8> = [1].into_iter().collect();
        let stop: HashSet<u8> = [2].into_iter().collect();
        let data = assemble(
            PacketType::FaderStart,
            "DJM-900",
            &fader_start_payload(33, &start, &stop),
        );
        finder.state.dispatch(&data, source());

        assert_eq!(*recorder.faders.lock().unwrap(), vec![(start, stop)]);
    }

    #[test]
    fn test_dispatches_sync_mode() {
        let finder = BeatFinder::new();
        let recorder = Recorder::new();
        finder.add_sync_listener(recorder.clone());

        let on = assemble(
            PacketType::SyncControl,
            "CDJ-2000",
            &proto::sync_control_payload(3, SyncCommand::SyncOn),
        );
        let off = assemble(
            PacketType::SyncControl,
            "CDJ-2000",
            &proto::sync_control_payload(3, SyncCommand::SyncOff),
        );
        finder.state.dispatch(&on, source());
        finder.state.dispatch(&off, source());

        assert_eq!(*recorder.sync_modes.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_garbage_is_swallowed() {
        let finder = BeatFinder::new();
        finder.state.dispatch(&[0u8; 40], source());
        finder.state.dispatch(&[], source());
    }
}
