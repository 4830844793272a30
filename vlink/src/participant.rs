use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use anyhow::anyhow;
use log::{debug, error, info, warn};
use mac_address::mac_address_by_name;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig, V4IfAddr};
use tokio::{
    net::UdpSocket,
    sync::watch,
    time::{self, Instant},
};

use crate::beat_finder::BeatFinder;
use crate::listener::{
    self, BeatListener, DeviceUpdateListener, FaderStartListener, LifecycleListener, Listeners,
    MasterHandoffListener, MasterListener, MediaDetailsListener, OnAirListener,
    SyncCommandListener,
};
use crate::metronome::{now_ns, Metronome, Snapshot};
use crate::proto::{self, BeatPacket, PacketType, StatusFields, SyncCommand, TrackSourceSlot, TrackType};
use crate::registry::{DeviceAnnouncement, DeviceRegistry, MAX_AGE};
use crate::tasks::announce::AnnounceTask;
use crate::tasks::beat::{BeatSender, BEAT_THRESHOLD_MS, SLEEP_THRESHOLD_MS};
use crate::tasks::ingest::IngestTask;
use crate::tasks::status::StatusTask;
use crate::{Config, DeviceStatus, DeviceUpdate, Result, VlinkError};

/// How long the registry must have been watching the network before we
/// trust self-assignment not to collide, in milliseconds.
const SELF_ASSIGNMENT_WATCH_MS: i64 = 4000;

/// The largest beat number we will report; playback wraps back to one past
/// this, a little over nine hours at 120 BPM.
pub const MAX_BEAT: i64 = 65536;

/// Poses as a CDJ on the network: announces itself, ingests everyone
/// else's status, can synthesize its own status and beats, and can take
/// part in the tempo-master handoff protocol.
pub struct Participant {
    state: Arc<State>,
}

/// The network interface we picked to talk to the players.
#[derive(Clone, Debug)]
struct MatchedInterface {
    address: Ipv4Addr,
    broadcast: Ipv4Addr,
    prefix_len: u8,
    mac: [u8; 6],
    names: Vec<String>,
}

pub(crate) struct State {
    registry: Arc<DeviceRegistry>,
    beat_finder: Arc<BeatFinder>,

    /// The announcement packet we broadcast, with our name and device
    /// number patched in; MAC and IP are patched at start.
    announcement: Mutex<[u8; 54]>,
    use_standard_player_number: AtomicBool,
    announce_interval: AtomicU32,
    status_interval: AtomicU32,
    tempo_epsilon_bits: AtomicU64,

    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_address: Mutex<Option<SocketAddr>>,
    broadcast_address: Mutex<Option<Ipv4Addr>>,
    matched: Mutex<Option<MatchedInterface>>,
    running_tx: Mutex<Option<watch::Sender<bool>>>,
    updates: Mutex<HashMap<IpAddr, DeviceUpdate>>,

    tempo_master: Mutex<Option<DeviceUpdate>>,
    master_tempo_bits: AtomicU64,
    master: AtomicBool,
    /// Device we are handing the master role to; 0xff when not handing off.
    next_master: AtomicU8,
    /// Device that has agreed to yield the master role to us; 0 when none.
    master_yielded_from: AtomicU8,
    /// Device we have asked to yield the master role; 0 when none.
    requesting_master_from: AtomicU8,
    sync_counter: AtomicU32,
    largest_sync_counter: AtomicU32,
    packet_counter: AtomicU32,

    metronome: Metronome,
    where_stopped: Mutex<Snapshot>,
    playing: AtomicBool,
    synced: AtomicBool,
    on_air: AtomicBool,
    sending_status: Mutex<Option<watch::Sender<bool>>>,
    beat_sender: Mutex<Option<BeatSender>>,

    update_listeners: Listeners<dyn DeviceUpdateListener>,
    master_listeners: Listeners<dyn MasterListener>,
    media_listeners: Listeners<dyn MediaDetailsListener>,
    lifecycle_listeners: Listeners<dyn LifecycleListener>,

    me: OnceLock<Weak<State>>,
    sync_follower: OnceLock<Arc<dyn MasterListener>>,
    finder_lifecycle: OnceLock<Arc<dyn LifecycleListener>>,
}

/// Check whether two addresses fall in the same subnet for a prefix length.
fn same_network(prefix_len: u8, a: Ipv4Addr, b: Ipv4Addr) -> bool {
    let mask: u32 = match prefix_len {
        0 => 0,
        len => (!0u32).checked_shl(32 - len as u32).unwrap_or(!0),
    };
    (u32::from(a) & mask) == (u32::from(b) & mask)
}

fn ipv4_iface(iface: &NetworkInterface) -> Option<(String, V4IfAddr)> {
    if let Some(addr) = iface.addr {
        match addr {
            Addr::V4(a) => Some((iface.name.clone(), a)),
            _ => None,
        }
    } else {
        None
    }
}

/// Find the local interface(s) whose network contains the given device.
/// More than one match is trouble (we will see duplicate packets), so
/// every extra match is loudly reported.
fn find_matching_interface(device_ip: Ipv4Addr) -> Result<MatchedInterface> {
    let all_interfaces =
        NetworkInterface::show().map_err(|e| anyhow!("can't get network interfaces: {}", e))?;

    let mut matches: Vec<(String, V4IfAddr, u8)> = Vec::new();
    for (name, addr) in all_interfaces.iter().filter_map(ipv4_iface) {
        if let Some(netmask) = addr.netmask {
            let prefix_len = u32::from(netmask).count_ones() as u8;
            if same_network(prefix_len, addr.ip, device_ip) {
                matches.push((name, addr, prefix_len));
            }
        }
    }

    let (name, addr, prefix_len) = match matches.first() {
        Some(first) => first.clone(),
        None => {
            return Err(anyhow!(
                "unable to find a network interface on the same network as {}",
                device_ip
            )
            .into())
        }
    };
    for (extra, _, _) in &matches[1..] {
        warn!(
            target: "vlink",
            "network interface {} sees the same network as {}: duplicate packets will likely corrupt state tracking",
            extra, name
        );
    }

    let broadcast = addr
        .broadcast
        .ok_or_else(|| anyhow!("can't get broadcast address for interface {}", name))?;
    let mac = mac_address_by_name(&name)
        .map_err(|e| anyhow!("failed to look up mac address: {}", e))?
        .ok_or_else(|| anyhow!("no mac address for interface {}", name))?;

    Ok(MatchedInterface {
        address: addr.ip,
        broadcast,
        prefix_len,
        mac: mac.bytes(),
        names: matches.into_iter().map(|(n, _, _)| n).collect(),
    })
}

fn now_ms() -> i64 {
    now_ns() / 1_000_000
}

pub(crate) fn wrap_beat(beat: i64) -> i64 {
    if beat <= MAX_BEAT {
        return beat;
    }
    // Beats are one-based, so shift down before wrapping.
    ((beat - 1) % MAX_BEAT) + 1
}

/// Pick the lowest device number not in use. Numbers 1 to 4 are only
/// considered when the caller wants a standard player number.
fn choose_device_number(used: &HashSet<u8>, use_standard: bool) -> Result<u8> {
    let low = if use_standard { 1 } else { 5 };
    (low..16)
        .find(|n| !used.contains(n))
        .ok_or(VlinkError::NoAvailableNumber { low })
}

impl Participant {
    /// Create a participant with its own registry and beat finder.
    pub fn new(config: Config) -> Result<Participant> {
        Participant::with_collaborators(
            config,
            Arc::new(DeviceRegistry::new()),
            Arc::new(BeatFinder::new()),
        )
    }

    /// Create a participant around existing collaborators, so several
    /// components (or tests) can share one registry and beat finder.
    pub fn with_collaborators(
        config: Config,
        registry: Arc<DeviceRegistry>,
        beat_finder: Arc<BeatFinder>,
    ) -> Result<Participant> {
        if config.tempo <= 0.0 {
            return Err(VlinkError::InvalidArgument {
                name: "tempo",
                reason: "must be positive".to_string(),
            });
        }
        let metronome = Metronome::new();
        metronome.set_tempo(config.tempo);
        let where_stopped = metronome.snapshot_at(metronome.start_time());

        let state = Arc::new(State {
            registry: registry.clone(),
            beat_finder: beat_finder.clone(),
            announcement: Mutex::new(proto::ANNOUNCEMENT_TEMPLATE),
            use_standard_player_number: AtomicBool::new(config.use_standard_player_number),
            announce_interval: AtomicU32::new(1500),
            status_interval: AtomicU32::new(200),
            tempo_epsilon_bits: AtomicU64::new(config.tempo_epsilon.to_bits()),
            socket: Mutex::new(None),
            local_address: Mutex::new(None),
            broadcast_address: Mutex::new(None),
            matched: Mutex::new(None),
            running_tx: Mutex::new(None),
            updates: Mutex::new(HashMap::new()),
            tempo_master: Mutex::new(None),
            master_tempo_bits: AtomicU64::new(0.0f64.to_bits()),
            master: AtomicBool::new(false),
            next_master: AtomicU8::new(0xff),
            master_yielded_from: AtomicU8::new(0),
            requesting_master_from: AtomicU8::new(0),
            sync_counter: AtomicU32::new(1),
            largest_sync_counter: AtomicU32::new(1),
            packet_counter: AtomicU32::new(0),
            metronome,
            where_stopped: Mutex::new(where_stopped),
            playing: AtomicBool::new(config.playing),
            synced: AtomicBool::new(config.synced),
            on_air: AtomicBool::new(config.on_air),
            sending_status: Mutex::new(None),
            beat_sender: Mutex::new(None),
            update_listeners: Listeners::new(),
            master_listeners: Listeners::new(),
            media_listeners: Listeners::new(),
            lifecycle_listeners: Listeners::new(),
            me: OnceLock::new(),
            sync_follower: OnceLock::new(),
            finder_lifecycle: OnceLock::new(),
        });
        let _ = state.me.set(Arc::downgrade(&state));

        state.set_device_name(&config.name)?;
        state.announcement.lock().unwrap()[proto::DEVICE_NUMBER_OFFSET] = config.device_number;
        state.set_announce_interval(config.announce_interval)?;
        state.set_status_interval(config.status_interval)?;

        let _ = state
            .sync_follower
            .set(Arc::new(SyncFollower {
                state: Arc::downgrade(&state),
            }) as Arc<dyn MasterListener>);
        let _ = state
            .finder_lifecycle
            .set(Arc::new(FinderLifecycleBridge {
                state: Arc::downgrade(&state),
            }) as Arc<dyn LifecycleListener>);

        // Keep our flags and playback in step with what the mixer and the
        // other players tell us.
        let bridge = Arc::new(FinderBridge {
            state: Arc::downgrade(&state),
        });
        beat_finder.add_on_air_listener(bridge.clone());
        beat_finder.add_fader_start_listener(bridge.clone());
        beat_finder.add_sync_listener(bridge.clone());
        beat_finder.add_master_handoff_listener(bridge.clone());
        beat_finder.add_beat_listener(bridge);

        // We can't function without the registry.
        registry.add_lifecycle_listener(Arc::new(RegistryBridge {
            state: Arc::downgrade(&state),
        }));

        Ok(Participant { state })
    }

    /// Join the network: wait for real devices, pick the interface and our
    /// device number, open the update port, and start announcing.
    pub async fn start(&self) -> Result<()> {
        self.state.start().await
    }

    /// Leave the network. Idempotent; the device number resets to zero so
    /// a later start self-assigns again.
    pub async fn stop(&self) {
        self.state.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.state.registry
    }

    pub fn beat_finder(&self) -> &Arc<BeatFinder> {
        &self.state.beat_finder
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        *self.state.local_address.lock().unwrap()
    }

    pub fn broadcast_address(&self) -> Option<Ipv4Addr> {
        self.state.broadcast_address()
    }

    /// Names of every interface that matched the player network. More
    /// than one entry means duplicate packets are likely.
    pub fn matching_interfaces(&self) -> Vec<String> {
        self.state
            .matched
            .lock()
            .unwrap()
            .as_ref()
            .map(|m| m.names.clone())
            .unwrap_or_default()
    }

    pub fn device_number(&self) -> u8 {
        self.state.device_number()
    }

    /// Set the device number to claim. Zero re-enables self-assignment at
    /// the next start. Refused while we are sending status packets.
    pub fn set_device_number(&self, number: u8) -> Result<()> {
        self.state.set_device_number(number)
    }

    pub fn device_name(&self) -> String {
        self.state.device_name()
    }

    pub fn set_device_name(&self, name: &str) -> Result<()> {
        self.state.set_device_name(name)
    }

    pub fn use_standard_player_number(&self) -> bool {
        self.state.use_standard_player_number.load(Ordering::SeqCst)
    }

    pub fn set_use_standard_player_number(&self, attempt: bool) {
        self.state
            .use_standard_player_number
            .store(attempt, Ordering::SeqCst);
    }

    pub fn announce_interval(&self) -> u32 {
        self.state.announce_interval()
    }

    pub fn set_announce_interval(&self, interval: u32) -> Result<()> {
        self.state.set_announce_interval(interval)
    }

    pub fn status_interval(&self) -> u32 {
        self.state.status_interval()
    }

    pub fn set_status_interval(&self, interval: u32) -> Result<()> {
        self.state.set_status_interval(interval)
    }

    pub fn tempo_epsilon(&self) -> f64 {
        self.state.tempo_epsilon()
    }

    pub fn set_tempo_epsilon(&self, epsilon: f64) {
        self.state
            .tempo_epsilon_bits
            .store(epsilon.to_bits(), Ordering::SeqCst);
    }

    /// The most recent update from every device still fresh enough to be
    /// considered active.
    pub fn latest_status(&self) -> Vec<DeviceUpdate> {
        self.state
            .updates
            .lock()
            .unwrap()
            .values()
            .filter(|u| u.received.elapsed() <= MAX_AGE)
            .cloned()
            .collect()
    }

    pub fn latest_status_for(&self, device_number: u8) -> Option<DeviceUpdate> {
        self.state.latest_status_for(device_number)
    }

    /// The update in which the current tempo master asserted its role, or
    /// `None` when there is no master (including while we hold the role).
    pub fn tempo_master(&self) -> Option<DeviceUpdate> {
        self.state.tempo_master.lock().unwrap().clone()
    }

    pub fn master_tempo(&self) -> f64 {
        self.state.master_tempo()
    }

    pub fn is_tempo_master(&self) -> bool {
        self.state.is_tempo_master()
    }

    /// Arrange to become tempo master, asking the current master to yield
    /// if there is one.
    pub async fn become_tempo_master(&self) -> Result<()> {
        self.state.become_tempo_master().await
    }

    /// Turn the synthesized status stream (and with it the ability to act
    /// as tempo master) on or off.
    pub async fn set_sending_status(&self, send: bool) -> Result<()> {
        self.state.set_sending_status(send).await
    }

    pub fn is_sending_status(&self) -> bool {
        self.state.is_sending_status()
    }

    pub fn set_playing(&self, playing: bool) {
        self.state.set_playing(playing)
    }

    pub fn is_playing(&self) -> bool {
        self.state.playing.load(Ordering::SeqCst)
    }

    /// The simulated playback position: live while playing, otherwise
    /// where we stopped.
    pub fn playback_position(&self) -> Snapshot {
        self.state.playback_position()
    }

    pub fn jump_to_beat(&self, beat: i64) {
        self.state.jump_to_beat(beat)
    }

    /// Nudge playback by `ms` (positive moves forward). If the shift would
    /// land before beat one, a bar is added to keep the beat valid, so
    /// jumps further back than a bar are not safe.
    pub fn adjust_playback_position(&self, ms: i64) {
        self.state.adjust_playback_position(ms)
    }

    pub fn set_synced(&self, sync: bool) {
        self.state.set_synced(sync)
    }

    pub fn is_synced(&self) -> bool {
        self.state.is_synced()
    }

    pub fn set_on_air(&self, audible: bool) {
        self.state.on_air.store(audible, Ordering::SeqCst);
    }

    pub fn is_on_air(&self) -> bool {
        self.state.on_air.load(Ordering::SeqCst)
    }

    pub fn tempo(&self) -> f64 {
        self.state.tempo()
    }

    /// Set the tempo we report. Rejected when zero or negative.
    pub fn set_tempo(&self, bpm: f64) -> Result<()> {
        self.state.set_tempo(bpm)
    }

    /// Send a beat packet for the current playback position, returning the
    /// beat number announced. The beat sender calls this on the beat; it
    /// is public for experimentation.
    pub async fn send_beat(&self) -> Result<i64> {
        let socket = self.state.ensure_running()?;
        Ok(self
            .state
            .send_beat(self.state.playback_position(), &socket)
            .await)
    }

    /// Ask a player for details about the media in one of its slots; the
    /// answer arrives through the media-details listeners.
    pub async fn send_media_query(&self, player: u8, slot: TrackSourceSlot) -> Result<()> {
        let socket = self.state.ensure_running()?;
        let announcement = self
            .state
            .registry
            .latest_announcement_from(player)
            .ok_or(VlinkError::UnknownPeer(player))?;
        let our_ip = {
            let template = self.state.announcement.lock().unwrap();
            [
                template[proto::IP_OFFSET],
                template[proto::IP_OFFSET + 1],
                template[proto::IP_OFFSET + 2],
                template[proto::IP_OFFSET + 3],
            ]
        };
        let payload =
            proto::media_query_payload(self.state.device_number(), our_ip, player, slot);
        self.state
            .send_packet(
                &socket,
                PacketType::MediaQuery,
                &payload,
                SocketAddr::new(announcement.address, proto::UPDATE_PORT),
            )
            .await
    }

    /// Tell a device to turn sync mode on or off.
    pub async fn send_sync_mode_command(&self, device_number: u8, synced: bool) -> Result<()> {
        let command = if synced {
            SyncCommand::SyncOn
        } else {
            SyncCommand::SyncOff
        };
        self.state.send_sync_control(device_number, command).await
    }

    /// Tell a device to take over as tempo master.
    pub async fn appoint_tempo_master(&self, device_number: u8) -> Result<()> {
        self.state
            .send_sync_control(device_number, SyncCommand::BecomeMaster)
            .await
    }

    /// Broadcast fader start: players in `start` begin playing, players in
    /// `stop` stop; stop wins for players in both. Numbers outside 1 to 4
    /// are ignored.
    pub async fn send_fader_start_command(
        &self,
        start: &HashSet<u8>,
        stop: &HashSet<u8>,
    ) -> Result<()> {
        let socket = self.state.ensure_running()?;
        let payload = proto::fader_start_payload(self.state.device_number(), start, stop);
        let dest = self.state.broadcast_destination()?;
        self.state
            .send_packet(&socket, PacketType::FaderStart, &payload, dest)
            .await
    }

    /// Broadcast which channels are on the air. A real mixer on the
    /// network will rapidly override whatever this reports.
    pub async fn send_on_air_command(&self, audible: &HashSet<u8>) -> Result<()> {
        let socket = self.state.ensure_running()?;
        let payload = proto::channels_on_air_payload(self.state.device_number(), audible);
        let dest = self.state.broadcast_destination()?;
        self.state
            .send_packet(&socket, PacketType::ChannelsOnAir, &payload, dest)
            .await
    }

    /// Tell a player to load a track from another player's media slot.
    pub async fn send_load_track_command(
        &self,
        target_player: u8,
        rekordbox_id: u32,
        source_player: u8,
        source_slot: TrackSourceSlot,
        source_type: TrackType,
    ) -> Result<()> {
        let socket = self.state.ensure_running()?;
        let target = self
            .state
            .latest_status_for(target_player)
            .ok_or(VlinkError::UnknownPeer(target_player))?;
        let payload = proto::load_track_payload(
            self.state.device_number(),
            rekordbox_id,
            source_player,
            source_slot,
            source_type,
        );
        self.state
            .send_packet(
                &socket,
                PacketType::LoadTrack,
                &payload,
                SocketAddr::new(target.address, proto::UPDATE_PORT),
            )
            .await
    }

    /// Devices on networks we cannot reach from the matched interface.
    /// Anything listed here should be moved onto our network.
    pub fn find_unreachable_players(&self) -> Result<Vec<DeviceAnnouncement>> {
        let matched = self
            .state
            .matched
            .lock()
            .unwrap()
            .clone()
            .ok_or(VlinkError::NotRunning)?;
        Ok(self
            .state
            .registry
            .current_devices()
            .into_iter()
            .filter(|device| match device.address {
                IpAddr::V4(ip) => !same_network(matched.prefix_len, matched.address, ip),
                _ => true,
            })
            .collect())
    }

    pub fn add_update_listener(&self, listener: Arc<dyn DeviceUpdateListener>) {
        self.state.update_listeners.add(listener);
    }

    pub fn remove_update_listener(&self, listener: &Arc<dyn DeviceUpdateListener>) {
        self.state.update_listeners.remove(listener);
    }

    pub fn add_master_listener(&self, listener: Arc<dyn MasterListener>) {
        self.state.master_listeners.add(listener);
    }

    pub fn remove_master_listener(&self, listener: &Arc<dyn MasterListener>) {
        self.state.master_listeners.remove(listener);
    }

    pub fn add_media_details_listener(&self, listener: Arc<dyn MediaDetailsListener>) {
        self.state.media_listeners.add(listener);
    }

    pub fn remove_media_details_listener(&self, listener: &Arc<dyn MediaDetailsListener>) {
        self.state.media_listeners.remove(listener);
    }

    pub fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.state.lifecycle_listeners.add(listener);
    }

    pub fn remove_lifecycle_listener(&self, listener: &Arc<dyn LifecycleListener>) {
        self.state.lifecycle_listeners.remove(listener);
    }
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Participant");
        s.field("device_number", &self.device_number())
            .field("name", &self.device_name())
            .field("running", &self.is_running());
        if self.is_running() {
            s.field("local_address", &self.local_address())
                .field("broadcast_address", &self.broadcast_address())
                .field("tempo_master", &self.tempo_master().map(|m| m.device_number()))
                .field("master_tempo", &self.master_tempo())
                .field("sending_status", &self.is_sending_status())
                .field("is_tempo_master", &self.is_tempo_master())
                .field("playing", &self.is_playing())
                .field("synced", &self.is_synced())
                .field("on_air", &self.is_on_air())
                .field("tempo", &self.tempo());
        }
        s.finish()
    }
}

impl State {
    fn arc(&self) -> Option<Arc<State>> {
        self.me.get().and_then(Weak::upgrade)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.socket.lock().unwrap().is_some()
    }

    fn ensure_running(&self) -> Result<Arc<UdpSocket>> {
        self.socket
            .lock()
            .unwrap()
            .clone()
            .ok_or(VlinkError::NotRunning)
    }

    pub(crate) fn local_ip(&self) -> Option<IpAddr> {
        self.local_address.lock().unwrap().map(|a| a.ip())
    }

    pub(crate) fn broadcast_address(&self) -> Option<Ipv4Addr> {
        *self.broadcast_address.lock().unwrap()
    }

    fn broadcast_destination(&self) -> Result<SocketAddr> {
        self.broadcast_address()
            .map(|b| SocketAddr::new(IpAddr::V4(b), proto::BEAT_PORT))
            .ok_or(VlinkError::NotRunning)
    }

    pub(crate) fn announcement_bytes(&self) -> [u8; 54] {
        *self.announcement.lock().unwrap()
    }

    pub(crate) fn device_number(&self) -> u8 {
        self.announcement.lock().unwrap()[proto::DEVICE_NUMBER_OFFSET]
    }

    fn set_device_number(&self, number: u8) -> Result<()> {
        if self.is_sending_status() {
            return Err(VlinkError::BusySendingStatus);
        }
        self.announcement.lock().unwrap()[proto::DEVICE_NUMBER_OFFSET] = number;
        Ok(())
    }

    pub(crate) fn device_name(&self) -> String {
        let template = self.announcement.lock().unwrap();
        let raw = &template[proto::DEVICE_NAME_OFFSET..proto::DEVICE_NAME_OFFSET + proto::DEVICE_NAME_LENGTH];
        String::from_utf8_lossy(raw).trim_end_matches('\0').to_string()
    }

    fn set_device_name(&self, name: &str) -> Result<()> {
        if name.len() > proto::DEVICE_NAME_LENGTH {
            return Err(VlinkError::InvalidArgument {
                name: "device name",
                reason: format!("cannot be longer than {} bytes", proto::DEVICE_NAME_LENGTH),
            });
        }
        let mut template = self.announcement.lock().unwrap();
        let block = &mut template
            [proto::DEVICE_NAME_OFFSET..proto::DEVICE_NAME_OFFSET + proto::DEVICE_NAME_LENGTH];
        block.fill(0);
        block[..name.len()].copy_from_slice(name.as_bytes());
        Ok(())
    }

    pub(crate) fn announce_interval(&self) -> u32 {
        self.announce_interval.load(Ordering::SeqCst)
    }

    fn set_announce_interval(&self, interval: u32) -> Result<()> {
        if !(200..=2000).contains(&interval) {
            return Err(VlinkError::InvalidArgument {
                name: "announce interval",
                reason: "must be between 200 and 2000 ms".to_string(),
            });
        }
        self.announce_interval.store(interval, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn status_interval(&self) -> u32 {
        self.status_interval.load(Ordering::SeqCst)
    }

    fn set_status_interval(&self, interval: u32) -> Result<()> {
        if !(20..=2000).contains(&interval) {
            return Err(VlinkError::InvalidArgument {
                name: "status interval",
                reason: "must be between 20 and 2000 ms".to_string(),
            });
        }
        self.status_interval.store(interval, Ordering::SeqCst);
        Ok(())
    }

    fn tempo_epsilon(&self) -> f64 {
        f64::from_bits(self.tempo_epsilon_bits.load(Ordering::SeqCst))
    }

    pub(crate) fn tempo(&self) -> f64 {
        self.metronome.tempo()
    }

    pub(crate) fn is_tempo_master(&self) -> bool {
        self.master.load(Ordering::SeqCst)
    }

    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub(crate) fn is_sending_status(&self) -> bool {
        self.sending_status.lock().unwrap().is_some()
    }

    fn master_tempo(&self) -> f64 {
        f64::from_bits(self.master_tempo_bits.load(Ordering::SeqCst))
    }

    pub(crate) fn metronome_snapshot(&self) -> Snapshot {
        self.metronome.snapshot()
    }

    pub(crate) fn metronome_snapshot_at(&self, instant: i64) -> Snapshot {
        self.metronome.snapshot_at(instant)
    }

    pub(crate) fn metronome_time_of_beat(&self, beat: i64) -> i64 {
        self.metronome.time_of_beat(beat)
    }

    fn latest_status_for(&self, device_number: u8) -> Option<DeviceUpdate> {
        self.updates
            .lock()
            .unwrap()
            .values()
            .find(|u| u.device_number() == device_number)
            .cloned()
    }

    async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        self.registry.start().await?;

        // Give the registry up to ten seconds to hear from a real device;
        // without one we have no idea which network to join.
        let mut polls = 0;
        while self.registry.current_devices().is_empty() && polls < 20 {
            time::sleep(Duration::from_millis(500)).await;
            polls += 1;
        }
        let first_device = self
            .registry
            .current_devices()
            .into_iter()
            .next()
            .ok_or(VlinkError::NoPeers)?;

        let device_ip = match first_device.address {
            IpAddr::V4(ip) => ip,
            other => {
                return Err(anyhow!(
                    "device {} announced from non-IPv4 address {}",
                    first_device.number,
                    other
                )
                .into())
            }
        };
        let matched = find_matching_interface(device_ip)?;
        info!(
            target: "vlink",
            "using interface {} with address {} to reach the players",
            matched.names[0],
            matched.address
        );

        if self.device_number() == 0 {
            self.self_assign_device_number().await?;
        }

        {
            let mut template = self.announcement.lock().unwrap();
            template[proto::MAC_OFFSET..proto::MAC_OFFSET + 6].copy_from_slice(&matched.mac);
            template[proto::IP_OFFSET..proto::IP_OFFSET + 4]
                .copy_from_slice(&matched.address.octets());
        }

        let socket = UdpSocket::bind(SocketAddr::new(
            IpAddr::V4(matched.address),
            proto::UPDATE_PORT,
        ))
        .await?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);
        let local = socket.local_addr()?;

        self.registry.add_ignored_address(local.ip());

        let (running_tx, running_rx) = watch::channel(true);
        *self.socket.lock().unwrap() = Some(socket.clone());
        *self.local_address.lock().unwrap() = Some(local);
        *self.broadcast_address.lock().unwrap() = Some(matched.broadcast);
        *self.matched.lock().unwrap() = Some(matched);
        *self.running_tx.lock().unwrap() = Some(running_tx);

        if let Some(me) = self.arc() {
            tokio::spawn(
                IngestTask {
                    state: me.clone(),
                    socket: socket.clone(),
                    running: running_rx.clone(),
                }
                .run(),
            );
            tokio::spawn(
                AnnounceTask {
                    state: me,
                    socket,
                    running: running_rx,
                }
                .run(),
            );
        }

        info!(target: "vlink", "virtual player started as device {}", self.device_number());
        for l in self.lifecycle_listeners.snapshot() {
            listener::guard("lifecycle started", || l.started());
        }
        Ok(())
    }

    pub(crate) async fn stop(&self) {
        if !self.is_running() {
            return;
        }
        if let Err(e) = self.set_sending_status(false).await {
            error!(target: "vlink", "problem stopping status sending during shutdown: {}", e);
        }
        if let Some(local) = *self.local_address.lock().unwrap() {
            self.registry.remove_ignored_address(local.ip());
        }
        if let Some(tx) = self.running_tx.lock().unwrap().take() {
            let _ = tx.send(false);
        }
        *self.socket.lock().unwrap() = None;
        *self.local_address.lock().unwrap() = None;
        *self.broadcast_address.lock().unwrap() = None;
        *self.matched.lock().unwrap() = None;
        self.updates.lock().unwrap().clear();
        self.set_tempo_master(None);
        // Back to self-assignment if we are restarted.
        self.announcement.lock().unwrap()[proto::DEVICE_NUMBER_OFFSET] = 0;
        info!(target: "vlink", "virtual player stopped");
        for l in self.lifecycle_listeners.snapshot() {
            listener::guard("lifecycle stopped", || l.stopped());
        }
    }

    /// Wait out the watch period, then claim the lowest device number not
    /// seen on the network.
    async fn self_assign_device_number(&self) -> Result<()> {
        let first_seen = self.registry.first_device_time_ms();
        let watched = now_ms() - first_seen;
        if watched < SELF_ASSIGNMENT_WATCH_MS {
            time::sleep(Duration::from_millis((SELF_ASSIGNMENT_WATCH_MS - watched) as u64)).await;
        }

        let used: HashSet<u8> = self
            .registry
            .current_devices()
            .iter()
            .map(|d| d.number)
            .collect();
        let use_standard = self.use_standard_player_number.load(Ordering::SeqCst);
        let number = choose_device_number(&used, use_standard)?;
        if use_standard && number > 4 {
            warn!(
                target: "vlink",
                "unable to self-assign a standard player number, all are in use; using {}",
                number
            );
        }
        self.announcement.lock().unwrap()[proto::DEVICE_NUMBER_OFFSET] = number;
        Ok(())
    }

    pub(crate) async fn set_sending_status(&self, send: bool) -> Result<()> {
        if self.is_sending_status() == send {
            return Ok(());
        }

        if send {
            let socket = self.ensure_running()?;
            let number = self.device_number();
            if !(1..=4).contains(&number) {
                return Err(VlinkError::InvalidDeviceNumberForStatus(number));
            }

            self.beat_finder.start().await?;
            if let Some(l) = self.finder_lifecycle.get() {
                self.beat_finder.add_lifecycle_listener(l.clone());
            }

            let (tx, rx) = watch::channel(true);
            *self.sending_status.lock().unwrap() = Some(tx);
            if let Some(me) = self.arc() {
                tokio::spawn(
                    StatusTask {
                        state: me,
                        socket,
                        running: rx,
                    }
                    .run(),
                );
            }

            if self.is_synced() {
                if let Some(follower) = self.sync_follower.get() {
                    self.master_listeners.add(follower.clone());
                }
            }
            if self.playing.load(Ordering::SeqCst) {
                self.start_beat_sender();
            }
        } else {
            if let Some(l) = self.finder_lifecycle.get() {
                self.beat_finder.remove_lifecycle_listener(l);
            }
            if let Some(follower) = self.sync_follower.get() {
                self.master_listeners.remove(follower);
            }
            if let Some(tx) = self.sending_status.lock().unwrap().take() {
                let _ = tx.send(false);
            }
            self.stop_beat_sender();
        }
        Ok(())
    }

    fn start_beat_sender(&self) {
        let socket = match self.socket.lock().unwrap().clone() {
            Some(socket) => socket,
            None => return,
        };
        if let Some(me) = self.arc() {
            let mut sender = self.beat_sender.lock().unwrap();
            if sender.is_none() {
                *sender = Some(BeatSender::start(me, socket));
            }
        }
    }

    fn stop_beat_sender(&self) {
        if let Some(sender) = self.beat_sender.lock().unwrap().take() {
            sender.shut_down();
        }
    }

    fn notify_beat_sender_of_change(&self) {
        if let Some(sender) = self.beat_sender.lock().unwrap().as_ref() {
            sender.timeline_changed();
        }
    }

    pub(crate) fn set_playing(&self, playing: bool) {
        if self.playing.swap(playing, Ordering::SeqCst) == playing {
            return;
        }

        if playing {
            let beat = self.where_stopped.lock().unwrap().beat();
            self.metronome.jump_to_beat(beat);
            if self.is_sending_status() {
                self.start_beat_sender();
            }
        } else {
            self.stop_beat_sender();
            *self.where_stopped.lock().unwrap() = self.metronome.snapshot();
        }
    }

    pub(crate) fn playback_position(&self) -> Snapshot {
        if self.playing.load(Ordering::SeqCst) {
            self.metronome.snapshot()
        } else {
            *self.where_stopped.lock().unwrap()
        }
    }

    fn jump_to_beat(&self, beat: i64) {
        let beat = if beat < 1 { 1 } else { wrap_beat(beat) };
        if self.playing.load(Ordering::SeqCst) {
            self.metronome.jump_to_beat(beat);
            self.notify_beat_sender_of_change();
        } else {
            *self.where_stopped.lock().unwrap() =
                self.metronome.snapshot_at(self.metronome.time_of_beat(beat));
        }
    }

    fn adjust_playback_position(&self, ms: i64) {
        if ms == 0 {
            return;
        }
        self.metronome.adjust_start(-ms);
        if self.metronome.beat() < 1 {
            // Jumped back past beat one; pull the start a bar earlier so
            // the beat number stays valid.
            let bar =
                Metronome::beats_to_ms(self.metronome.beats_per_bar(), self.metronome.tempo());
            self.metronome.adjust_start(-(bar.round() as i64));
        }
        self.notify_beat_sender_of_change();
    }

    pub(crate) fn set_synced(&self, sync: bool) {
        if self.synced.load(Ordering::SeqCst) != sync {
            if sync && self.is_sending_status() {
                if let Some(follower) = self.sync_follower.get() {
                    self.master_listeners.add(follower.clone());
                }
            } else if let Some(follower) = self.sync_follower.get() {
                self.master_listeners.remove(follower);
            }

            // Fall in with the master's tempo as soon as we sync up.
            let master_tempo = self.master_tempo();
            if sync && !self.is_tempo_master() && self.has_tempo_master() && master_tempo > 0.0 {
                let _ = self.set_tempo(master_tempo);
            }
        }
        self.synced.store(sync, Ordering::SeqCst);
    }

    fn has_tempo_master(&self) -> bool {
        self.tempo_master.lock().unwrap().is_some()
    }

    pub(crate) fn set_tempo(&self, bpm: f64) -> Result<()> {
        if bpm <= 0.0 {
            return Err(VlinkError::InvalidArgument {
                name: "tempo",
                reason: "must be positive".to_string(),
            });
        }
        let old = self.metronome.tempo();
        self.metronome.set_tempo(bpm);
        self.notify_beat_sender_of_change();

        if self.is_tempo_master() && (bpm - old).abs() > self.tempo_epsilon() {
            self.deliver_tempo_changed(bpm);
        }
        Ok(())
    }

    /// Record a new master tempo, propagating it to listeners (and our own
    /// metronome when we are synced) if it is a real change and somebody
    /// is master.
    fn set_master_tempo(&self, new_tempo: f64) {
        let old = f64::from_bits(
            self.master_tempo_bits
                .swap(new_tempo.to_bits(), Ordering::SeqCst),
        );
        if self.has_tempo_master() && (new_tempo - old).abs() > self.tempo_epsilon() {
            if self.is_synced() {
                self.metronome.set_tempo(new_tempo);
                self.notify_beat_sender_of_change();
            }
            self.deliver_tempo_changed(new_tempo);
        }
    }

    /// Record who is master now, notifying listeners when that actually
    /// changed.
    fn set_tempo_master(&self, new_master: Option<DeviceUpdate>) {
        let old = {
            let mut master = self.tempo_master.lock().unwrap();
            std::mem::replace(&mut *master, new_master.clone())
        };
        let changed = match (&new_master, &old) {
            (Some(new), Some(old)) => new.address != old.address,
            (Some(_), None) | (None, Some(_)) => true,
            (None, None) => false,
        };
        if changed {
            self.deliver_master_changed(new_master.as_ref());
        }
    }

    /// The §4.4 election state machine. Runs only on the ingest task, so
    /// the election scalars have a single writer.
    pub(crate) fn process_update(&self, update: DeviceUpdate) {
        self.updates
            .lock()
            .unwrap()
            .insert(update.address, update.clone());

        // Track the largest sync counter on the network, for handoffs.
        if update.as_cdj().is_some() {
            let sync_number = update.sync_number();
            if sync_number > self.largest_sync_counter.load(Ordering::SeqCst) {
                self.largest_sync_counter.store(sync_number, Ordering::SeqCst);
            }
        }

        if update.is_tempo_master() {
            match update.handoff_target() {
                None => {
                    // A normal master assertion. If we were yielding, this
                    // is the moment the handoff completes.
                    if self.master.load(Ordering::SeqCst) {
                        let next = self.next_master.load(Ordering::SeqCst);
                        if next == update.device_number() {
                            self.sync_counter.store(
                                self.largest_sync_counter.load(Ordering::SeqCst) + 1,
                                Ordering::SeqCst,
                            );
                        } else if next == 0xff {
                            warn!(
                                target: "vlink",
                                "saw master asserted by player {} when we were not yielding it",
                                update.device_number()
                            );
                        } else {
                            warn!(
                                target: "vlink",
                                "expected to yield master role to player {} but saw master asserted by player {}",
                                next,
                                update.device_number()
                            );
                        }
                    }
                    self.master.store(false, Ordering::SeqCst);
                    self.next_master.store(0xff, Ordering::SeqCst);
                    let tempo = update.effective_tempo();
                    self.set_tempo_master(Some(update.clone()));
                    if let Some(tempo) = tempo {
                        self.set_master_tempo(tempo);
                    }
                }
                Some(target) => {
                    // The master is yielding; if it is yielding to us, the
                    // role is ours as soon as we assert it.
                    if target == self.device_number() {
                        let yielded_from = self.master_yielded_from.load(Ordering::SeqCst);
                        if update.device_number() != yielded_from {
                            if yielded_from == 0 {
                                info!(
                                    target: "vlink",
                                    "accepting unsolicited master yield; we must be the only synced device playing"
                                );
                            } else {
                                warn!(
                                    target: "vlink",
                                    "expected player {} to yield master to us, but player {} did",
                                    yielded_from,
                                    update.device_number()
                                );
                            }
                        }
                        self.master.store(true, Ordering::SeqCst);
                        self.master_yielded_from.store(0, Ordering::SeqCst);
                        self.set_tempo_master(None);
                        self.set_master_tempo(self.tempo());
                    }
                }
            }
        } else {
            // Not asserting mastery; if we thought this device was master,
            // it has resigned.
            let resigned = self
                .tempo_master
                .lock()
                .unwrap()
                .as_ref()
                .map_or(false, |m| m.address == update.address);
            if resigned {
                self.set_tempo_master(None);
            }
        }

        for l in self.update_listeners.snapshot() {
            listener::guard("device update", || l.received(&update));
        }
    }

    /// A beat from the device we believe is master adjusts the master
    /// tempo and is passed to master listeners.
    pub(crate) fn process_beat(&self, beat: &BeatPacket, source: IpAddr) {
        if !self.is_running() {
            return;
        }
        let from_master = self
            .tempo_master
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |m| m.address == source);
        if from_master {
            self.set_master_tempo(beat.effective_tempo());
            for l in self.master_listeners.snapshot() {
                listener::guard("master beat", || l.new_beat(beat));
            }
        }
    }

    pub(crate) async fn become_tempo_master(&self) -> Result<()> {
        debug!(target: "vlink", "trying to become tempo master");
        if !self.is_sending_status() {
            return Err(VlinkError::NotSendingStatus);
        }

        let current_master = self.tempo_master.lock().unwrap().clone();
        if let Some(master) = current_master {
            // Ask the current master to yield; we take over when the
            // handoff conversation completes.
            let socket = self.ensure_running()?;
            self.requesting_master_from
                .store(master.device_number(), Ordering::SeqCst);
            let payload = proto::master_handoff_request_payload(self.device_number());
            debug!(
                target: "vlink",
                "sending master handoff request to player {}",
                master.device_number()
            );
            self.send_packet(
                &socket,
                PacketType::MasterHandoffRequest,
                &payload,
                SocketAddr::new(master.address, proto::BEAT_PORT),
            )
            .await?;
        } else if !self.master.load(Ordering::SeqCst) {
            // Nobody is master, so we can take the role immediately.
            self.requesting_master_from.store(0, Ordering::SeqCst);
            self.set_master_tempo(self.tempo());
            self.master.store(true, Ordering::SeqCst);
            self.deliver_master_changed(None);
        }
        Ok(())
    }

    /// Another device told us to hand the master role to `device_number`.
    pub(crate) async fn handle_yield_master_to(&self, device_number: u8) {
        debug!(
            target: "vlink",
            "received instruction to yield master to device {}",
            device_number
        );
        if !self.is_tempo_master() {
            warn!(
                target: "vlink",
                "ignoring instruction to yield master to device {}: we are not tempo master",
                device_number
            );
            return;
        }
        if !self.is_sending_status() || self.device_number() == device_number {
            return;
        }

        self.next_master.store(device_number, Ordering::SeqCst);
        match self.latest_status_for(device_number) {
            None => warn!(
                target: "vlink",
                "unable to send master yield response to device {}: no status updates received from it",
                device_number
            ),
            Some(target) => {
                let payload = proto::master_handoff_response_payload(self.device_number());
                let socket = match self.ensure_running() {
                    Ok(socket) => socket,
                    Err(e) => {
                        error!(target: "vlink", "can't send master yield response: {}", e);
                        return;
                    }
                };
                if let Err(e) = self
                    .send_packet(
                        &socket,
                        PacketType::MasterHandoffResponse,
                        &payload,
                        SocketAddr::new(target.address, proto::BEAT_PORT),
                    )
                    .await
                {
                    error!(
                        target: "vlink",
                        "problem sending master yield response to player {}: {}",
                        device_number,
                        e
                    );
                }
            }
        }
    }

    /// A device answered one of our handoff requests.
    pub(crate) fn handle_yield_response(&self, device_number: u8, yielded: bool) {
        debug!(
            target: "vlink",
            "received yield response of {} from device {}",
            yielded,
            device_number
        );
        if !yielded {
            warn!(target: "vlink", "ignoring master yield response with unexpected non-yielding value");
            return;
        }
        if !self.is_sending_status() {
            warn!(target: "vlink", "ignoring master yield response because we are not sending status");
            return;
        }

        let requesting = self.requesting_master_from.load(Ordering::SeqCst);
        if device_number == requesting {
            self.requesting_master_from.store(0, Ordering::SeqCst);
            self.master_yielded_from.store(device_number, Ordering::SeqCst);
        } else if requesting == 0 {
            warn!(
                target: "vlink",
                "ignoring master yield response from player {} because we are not trying to become tempo master",
                device_number
            );
        } else {
            warn!(
                target: "vlink",
                "ignoring master yield response from player {} because we asked player {}",
                device_number,
                requesting
            );
        }
    }

    async fn send_sync_control(&self, device_number: u8, command: SyncCommand) -> Result<()> {
        let socket = self.ensure_running()?;
        let target = self
            .latest_status_for(device_number)
            .ok_or(VlinkError::UnknownPeer(device_number))?;
        let payload = proto::sync_control_payload(self.device_number(), command);
        self.send_packet(
            &socket,
            PacketType::SyncControl,
            &payload,
            SocketAddr::new(target.address, proto::BEAT_PORT),
        )
        .await
    }

    async fn send_packet(
        &self,
        socket: &UdpSocket,
        kind: PacketType,
        payload: &[u8],
        destination: SocketAddr,
    ) -> Result<()> {
        let data = proto::assemble(kind, &self.device_name(), payload);
        socket.send_to(&data, destination).await?;
        Ok(())
    }

    /// Ingest-side handling of everything that arrives on the update port.
    pub(crate) fn handle_update_datagram(&self, data: &[u8], src: SocketAddr) {
        match proto::Packet::parse(data, proto::UPDATE_PORT) {
            Ok(proto::Packet::CdjStatus(status)) => self.process_update(DeviceUpdate {
                address: src.ip(),
                received: Instant::now(),
                status: DeviceStatus::Cdj(status),
            }),
            Ok(proto::Packet::MixerStatus(status)) => self.process_update(DeviceUpdate {
                address: src.ip(),
                received: Instant::now(),
                status: DeviceStatus::Mixer(status),
            }),
            Ok(proto::Packet::MediaResponse(details)) => {
                for l in self.media_listeners.snapshot() {
                    listener::guard("media details", || l.details_available(&details));
                }
            }
            Ok(proto::Packet::LoadTrackAck(ack)) => {
                info!(
                    target: "vlink",
                    "received track load acknowledgment from player {}",
                    ack.device_number
                );
            }
            Ok(proto::Packet::MediaQuery(query)) => {
                warn!(
                    target: "vlink",
                    "received a media query from player {}; we don't serve media",
                    query.device_number
                );
            }
            Ok(other) => {
                warn!(target: "vlink", "ignoring {:?} sent to update port", other);
            }
            Err(VlinkError::UnknownKind) => {
                warn!(target: "vlink", "ignoring unrecognized packet sent to update port");
            }
            Err(e) => {
                warn!(target: "vlink", "problem processing update packet: {}", e);
            }
        }
    }

    /// Sleep while the playback position sits inside the window around a
    /// beat, so the beat packet always precedes the status packet that
    /// reports the new beat.
    pub(crate) async fn avoid_beat_packet(&self) -> Snapshot {
        let mut snapshot = self.playback_position();
        loop {
            let distance = snapshot.distance_from_beat();
            let near = (distance < 0.0 && -distance <= SLEEP_THRESHOLD_MS as f64)
                || (distance >= 0.0 && distance <= (BEAT_THRESHOLD_MS + 1) as f64);
            if !(self.playing.load(Ordering::SeqCst) && near) {
                return snapshot;
            }
            time::sleep(Duration::from_millis(2)).await;
            snapshot = self.playback_position();
        }
    }

    /// Synthesize one status packet and unicast it to every device the
    /// registry knows about.
    pub(crate) async fn send_status(&self, socket: &UdpSocket) {
        let play_state = self.avoid_beat_packet().await;
        let playing = self.playing.load(Ordering::SeqCst);
        let fields = StatusFields {
            device_number: self.device_number(),
            playing,
            master: self.master.load(Ordering::SeqCst),
            synced: self.synced.load(Ordering::SeqCst),
            on_air: self.on_air.load(Ordering::SeqCst),
            sync_counter: self.sync_counter.load(Ordering::SeqCst),
            tempo: self.tempo(),
            handoff_target: self.next_master.load(Ordering::SeqCst),
            beat: wrap_beat(play_state.beat()).max(1) as u32,
            beat_within_bar: play_state.beat_within_bar() as u8,
            packet_counter: self.packet_counter.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let data = proto::assemble(
            PacketType::CdjStatus,
            &self.device_name(),
            &proto::status_payload(&fields),
        );

        for device in self.registry.current_devices() {
            let dest = SocketAddr::new(device.address, proto::UPDATE_PORT);
            if let Err(e) = socket.send_to(&data, dest).await {
                warn!(
                    target: "vlink",
                    "unable to send status packet to device {} at {}: {}",
                    device.number,
                    device.address,
                    e
                );
            }
        }
    }

    /// Broadcast one beat packet for the given playback snapshot and
    /// return the beat number it announced.
    pub(crate) async fn send_beat(&self, snapshot: Snapshot, socket: &UdpSocket) -> i64 {
        let fields = proto::BeatFields {
            device_number: self.device_number(),
            beat_interval: snapshot.beat_interval().round() as u32,
            bar_interval: snapshot.bar_interval().round() as u32,
            beats_per_bar: snapshot.beats_per_bar(),
            beat_within_bar: snapshot.beat_within_bar() as u8,
            tempo: snapshot.tempo(),
        };
        let data = proto::assemble(
            PacketType::Beat,
            &self.device_name(),
            &proto::beat_payload(&fields),
        );
        match self.broadcast_destination() {
            Ok(dest) => {
                if let Err(e) = socket.send_to(&data, dest).await {
                    error!(target: "vlink", "failed to send beat packet: {}", e);
                }
            }
            Err(_) => error!(target: "vlink", "no broadcast address to send beat packet to"),
        }
        snapshot.beat()
    }

    fn deliver_master_changed(&self, update: Option<&DeviceUpdate>) {
        for l in self.master_listeners.snapshot() {
            listener::guard("master changed", || l.master_changed(update));
        }
    }

    fn deliver_tempo_changed(&self, tempo: f64) {
        for l in self.master_listeners.snapshot() {
            listener::guard("tempo changed", || l.tempo_changed(tempo));
        }
    }
}

/// Aligns our metronome with the master while we are synced (and not
/// master ourselves).
struct SyncFollower {
    state: Weak<State>,
}

impl MasterListener for SyncFollower {
    fn master_changed(&self, _update: Option<&DeviceUpdate>) {}

    fn tempo_changed(&self, tempo: f64) {
        if let Some(state) = self.state.upgrade() {
            if !state.is_tempo_master() {
                state.metronome.set_tempo(tempo);
                state.notify_beat_sender_of_change();
            }
        }
    }

    fn new_beat(&self, _beat: &BeatPacket) {
        if let Some(state) = self.state.upgrade() {
            if !state.is_tempo_master() {
                // Snap to the master's beat boundary.
                state.metronome.set_beat_phase(0.0);
                state.notify_beat_sender_of_change();
            }
        }
    }
}

/// Routes mixer and player commands from the beat finder into the
/// participant's state.
struct FinderBridge {
    state: Weak<State>,
}

impl OnAirListener for FinderBridge {
    fn channels_on_air(&self, audible: &HashSet<u8>) {
        if let Some(state) = self.state.upgrade() {
            state
                .on_air
                .store(audible.contains(&state.device_number()), Ordering::SeqCst);
        }
    }
}

impl FaderStartListener for FinderBridge {
    fn faders_changed(&self, start: &HashSet<u8>, stop: &HashSet<u8>) {
        if let Some(state) = self.state.upgrade() {
            let us = state.device_number();
            if start.contains(&us) {
                state.set_playing(true);
            } else if stop.contains(&us) {
                state.set_playing(false);
            }
        }
    }
}

impl SyncCommandListener for FinderBridge {
    fn sync_mode(&self, synced: bool) {
        if let Some(state) = self.state.upgrade() {
            state.set_synced(synced);
        }
    }

    fn become_master(&self) {
        if let Some(state) = self.state.upgrade() {
            debug!(target: "vlink", "received packet telling us to become master");
            if state.is_sending_status() {
                tokio::spawn(async move {
                    if let Err(e) = state.become_tempo_master().await {
                        error!(
                            target: "vlink",
                            "problem becoming tempo master in response to sync command: {}",
                            e
                        );
                    }
                });
            } else {
                warn!(
                    target: "vlink",
                    "ignoring sync command to become tempo master, since we are not sending status packets"
                );
            }
        }
    }
}

impl MasterHandoffListener for FinderBridge {
    fn yield_master_to(&self, device_number: u8) {
        if let Some(state) = self.state.upgrade() {
            tokio::spawn(async move { state.handle_yield_master_to(device_number).await });
        }
    }

    fn yield_response(&self, device_number: u8, yielded: bool) {
        if let Some(state) = self.state.upgrade() {
            state.handle_yield_response(device_number, yielded);
        }
    }
}

impl BeatListener for FinderBridge {
    fn new_beat(&self, beat: &BeatPacket, source: IpAddr) {
        if let Some(state) = self.state.upgrade() {
            state.process_beat(beat, source);
        }
    }
}

/// If the registry goes away we cannot keep running.
struct RegistryBridge {
    state: Weak<State>,
}

impl LifecycleListener for RegistryBridge {
    fn started(&self) {}

    fn stopped(&self) {
        if let Some(state) = self.state.upgrade() {
            if state.is_running() {
                info!(target: "vlink", "virtual player stopping because the device registry stopped");
                tokio::spawn(async move { state.stop().await });
            }
        }
    }
}

/// If the beat finder goes away we can no longer hear handoff traffic, so
/// status sending has to stop.
struct FinderLifecycleBridge {
    state: Weak<State>,
}

impl LifecycleListener for FinderLifecycleBridge {
    fn started(&self) {}

    fn stopped(&self) {
        if let Some(state) = self.state.upgrade() {
            if state.is_sending_status() {
                info!(target: "vlink", "no longer sending status because the beat finder stopped");
                tokio::spawn(async move {
                    if let Err(e) = state.set_sending_status(false).await {
                        error!(target: "vlink", "problem stopping status sending: {}", e);
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{assemble, beat_payload, status_payload, BeatFields};

    fn participant() -> Participant {
        Participant::new(Config {
            name: "test player".to_string(),
            device_number: 2,
            ..Config::default()
        })
        .unwrap()
    }

    /// Pretend status sending is active without any sockets or tasks.
    fn fake_sending_status(state: &State) {
        let (tx, _rx) = watch::channel(true);
        *state.sending_status.lock().unwrap() = Some(tx);
    }

    fn cdj_update(
        device: u8,
        last_octet: u8,
        master: bool,
        yield_to: Option<u8>,
        tempo: f64,
        sync_counter: u32,
    ) -> DeviceUpdate {
        let fields = StatusFields {
            device_number: device,
            playing: true,
            master,
            synced: false,
            on_air: false,
            sync_counter,
            tempo,
            handoff_target: yield_to.unwrap_or(0xff),
            beat: 1,
            beat_within_bar: 1,
            packet_counter: 1,
        };
        let data = assemble(
            PacketType::CdjStatus,
            &format!("CDJ-{}", device),
            &status_payload(&fields),
        );
        match proto::Packet::parse(&data, proto::UPDATE_PORT).unwrap() {
            proto::Packet::CdjStatus(status) => DeviceUpdate {
                address: IpAddr::from([192, 168, 1, last_octet]),
                received: Instant::now(),
                status: DeviceStatus::Cdj(status),
            },
            other => panic!("unexpected packet {:?}", other),
        }
    }

    fn beat_from(device: u8, tempo: f64) -> BeatPacket {
        let data = assemble(
            PacketType::Beat,
            &format!("CDJ-{}", device),
            &beat_payload(&BeatFields {
                device_number: device,
                beat_interval: 500,
                bar_interval: 2000,
                beats_per_bar: 4,
                beat_within_bar: 1,
                tempo,
            }),
        );
        match proto::Packet::parse(&data, proto::BEAT_PORT).unwrap() {
            proto::Packet::Beat(beat) => beat,
            other => panic!("unexpected packet {:?}", other),
        }
    }

    struct MasterEvents {
        changes: Mutex<Vec<Option<u8>>>,
        tempos: Mutex<Vec<f64>>,
        beats: Mutex<Vec<u8>>,
    }

    impl MasterEvents {
        fn new() -> Arc<MasterEvents> {
            Arc::new(MasterEvents {
                changes: Mutex::new(Vec::new()),
                tempos: Mutex::new(Vec::new()),
                beats: Mutex::new(Vec::new()),
            })
        }
    }

    impl MasterListener for MasterEvents {
        fn master_changed(&self, update: Option<&DeviceUpdate>) {
            self.changes
                .lock()
                .unwrap()
                .push(update.map(|u| u.device_number()));
        }

        fn tempo_changed(&self, tempo: f64) {
            self.tempos.lock().unwrap().push(tempo);
        }

        fn new_beat(&self, beat: &BeatPacket) {
            self.beats.lock().unwrap().push(beat.device_number);
        }
    }

    #[test]
    fn test_choose_device_number() {
        let used: HashSet<u8> = [1, 2, 4].into_iter().collect();
        assert_eq!(choose_device_number(&used, true).unwrap(), 3);
        assert_eq!(choose_device_number(&used, false).unwrap(), 5);

        let all_high: HashSet<u8> = (5..16).collect();
        assert!(matches!(
            choose_device_number(&all_high, false),
            Err(VlinkError::NoAvailableNumber { low: 5 })
        ));
        // With the standard range allowed, the low numbers are still open.
        assert_eq!(choose_device_number(&all_high, true).unwrap(), 1);

        let everything: HashSet<u8> = (1..16).collect();
        assert!(choose_device_number(&everything, true).is_err());
    }

    #[test]
    fn test_wrap_beat() {
        assert_eq!(wrap_beat(1), 1);
        assert_eq!(wrap_beat(MAX_BEAT), MAX_BEAT);
        assert_eq!(wrap_beat(MAX_BEAT + 1), 1);
        assert_eq!(wrap_beat(MAX_BEAT + 7), 7);
        assert_eq!(wrap_beat(2 * MAX_BEAT), MAX_BEAT);
    }

    #[test]
    fn test_jump_to_beat_wraps_and_clamps() {
        let p = participant();
        p.set_playing(true);
        p.jump_to_beat(MAX_BEAT + 5);
        assert_eq!(p.playback_position().beat(), 5);
        p.jump_to_beat(0);
        assert_eq!(p.playback_position().beat(), 1);

        p.set_playing(false);
        p.jump_to_beat(42);
        assert_eq!(p.playback_position().beat(), 42);
    }

    #[test]
    fn test_adjust_playback_position_never_drops_below_beat_one() {
        let p = participant();
        p.set_playing(true);
        p.jump_to_beat(1);
        // Jumping backwards from beat one would land before the track; a
        // bar is added to compensate.
        p.adjust_playback_position(-400);
        assert!(p.playback_position().beat() >= 1);

        p.jump_to_beat(9);
        p.adjust_playback_position(1000); // forward two beats at 120 BPM
        assert_eq!(p.playback_position().beat(), 11);
    }

    #[test]
    fn test_unsolicited_master_takeover() {
        let p = participant();
        let state = &p.state;
        let events = MasterEvents::new();
        p.add_master_listener(events.clone());

        state.master.store(true, Ordering::SeqCst);
        state.process_update(cdj_update(5, 15, true, None, 128.0, 3));

        assert!(!p.is_tempo_master());
        assert_eq!(state.next_master.load(Ordering::SeqCst), 0xff);
        assert_eq!(p.tempo_master().unwrap().device_number(), 5);
        assert_eq!(p.master_tempo(), 128.0);
        assert_eq!(*events.changes.lock().unwrap(), vec![Some(5)]);
    }

    #[test]
    fn test_graceful_handoff_updates_sync_counter() {
        let p = participant();
        let state = &p.state;

        state.master.store(true, Ordering::SeqCst);
        state.next_master.store(5, Ordering::SeqCst);
        state.largest_sync_counter.store(7, Ordering::SeqCst);
        state.process_update(cdj_update(5, 15, true, None, 120.0, 2));

        assert!(!p.is_tempo_master());
        assert_eq!(state.sync_counter.load(Ordering::SeqCst), 8);
        assert_eq!(state.next_master.load(Ordering::SeqCst), 0xff);
    }

    #[test]
    fn test_assisted_handoff_to_us() {
        let p = participant();
        let state = &p.state;
        let events = MasterEvents::new();
        p.add_master_listener(events.clone());
        fake_sending_status(state);

        // Device 3 is master and we have asked it to yield.
        state.process_update(cdj_update(3, 13, true, None, 126.0, 4));
        state.requesting_master_from.store(3, Ordering::SeqCst);

        state.handle_yield_response(3, true);
        assert_eq!(state.requesting_master_from.load(Ordering::SeqCst), 0);
        assert_eq!(state.master_yielded_from.load(Ordering::SeqCst), 3);

        // Its next status packet yields to us, completing the handoff.
        state.process_update(cdj_update(3, 13, true, Some(2), 126.0, 4));
        assert!(p.is_tempo_master());
        assert_eq!(state.master_yielded_from.load(Ordering::SeqCst), 0);
        assert!(p.tempo_master().is_none());
        assert_eq!(p.master_tempo(), p.tempo());
        assert_eq!(*events.changes.lock().unwrap(), vec![Some(3), None]);
    }

    #[test]
    fn test_yield_response_mismatches_are_ignored() {
        let p = participant();
        let state = &p.state;
        fake_sending_status(state);

        state.requesting_master_from.store(3, Ordering::SeqCst);
        state.handle_yield_response(4, true); // wrong player
        assert_eq!(state.requesting_master_from.load(Ordering::SeqCst), 3);
        assert_eq!(state.master_yielded_from.load(Ordering::SeqCst), 0);

        state.handle_yield_response(3, false); // declined
        assert_eq!(state.requesting_master_from.load(Ordering::SeqCst), 3);
        assert_eq!(state.master_yielded_from.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_master_resignation_clears_master() {
        let p = participant();
        let state = &p.state;
        let events = MasterEvents::new();
        p.add_master_listener(events.clone());

        state.process_update(cdj_update(5, 15, true, None, 124.0, 2));
        state.process_update(cdj_update(5, 15, false, None, 124.0, 2));

        assert!(p.tempo_master().is_none());
        assert_eq!(*events.changes.lock().unwrap(), vec![Some(5), None]);
    }

    #[test]
    fn test_tempo_changed_gate() {
        let p = participant();
        let state = &p.state;
        let events = MasterEvents::new();
        p.add_master_listener(events.clone());

        // No master anywhere: no tempo-changed events.
        p.set_tempo(126.0).unwrap();
        assert!(events.tempos.lock().unwrap().is_empty());

        // As master, a real change is published...
        state.master.store(true, Ordering::SeqCst);
        p.set_tempo(127.0).unwrap();
        assert_eq!(*events.tempos.lock().unwrap(), vec![127.0]);

        // ...but a sub-epsilon wiggle is not.
        p.set_tempo(127.00005).unwrap();
        assert_eq!(events.tempos.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_master_tempo_changes_from_status() {
        let p = participant();
        let events = MasterEvents::new();
        p.add_master_listener(events.clone());

        p.state.process_update(cdj_update(5, 15, true, None, 124.0, 2));
        p.state.process_update(cdj_update(5, 15, true, None, 125.0, 2));

        assert_eq!(p.master_tempo(), 125.0);
        let tempos = events.tempos.lock().unwrap();
        assert!(tempos.contains(&125.0));
    }

    #[tokio::test]
    async fn test_process_beat_from_master_only() {
        let p = participant();
        let state = &p.state;
        let events = MasterEvents::new();
        p.add_master_listener(events.clone());

        state.process_update(cdj_update(5, 15, true, None, 124.0, 2));
        let master_addr = IpAddr::from([192, 168, 1, 15]);

        // Beats are ignored while we are not running.
        state.process_beat(&beat_from(5, 126.0), master_addr);
        assert!(events.beats.lock().unwrap().is_empty());
        assert_eq!(p.master_tempo(), 124.0);

        // Give the participant a socket so it counts as running.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        *state.socket.lock().unwrap() = Some(Arc::new(socket));

        // A beat from a non-master address is not a master beat.
        state.process_beat(&beat_from(9, 126.0), IpAddr::from([192, 168, 1, 99]));
        assert!(events.beats.lock().unwrap().is_empty());

        // One from the master's address updates the master tempo and is
        // re-delivered as a master beat.
        state.process_beat(&beat_from(5, 126.0), master_addr);
        assert_eq!(*events.beats.lock().unwrap(), vec![5]);
        assert_eq!(p.master_tempo(), 126.0);

        *state.socket.lock().unwrap() = None;
    }

    #[test]
    fn test_set_device_number_guards() {
        let p = participant();
        fake_sending_status(&p.state);
        assert!(matches!(
            p.set_device_number(3),
            Err(VlinkError::BusySendingStatus)
        ));
        *p.state.sending_status.lock().unwrap() = None;
        p.set_device_number(3).unwrap();
        assert_eq!(p.device_number(), 3);
    }

    #[test]
    fn test_config_validation() {
        let p = participant();
        assert!(p.set_device_name("this name is far too long to fit").is_err());
        p.set_device_name("ok").unwrap();
        assert_eq!(p.device_name(), "ok");

        assert!(p.set_announce_interval(100).is_err());
        assert!(p.set_announce_interval(2500).is_err());
        p.set_announce_interval(500).unwrap();
        assert_eq!(p.announce_interval(), 500);

        assert!(p.set_status_interval(10).is_err());
        p.set_status_interval(100).unwrap();
        assert_eq!(p.status_interval(), 100);

        assert!(p.set_tempo(0.0).is_err());
        assert!(p.set_tempo(-10.0).is_err());
    }

    #[test]
    fn test_same_network() {
        let a = Ipv4Addr::new(192, 168, 1, 10);
        let b = Ipv4Addr::new(192, 168, 1, 200);
        let c = Ipv4Addr::new(192, 168, 2, 10);
        assert!(same_network(24, a, b));
        assert!(!same_network(24, a, c));
        assert!(same_network(16, a, c));
    }

    #[tokio::test]
    async fn test_commands_require_running() {
        let p = participant();
        let start: HashSet<u8> = [1].into_iter().collect();
        let stop: HashSet<u8> = HashSet::new();
        assert!(matches!(
            p.send_fader_start_command(&start, &stop).await,
            Err(VlinkError::NotRunning)
        ));
        assert!(matches!(
            p.send_media_query(2, TrackSourceSlot::UsbSlot).await,
            Err(VlinkError::NotRunning)
        ));
        assert!(matches!(
            p.become_tempo_master().await,
            Err(VlinkError::NotSendingStatus)
        ));
    }

    #[tokio::test]
    async fn test_yield_master_to_records_next_master() {
        let p = participant();
        let state = &p.state;
        fake_sending_status(state);
        state.master.store(true, Ordering::SeqCst);
        state.process_update(cdj_update(4, 14, false, None, 120.0, 1));

        // The response send fails (we have no socket), but the handoff
        // state must still be recorded so our status packets carry it.
        state.handle_yield_master_to(4).await;
        assert_eq!(state.next_master.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_yield_master_ignored_when_not_master() {
        let p = participant();
        let state = &p.state;
        fake_sending_status(state);
        state.handle_yield_master_to(4).await;
        assert_eq!(state.next_master.load(Ordering::SeqCst), 0xff);
    }

    #[tokio::test]
    async fn test_avoid_beat_packet_returns_immediately_when_stopped() {
        let p = participant();
        let snapshot = p.state.avoid_beat_packet().await;
        assert_eq!(snapshot.beat(), 1);
    }

    #[tokio::test]
    async fn test_become_master_directly_when_no_master() {
        let p = participant();
        let state = &p.state;
        let events = MasterEvents::new();
        p.add_master_listener(events.clone());
        fake_sending_status(state);

        state.become_tempo_master().await.unwrap();

        assert!(p.is_tempo_master());
        assert_eq!(p.master_tempo(), p.tempo());
        assert_eq!(*events.changes.lock().unwrap(), vec![None]);
    }
}
