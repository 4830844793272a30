use std::net::IpAddr;

use thiserror::Error;
use tokio::time::Instant;

pub mod beat_finder;
pub mod grid;
pub mod listener;
pub mod metronome;
pub mod participant;
pub mod proto;
pub mod registry;
mod tasks;

pub use beat_finder::BeatFinder;
pub use grid::{BeatGrid, CueEntry, CueList};
pub use metronome::{Metronome, Snapshot};
pub use participant::Participant;
pub use registry::{DeviceAnnouncement, DeviceRegistry};

#[derive(Error, Debug)]
pub enum VlinkError {
    #[error("terminating")]
    Terminating,

    #[error("no DJ Link devices found on the network")]
    NoPeers,

    #[error("no unused device number between {low} and 15")]
    NoAvailableNumber { low: u8 },

    #[error("can't change device number while sending status packets")]
    BusySendingStatus,

    #[error("virtual player is not running")]
    NotRunning,

    #[error("must be sending status updates to do that")]
    NotSendingStatus,

    #[error("sending status requires a device number from 1 to 4, ours is {0}")]
    InvalidDeviceNumberForStatus(u8),

    #[error("device {0} not found on the network")]
    UnknownPeer(u8),

    #[error("{kind} at 0x{pos:x} parsing packet:\n{dump}")]
    MalformedPacket {
        kind: String,
        pos: usize,
        dump: String,
    },

    #[error("unrecognized packet")]
    UnknownKind,

    #[error("invalid {name}: {reason}")]
    InvalidArgument {
        name: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VlinkError>;

/// Settings the virtual player starts from. Everything here can also be
/// changed through the participant's setters before `start`.
#[derive(Clone, Debug)]
pub struct Config {
    /// Name announced on the network, at most twenty ASCII bytes.
    pub name: String,
    /// Device number to claim; zero requests self-assignment at start.
    pub device_number: u8,
    /// Whether self-assignment may pick a real-player number (1 to 4).
    pub use_standard_player_number: bool,
    /// Milliseconds between presence announcements.
    pub announce_interval: u32,
    /// Milliseconds between status packets when we are sending them.
    pub status_interval: u32,
    /// Smallest BPM difference treated as a real tempo change.
    pub tempo_epsilon: f64,
    /// Tempo we report before anything changes it.
    pub tempo: f64,
    pub playing: bool,
    pub synced: bool,
    pub on_air: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            name: "vlink".to_string(),
            device_number: 0,
            use_standard_player_number: false,
            announce_interval: 1500,
            status_interval: 200,
            tempo_epsilon: 0.0001,
            tempo: metronome::DEFAULT_TEMPO,
            playing: false,
            synced: false,
            on_air: false,
        }
    }
}

/// A status report received from a device on the network, together with
/// where and when it arrived. These are what the election state machine
/// and the device-update listeners consume.
#[derive(Clone, Debug)]
pub struct DeviceUpdate {
    pub address: IpAddr,
    pub received: Instant,
    pub status: DeviceStatus,
}

#[derive(Clone, Debug)]
pub enum DeviceStatus {
    Cdj(proto::CdjStatus),
    Mixer(proto::MixerStatus),
}

impl DeviceUpdate {
    pub fn device_number(&self) -> u8 {
        match &self.status {
            DeviceStatus::Cdj(s) => s.device_number,
            DeviceStatus::Mixer(s) => s.device_number,
        }
    }

    pub fn device_name(&self) -> &str {
        match &self.status {
            DeviceStatus::Cdj(s) => &s.name,
            DeviceStatus::Mixer(s) => &s.name,
        }
    }

    pub fn is_tempo_master(&self) -> bool {
        match &self.status {
            DeviceStatus::Cdj(s) => s.is_tempo_master(),
            DeviceStatus::Mixer(s) => s.is_tempo_master(),
        }
    }

    /// Device number the master role is being yielded to, if this update
    /// is part of a handoff. Mixers never yield.
    pub fn handoff_target(&self) -> Option<u8> {
        match &self.status {
            DeviceStatus::Cdj(s) => s.handoff_target,
            DeviceStatus::Mixer(_) => None,
        }
    }

    pub fn sync_number(&self) -> u32 {
        match &self.status {
            DeviceStatus::Cdj(s) => s.sync_number,
            DeviceStatus::Mixer(_) => 0,
        }
    }

    pub fn effective_tempo(&self) -> Option<f64> {
        match &self.status {
            DeviceStatus::Cdj(s) => s.effective_tempo(),
            DeviceStatus::Mixer(s) => s.effective_tempo(),
        }
    }

    pub fn beat_within_bar(&self) -> u8 {
        match &self.status {
            DeviceStatus::Cdj(s) => s.beat_within_bar,
            DeviceStatus::Mixer(s) => s.beat_within_bar,
        }
    }

    pub fn as_cdj(&self) -> Option<&proto::CdjStatus> {
        match &self.status {
            DeviceStatus::Cdj(s) => Some(s),
            DeviceStatus::Mixer(_) => None,
        }
    }
}
