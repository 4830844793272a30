use std::collections::HashSet;
use std::convert::TryInto;

use byteorder::{BigEndian, ByteOrder};
use log::warn;
use nom::{
    bytes::complete::{tag, take},
    number::complete::{be_u16, be_u32, be_u64, be_u8},
    IResult,
};
use nom_locate::LocatedSpan;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use pretty_hex::pretty_hex;

use crate::{Result, VlinkError};

type Span<'a> = LocatedSpan<&'a [u8]>;

/// The ten magic bytes opening every packet in the protocol.
pub const HEADER: &[u8] = &[0x51, 0x73, 0x70, 0x74, 0x31, 0x57, 0x6d, 0x4a, 0x4f, 0x4c];

/// Port on which presence announcements are broadcast.
pub const ANNOUNCEMENT_PORT: u16 = 50000;
/// Port on which beats and control commands are received.
pub const BEAT_PORT: u16 = 50001;
/// Port on which status updates and media queries are received.
pub const UPDATE_PORT: u16 = 50002;

/// Offset of the type byte following the magic prefix.
const TYPE_OFFSET: usize = 0x0a;
/// Where the device name starts in announcement packets.
pub const DEVICE_NAME_OFFSET: usize = 0x0c;
pub const DEVICE_NAME_LENGTH: usize = 0x14;
/// Where the device number lives in announcement packets.
pub const DEVICE_NUMBER_OFFSET: usize = 0x24;
pub const MAC_OFFSET: usize = 0x26;
pub const IP_OFFSET: usize = 0x2c;

/// In every packet other than an announcement the device name directly
/// follows the type byte, and the payload starts right after it.
const PACKET_NAME_OFFSET: usize = 0x0b;
const PAYLOAD_OFFSET: usize = 0x1f;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketType {
    FaderStart,
    ChannelsOnAir,
    MediaQuery,
    MediaResponse,
    Announcement,
    CdjStatus,
    LoadTrack,
    LoadTrackAck,
    MasterHandoffRequest,
    MasterHandoffResponse,
    Beat,
    MixerStatus,
    SyncControl,
}

impl PacketType {
    pub fn protocol_value(self) -> u8 {
        match self {
            PacketType::FaderStart => 0x02,
            PacketType::ChannelsOnAir => 0x03,
            PacketType::MediaQuery => 0x05,
            PacketType::MediaResponse => 0x06,
            PacketType::Announcement => 0x06,
            PacketType::CdjStatus => 0x0a,
            PacketType::LoadTrack => 0x19,
            PacketType::LoadTrackAck => 0x1a,
            PacketType::MasterHandoffRequest => 0x26,
            PacketType::MasterHandoffResponse => 0x27,
            PacketType::Beat => 0x28,
            PacketType::MixerStatus => 0x29,
            PacketType::SyncControl => 0x2a,
        }
    }

    /// Resolve a type byte against the set of kinds expected on a port.
    /// The value 0x06 means an announcement on the announcement port but a
    /// media response on the update port.
    fn for_port(value: u8, port: u16) -> Option<PacketType> {
        match (port, value) {
            (ANNOUNCEMENT_PORT, 0x06) => Some(PacketType::Announcement),
            (BEAT_PORT, 0x02) => Some(PacketType::FaderStart),
            (BEAT_PORT, 0x03) => Some(PacketType::ChannelsOnAir),
            (BEAT_PORT, 0x26) => Some(PacketType::MasterHandoffRequest),
            (BEAT_PORT, 0x27) => Some(PacketType::MasterHandoffResponse),
            (BEAT_PORT, 0x28) => Some(PacketType::Beat),
            (BEAT_PORT, 0x2a) => Some(PacketType::SyncControl),
            (UPDATE_PORT, 0x05) => Some(PacketType::MediaQuery),
            (UPDATE_PORT, 0x06) => Some(PacketType::MediaResponse),
            (UPDATE_PORT, 0x0a) => Some(PacketType::CdjStatus),
            (UPDATE_PORT, 0x19) => Some(PacketType::LoadTrack),
            (UPDATE_PORT, 0x1a) => Some(PacketType::LoadTrackAck),
            (UPDATE_PORT, 0x29) => Some(PacketType::MixerStatus),
            _ => None,
        }
    }

    /// Shortest packet we will accept for the kind. Anything longer is
    /// tolerated with a warning; real players routinely append fields.
    fn min_len(self) -> usize {
        match self {
            PacketType::FaderStart => PAYLOAD_OFFSET + 9,
            PacketType::ChannelsOnAir => PAYLOAD_OFFSET + 14,
            PacketType::MediaQuery => PAYLOAD_OFFSET + 17,
            PacketType::MediaResponse => 0xc0,
            PacketType::Announcement => 0x36,
            PacketType::CdjStatus => 208,
            PacketType::LoadTrack => PAYLOAD_OFFSET + 58,
            PacketType::LoadTrackAck => 0x22,
            PacketType::MasterHandoffRequest => PAYLOAD_OFFSET + 9,
            PacketType::MasterHandoffResponse => PAYLOAD_OFFSET + 13,
            PacketType::Beat => 96,
            PacketType::MixerStatus => 56,
            PacketType::SyncControl => PAYLOAD_OFFSET + 13,
        }
    }
}

/// Media slots a track can be served from.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, Hash, PartialEq)]
#[repr(u8)]
pub enum TrackSourceSlot {
    NoTrack = 0x00,
    CdSlot = 0x01,
    SdSlot = 0x02,
    UsbSlot = 0x03,
    Collection = 0x04,
}

/// The kinds of track a player can have loaded.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, Hash, PartialEq)]
#[repr(u8)]
pub enum TrackType {
    NoTrack = 0x00,
    Rekordbox = 0x01,
    Unanalyzed = 0x02,
    CdDigitalAudio = 0x05,
}

/// Commands carried by a sync-control packet.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum SyncCommand {
    BecomeMaster = 0x01,
    SyncOn = 0x10,
    SyncOff = 0x20,
}

/// Neutral pitch value; the raw field scales linearly around it.
const PITCH_NEUTRAL: f64 = 0x100000 as f64;

/// Turn a raw pitch field into a tempo multiplier (1.0 = neutral).
pub fn pitch_multiplier(pitch: u32) -> f64 {
    pitch as f64 / PITCH_NEUTRAL
}

/// Check the magic prefix and resolve the type byte against the kinds
/// expected on the given port. `None` means the packet should be ignored.
pub fn validate_header(data: &[u8], port: u16) -> Option<PacketType> {
    if data.len() <= TYPE_OFFSET || &data[..HEADER.len()] != HEADER {
        return None;
    }
    PacketType::for_port(data[TYPE_OFFSET], port)
}

fn header(i: Span) -> IResult<Span, ()> {
    let (i, _) = tag(HEADER)(i)?;
    Ok((i, ()))
}

fn device_name(i: Span) -> IResult<Span, String> {
    let (i, raw_name) = take(DEVICE_NAME_LENGTH)(i)?;
    let name = String::from_utf8_lossy(&raw_name);
    let name = name.trim_end_matches('\0');

    Ok((i, name.into()))
}

fn mac_addr(i: Span) -> IResult<Span, [u8; 6]> {
    let (i, mac_addr) = take(6usize)(i)?;
    Ok((i, (*mac_addr.fragment()).try_into().unwrap()))
}

fn ip_addr(i: Span) -> IResult<Span, [u8; 4]> {
    let (i, ip_addr) = take(4usize)(i)?;
    Ok((i, (*ip_addr.fragment()).try_into().unwrap()))
}

fn channel_bytes(i: Span) -> IResult<Span, [u8; 4]> {
    let (i, bytes) = take(4usize)(i)?;
    Ok((i, (*bytes.fragment()).try_into().unwrap()))
}

/// Decode a NUL-padded UTF-16BE string field of `len` bytes.
fn utf16_field(len: usize) -> impl Fn(Span) -> IResult<Span, String> {
    move |i: Span| {
        let (i, raw) = take(len)(i)?;
        let units: Vec<u16> = raw
            .fragment()
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        let text = String::from_utf16_lossy(&units);
        Ok((i, text.trim_end_matches('\0').to_string()))
    }
}

/// Skip past the magic, type byte, name block and two framing bytes, to
/// the start of the payload, returning the device name.
fn packet_preamble(i: Span) -> IResult<Span, String> {
    let (i, _) = header(i)?;
    let (i, _) = take(1usize)(i)?; // type byte, resolved by validate_header
    let (i, name) = device_name(i)?;
    let (i, _) = take(2usize)(i)?;
    Ok((i, name))
}

/// A presence announcement, broadcast by every device on port 50000.
#[derive(Clone, Debug, PartialEq)]
pub struct AnnouncementPacket {
    pub name: String,
    pub device_number: u8,
    pub mac_addr: [u8; 6],
    pub ip_addr: [u8; 4],
}

/// The fixed announcement packet shape; name, device number, MAC, and IP
/// are patched in at their offsets before each send.
pub const ANNOUNCEMENT_TEMPLATE: [u8; 54] = [
    0x51, 0x73, 0x70, 0x74, 0x31, 0x57, 0x6d, 0x4a, 0x4f, 0x4c, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x02, 0x00, 0x36, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x00, 0x00, 0x01, 0x00,
];

impl AnnouncementPacket {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x06, 0x00][..])(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = take(4usize)(i)?;
        let (i, device_number) = be_u8(i)?;
        let (i, _device_type) = be_u8(i)?;
        let (i, mac_addr) = mac_addr(i)?;
        let (i, ip_addr) = ip_addr(i)?;

        Ok((
            i,
            Packet::Announcement(AnnouncementPacket {
                name,
                device_number,
                mac_addr,
                ip_addr,
            }),
        ))
    }

    pub fn to_bytes(&self) -> [u8; 54] {
        let mut data = ANNOUNCEMENT_TEMPLATE;
        write_name(&mut data[DEVICE_NAME_OFFSET..], &self.name);
        data[DEVICE_NUMBER_OFFSET] = self.device_number;
        data[MAC_OFFSET..MAC_OFFSET + 6].copy_from_slice(&self.mac_addr);
        data[IP_OFFSET..IP_OFFSET + 4].copy_from_slice(&self.ip_addr);
        data
    }
}

/// The detailed state a player reports a few times a second.
#[derive(Clone, Debug, PartialEq)]
pub struct CdjStatus {
    pub name: String,
    pub device_number: u8,
    pub track_source_player: u8,
    pub track_source_slot: u8,
    pub track_type: u8,
    pub rekordbox_id: u32,
    pub firmware: String,
    pub sync_number: u32,
    /// The F bit vector: 0x40 playing, 0x20 master, 0x10 synced, 0x08 on air.
    pub flags: u8,
    pub pitch: u32,
    /// Tempo times one hundred; 0xffff when no track is loaded.
    pub bpm_raw: u16,
    /// Device number the master role is being yielded to, when a handoff
    /// is in progress.
    pub handoff_target: Option<u8>,
    /// Current beat number within the track; 0xffffffff when unknown.
    pub beat: u32,
    pub cue_countdown: u16,
    pub beat_within_bar: u8,
    pub packet_count: u32,
}

impl CdjStatus {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, name) = packet_preamble(i)?;
        let (i, device_number) = be_u8(i)?; // 0x21
        let (i, _) = take(6usize)(i)?;
        let (i, track_source_player) = be_u8(i)?; // 0x28
        let (i, track_source_slot) = be_u8(i)?;
        let (i, track_type) = be_u8(i)?;
        let (i, _) = take(1usize)(i)?;
        let (i, rekordbox_id) = be_u32(i)?; // 0x2c
        let (i, _) = take(0x4cusize)(i)?;
        let (i, firmware_raw) = take(4usize)(i)?; // 0x7c
        let firmware = String::from_utf8_lossy(firmware_raw.fragment())
            .trim_end_matches('\0')
            .to_string();
        let (i, _) = take(4usize)(i)?;
        let (i, sync_number) = be_u32(i)?; // 0x84
        let (i, _) = take(1usize)(i)?;
        let (i, flags) = be_u8(i)?; // 0x89
        let (i, _) = take(2usize)(i)?;
        let (i, pitch) = be_u32(i)?; // 0x8c
        let (i, _) = take(2usize)(i)?;
        let (i, bpm_raw) = be_u16(i)?; // 0x92
        let (i, _) = take(0xbusize)(i)?;
        let (i, handoff) = be_u8(i)?; // 0x9f
        let (i, beat) = be_u32(i)?; // 0xa0
        let (i, cue_countdown) = be_u16(i)?; // 0xa4
        let (i, beat_within_bar) = be_u8(i)?; // 0xa6
        let (i, _) = take(0x21usize)(i)?;
        let (i, packet_count) = be_u32(i)?; // 0xc8

        Ok((
            i,
            Packet::CdjStatus(CdjStatus {
                name,
                device_number,
                track_source_player,
                track_source_slot,
                track_type,
                rekordbox_id,
                firmware,
                sync_number,
                flags,
                pitch,
                bpm_raw,
                handoff_target: match handoff {
                    0x00 | 0xff => None,
                    d => Some(d),
                },
                beat,
                cue_countdown,
                beat_within_bar,
                packet_count,
            }),
        ))
    }

    pub fn is_playing(&self) -> bool {
        self.flags & 0x40 != 0
    }

    pub fn is_tempo_master(&self) -> bool {
        self.flags & 0x20 != 0
    }

    pub fn is_synced(&self) -> bool {
        self.flags & 0x10 != 0
    }

    pub fn is_on_air(&self) -> bool {
        self.flags & 0x08 != 0
    }

    /// The track tempo in BPM, if a track is loaded.
    pub fn tempo(&self) -> Option<f64> {
        if self.bpm_raw == 0xffff {
            None
        } else {
            Some(self.bpm_raw as f64 / 100.0)
        }
    }

    /// The tempo actually being played: track tempo scaled by pitch.
    pub fn effective_tempo(&self) -> Option<f64> {
        self.tempo().map(|t| t * pitch_multiplier(self.pitch))
    }

    pub fn track_source_slot(&self) -> Option<TrackSourceSlot> {
        TrackSourceSlot::from_u8(self.track_source_slot)
    }

    pub fn track_type(&self) -> Option<TrackType> {
        TrackType::from_u8(self.track_type)
    }
}

/// The periodic state report of a DJM mixer.
#[derive(Clone, Debug, PartialEq)]
pub struct MixerStatus {
    pub name: String,
    pub device_number: u8,
    pub flags: u8,
    pub pitch: u32,
    pub bpm_raw: u16,
    pub beat_within_bar: u8,
}

impl MixerStatus {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, name) = packet_preamble(i)?;
        let (i, device_number) = be_u8(i)?; // 0x21
        let (i, _) = take(5usize)(i)?;
        let (i, flags) = be_u8(i)?; // 0x27
        let (i, pitch) = be_u32(i)?; // 0x28
        let (i, _) = take(2usize)(i)?;
        let (i, bpm_raw) = be_u16(i)?; // 0x2e
        let (i, _) = take(7usize)(i)?;
        let (i, beat_within_bar) = be_u8(i)?; // 0x37

        Ok((
            i,
            Packet::MixerStatus(MixerStatus {
                name,
                device_number,
                flags,
                pitch,
                bpm_raw,
                beat_within_bar,
            }),
        ))
    }

    pub fn is_tempo_master(&self) -> bool {
        self.flags & 0x20 != 0
    }

    pub fn tempo(&self) -> Option<f64> {
        if self.bpm_raw == 0xffff {
            None
        } else {
            Some(self.bpm_raw as f64 / 100.0)
        }
    }

    pub fn effective_tempo(&self) -> Option<f64> {
        self.tempo().map(|t| t * pitch_multiplier(self.pitch))
    }
}

/// A beat announcement, broadcast on the beat port at each beat.
#[derive(Clone, Debug, PartialEq)]
pub struct BeatPacket {
    pub name: String,
    pub device_number: u8,
    pub next_beat_ms: u32,
    pub second_beat_ms: u32,
    pub next_bar_ms: u32,
    pub fourth_beat_ms: u32,
    pub second_bar_ms: u32,
    pub eighth_beat_ms: u32,
    pub pitch: u32,
    pub bpm_raw: u16,
    pub beat_within_bar: u8,
}

impl BeatPacket {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, name) = packet_preamble(i)?;
        let (i, device_number) = be_u8(i)?; // 0x21
        let (i, _) = take(2usize)(i)?;
        let (i, next_beat_ms) = be_u32(i)?; // 0x24
        let (i, second_beat_ms) = be_u32(i)?;
        let (i, next_bar_ms) = be_u32(i)?; // 0x2c
        let (i, fourth_beat_ms) = be_u32(i)?;
        let (i, second_bar_ms) = be_u32(i)?; // 0x34
        let (i, eighth_beat_ms) = be_u32(i)?;
        let (i, _) = take(24usize)(i)?; // padding, should be 0xff
        let (i, pitch) = be_u32(i)?; // 0x54
        let (i, _) = take(2usize)(i)?;
        let (i, bpm_raw) = be_u16(i)?; // 0x5a
        let (i, beat_within_bar) = be_u8(i)?; // 0x5c

        Ok((
            i,
            Packet::Beat(BeatPacket {
                name,
                device_number,
                next_beat_ms,
                second_beat_ms,
                next_bar_ms,
                fourth_beat_ms,
                second_bar_ms,
                eighth_beat_ms,
                pitch,
                bpm_raw,
                beat_within_bar,
            }),
        ))
    }

    pub fn tempo(&self) -> f64 {
        self.bpm_raw as f64 / 100.0
    }

    pub fn effective_tempo(&self) -> f64 {
        self.tempo() * pitch_multiplier(self.pitch)
    }
}

/// A request for details about the media mounted in a player's slot.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaQuery {
    pub name: String,
    pub device_number: u8,
    pub source_ip: [u8; 4],
    pub target_player: u8,
    pub slot: u8,
}

impl MediaQuery {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, name) = packet_preamble(i)?;
        let (i, device_number) = be_u8(i)?; // 0x21
        let (i, _) = take(2usize)(i)?;
        let (i, source_ip) = ip_addr(i)?; // 0x24
        let (i, _) = take(3usize)(i)?;
        let (i, target_player) = be_u8(i)?; // 0x2b
        let (i, _) = take(3usize)(i)?;
        let (i, slot) = be_u8(i)?; // 0x2f

        Ok((
            i,
            Packet::MediaQuery(MediaQuery {
                name,
                device_number,
                source_ip,
                target_player,
                slot,
            }),
        ))
    }
}

/// A player's answer to a media query.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaDetails {
    pub name: String,
    pub device_number: u8,
    pub slot: u8,
    pub media_name: String,
    pub creation_date: String,
    pub track_count: u16,
    pub playlist_count: u16,
    pub total_size: u64,
    pub free_space: u64,
}

impl MediaDetails {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, name) = packet_preamble(i)?;
        let (i, device_number) = be_u8(i)?; // 0x21
        let (i, _) = take(9usize)(i)?;
        let (i, slot) = be_u8(i)?; // 0x2b
        let (i, media_name) = utf16_field(64)(i)?; // 0x2c
        let (i, creation_date) = utf16_field(24)(i)?; // 0x6c
        let (i, _) = take(0x22usize)(i)?;
        let (i, track_count) = be_u16(i)?; // 0xa6
        let (i, _) = take(6usize)(i)?;
        let (i, playlist_count) = be_u16(i)?; // 0xae
        let (i, total_size) = be_u64(i)?; // 0xb0
        let (i, free_space) = be_u64(i)?; // 0xb8

        Ok((
            i,
            Packet::MediaResponse(MediaDetails {
                name,
                device_number,
                slot,
                media_name,
                creation_date,
                track_count,
                playlist_count,
                total_size,
                free_space,
            }),
        ))
    }

    pub fn slot(&self) -> Option<TrackSourceSlot> {
        TrackSourceSlot::from_u8(self.slot)
    }
}

/// A command telling a player to load a track.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadTrack {
    pub name: String,
    pub device_number: u8,
    pub source_player: u8,
    pub source_slot: u8,
    pub source_type: u8,
    pub rekordbox_id: u32,
}

impl LoadTrack {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, name) = packet_preamble(i)?;
        let (i, device_number) = be_u8(i)?; // 0x21
        let (i, _) = take(6usize)(i)?;
        let (i, source_player) = be_u8(i)?; // 0x28
        let (i, source_slot) = be_u8(i)?;
        let (i, source_type) = be_u8(i)?;
        let (i, _) = take(1usize)(i)?;
        let (i, rekordbox_id) = be_u32(i)?; // 0x2c

        Ok((
            i,
            Packet::LoadTrack(LoadTrack {
                name,
                device_number,
                source_player,
                source_slot,
                source_type,
                rekordbox_id,
            }),
        ))
    }
}

/// Acknowledgment a player sends after accepting a load-track command.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadTrackAck {
    pub name: String,
    pub device_number: u8,
}

impl LoadTrackAck {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, name) = packet_preamble(i)?;
        let (i, device_number) = be_u8(i)?; // 0x21
        Ok((i, Packet::LoadTrackAck(LoadTrackAck { name, device_number })))
    }
}

/// Sync mode control, or an instruction to become tempo master.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncControl {
    pub name: String,
    pub device_number: u8,
    pub command: u8,
}

impl SyncControl {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, name) = packet_preamble(i)?;
        let (i, device_number) = be_u8(i)?; // 0x21
        let (i, _) = take(9usize)(i)?;
        let (i, command) = be_u8(i)?; // 0x2b

        Ok((
            i,
            Packet::SyncControl(SyncControl {
                name,
                device_number,
                command,
            }),
        ))
    }

    pub fn command(&self) -> Option<SyncCommand> {
        SyncCommand::from_u8(self.command)
    }
}

/// Fader start: per-channel start/stop instructions from the mixer.
#[derive(Clone, Debug, PartialEq)]
pub struct FaderStart {
    pub name: String,
    pub device_number: u8,
    /// One byte per channel 1-4: 0 start, 1 stop, 2 leave alone.
    pub channels: [u8; 4],
}

impl FaderStart {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, name) = packet_preamble(i)?;
        let (i, device_number) = be_u8(i)?; // 0x21
        let (i, _) = take(2usize)(i)?;
        let (i, channels) = channel_bytes(i)?; // 0x24

        Ok((
            i,
            Packet::FaderStart(FaderStart {
                name,
                device_number,
                channels,
            }),
        ))
    }

    pub fn start_set(&self) -> HashSet<u8> {
        self.players_with(0)
    }

    pub fn stop_set(&self) -> HashSet<u8> {
        self.players_with(1)
    }

    fn players_with(&self, value: u8) -> HashSet<u8> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, v)| **v == value)
            .map(|(idx, _)| idx as u8 + 1)
            .collect()
    }
}

/// The mixer's report of which channels are audible in its output.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelsOnAir {
    pub name: String,
    pub device_number: u8,
    pub channels: [u8; 4],
}

impl ChannelsOnAir {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, name) = packet_preamble(i)?;
        let (i, device_number) = be_u8(i)?; // 0x21
        let (i, _) = take(2usize)(i)?;
        let (i, channels) = channel_bytes(i)?; // 0x24

        Ok((
            i,
            Packet::ChannelsOnAir(ChannelsOnAir {
                name,
                device_number,
                channels,
            }),
        ))
    }

    pub fn on_air_set(&self) -> HashSet<u8> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0)
            .map(|(idx, _)| idx as u8 + 1)
            .collect()
    }
}

/// A request that the receiving device yield the master role to the sender.
#[derive(Clone, Debug, PartialEq)]
pub struct MasterHandoffRequest {
    pub name: String,
    pub device_number: u8,
}

impl MasterHandoffRequest {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, name) = packet_preamble(i)?;
        let (i, device_number) = be_u8(i)?; // 0x21
        Ok((
            i,
            Packet::MasterHandoffRequest(MasterHandoffRequest {
                name,
                device_number,
            }),
        ))
    }
}

/// The yielding device's answer to a handoff request.
#[derive(Clone, Debug, PartialEq)]
pub struct MasterHandoffResponse {
    pub name: String,
    pub device_number: u8,
    pub yielded: bool,
}

impl MasterHandoffResponse {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, name) = packet_preamble(i)?;
        let (i, device_number) = be_u8(i)?; // 0x21
        let (i, _) = take(9usize)(i)?;
        let (i, yielded) = be_u8(i)?; // 0x2b

        Ok((
            i,
            Packet::MasterHandoffResponse(MasterHandoffResponse {
                name,
                device_number,
                yielded: yielded == 0x01,
            }),
        ))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    Announcement(AnnouncementPacket),
    CdjStatus(CdjStatus),
    MixerStatus(MixerStatus),
    Beat(BeatPacket),
    MediaQuery(MediaQuery),
    MediaResponse(MediaDetails),
    LoadTrack(LoadTrack),
    LoadTrackAck(LoadTrackAck),
    SyncControl(SyncControl),
    FaderStart(FaderStart),
    ChannelsOnAir(ChannelsOnAir),
    MasterHandoffRequest(MasterHandoffRequest),
    MasterHandoffResponse(MasterHandoffResponse),
}

impl Packet {
    /// Parse a datagram received on the given port. Packets shorter than
    /// the kind's minimum are rejected; longer ones are accepted with a
    /// warning, never dropped for excess length.
    pub fn parse(data: &[u8], port: u16) -> Result<Packet> {
        let kind = validate_header(data, port).ok_or(VlinkError::UnknownKind)?;
        if data.len() < kind.min_len() {
            return Err(VlinkError::MalformedPacket {
                kind: format!("{:?} shorter than {} bytes", kind, kind.min_len()),
                pos: data.len(),
                dump: pretty_hex(&data),
            });
        }
        if data.len() > kind.min_len() {
            warn!(
                target: "vlink",
                "accepting over-length {:?} packet ({} bytes, expected {})",
                kind,
                data.len(),
                kind.min_len()
            );
        }

        let span = Span::new(data);
        let parsed = match kind {
            PacketType::Announcement => AnnouncementPacket::parse(span),
            PacketType::CdjStatus => CdjStatus::parse(span),
            PacketType::MixerStatus => MixerStatus::parse(span),
            PacketType::Beat => BeatPacket::parse(span),
            PacketType::MediaQuery => MediaQuery::parse(span),
            PacketType::MediaResponse => MediaDetails::parse(span),
            PacketType::LoadTrack => LoadTrack::parse(span),
            PacketType::LoadTrackAck => LoadTrackAck::parse(span),
            PacketType::SyncControl => SyncControl::parse(span),
            PacketType::FaderStart => FaderStart::parse(span),
            PacketType::ChannelsOnAir => ChannelsOnAir::parse(span),
            PacketType::MasterHandoffRequest => MasterHandoffRequest::parse(span),
            PacketType::MasterHandoffResponse => MasterHandoffResponse::parse(span),
        };

        match parsed {
            Ok((_, pkt)) => Ok(pkt),
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
                Err(VlinkError::MalformedPacket {
                    kind: format!("{:?}", e.code),
                    pos: e.input.location_offset(),
                    dump: pretty_hex(&data),
                })
            }
            Err(e) => Err(VlinkError::MalformedPacket {
                kind: format!("{}", e),
                pos: 0,
                dump: pretty_hex(&data),
            }),
        }
    }
}

/// NUL-pad a device name into the 20-byte block of a packet buffer.
fn write_name(buf: &mut [u8], name: &str) {
    let bytes = name.as_bytes();
    buf[..DEVICE_NAME_LENGTH].fill(0);
    buf[..bytes.len()].copy_from_slice(bytes);
}

/// Build a packet for the beat or update port: magic, type byte, 20-byte
/// NUL-padded device name, then the payload.
pub fn assemble(kind: PacketType, name: &str, payload: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; PAYLOAD_OFFSET + payload.len()];
    data[..HEADER.len()].copy_from_slice(HEADER);
    data[TYPE_OFFSET] = kind.protocol_value();
    write_name(&mut data[PACKET_NAME_OFFSET..], name);
    data[PAYLOAD_OFFSET..].copy_from_slice(payload);
    data
}

/// The payload of the status packets we synthesize; patched fields are
/// zero here. The tail marker 0x12345678 closes the portion real players
/// parse.
const STATUS_PAYLOAD: [u8; 181] = [
    0x01, // subtype
    0x04, 0x00, 0x00, 0xf8, 0x00, 0x00, 0x01, 0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x00, 0x00,
    0x01, // 0x020
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xa0, 0x00, 0x00, 0x00, 0x00,
    0x00, // 0x030
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, // 0x040
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, // 0x050
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x04, 0x04, 0x00, 0x00, 0x00,
    0x04, // 0x060
    0x00, 0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x31, 0x2e, 0x34,
    0x33, // 0x070
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x00, 0x00, 0x10, 0x00,
    0x00, // 0x080
    0x80, 0x00, 0x00, 0x00, 0x7f, 0xff, 0xff, 0xff, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, // 0x090
    0x00, 0x00, 0x00, 0x00, 0x01, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, // 0x0a0
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, // 0x0b0
    0x00, 0x10, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0f, 0x01, 0x00,
    0x00, // 0x0c0
    0x12, 0x34, 0x56, 0x78, // 0x0d0
];

/// Everything that varies between the status packets we send.
#[derive(Clone, Copy, Debug)]
pub struct StatusFields {
    pub device_number: u8,
    pub playing: bool,
    pub master: bool,
    pub synced: bool,
    pub on_air: bool,
    pub sync_counter: u32,
    pub tempo: f64,
    /// Raw handoff byte: 0xff when no handoff is in progress.
    pub handoff_target: u8,
    pub beat: u32,
    pub beat_within_bar: u8,
    pub packet_counter: u32,
}

pub fn status_payload(f: &StatusFields) -> [u8; 181] {
    let mut p = STATUS_PAYLOAD;
    p[0x02] = f.device_number;
    p[0x05] = f.device_number;
    p[0x08] = f.playing as u8; // a, playing flag
    p[0x09] = f.device_number; // Dr, the player the track was loaded from
    p[0x5c] = if f.playing { 3 } else { 5 }; // P1
    BigEndian::write_u32(&mut p[0x65..0x69], f.sync_counter);
    p[0x6a] = 0x84 // F, the main status bit vector
        + if f.playing { 0x40 } else { 0 }
        + if f.master { 0x20 } else { 0 }
        + if f.synced { 0x10 } else { 0 }
        + if f.on_air { 0x08 } else { 0 };
    p[0x6c] = if f.playing { 0x7a } else { 0x7e }; // P2
    BigEndian::write_u16(&mut p[0x73..0x75], (f.tempo * 100.0).round() as u16);
    p[0x7e] = if f.playing { 9 } else { 1 }; // P3
    p[0x7f] = f.master as u8; // Mm, tempo master flag
    p[0x80] = f.handoff_target; // Mh, handoff indicator
    BigEndian::write_u32(&mut p[0x81..0x85], f.beat);
    p[0x87] = f.beat_within_bar;
    BigEndian::write_u32(&mut p[0xa9..0xad], f.packet_counter);
    p
}

/// The payload of the beat packets we send; the 0xff block is unused
/// track-position data.
const BEAT_PAYLOAD: [u8; 65] = [
    0x01, // subtype
    0x00, 0x0d, 0x00, 0x3c, 0x01, 0x01, 0x01, 0x01, 0x02, 0x02, 0x02, 0x02, 0x10, 0x10, 0x10,
    0x10, 0x04, 0x04, 0x04, 0x04, 0x20, 0x20, 0x20, 0x20, 0x08, 0x08, 0x08, 0x08, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x0b, 0x00, 0x00, 0x0d,
];

/// Everything that varies between the beat packets we send.
#[derive(Clone, Copy, Debug)]
pub struct BeatFields {
    pub device_number: u8,
    /// Beat interval in milliseconds.
    pub beat_interval: u32,
    /// Bar interval in milliseconds.
    pub bar_interval: u32,
    pub beats_per_bar: u32,
    pub beat_within_bar: u8,
    pub tempo: f64,
}

pub fn beat_payload(f: &BeatFields) -> [u8; 65] {
    let mut p = BEAT_PAYLOAD;
    p[0x02] = f.device_number;
    BigEndian::write_u32(&mut p[0x05..0x09], f.beat_interval);
    BigEndian::write_u32(&mut p[0x09..0x0d], f.beat_interval * 2);
    BigEndian::write_u32(&mut p[0x11..0x15], f.beat_interval * 4);
    BigEndian::write_u32(&mut p[0x19..0x1d], f.beat_interval * 8);
    let beats_left = f.beats_per_bar + 1 - f.beat_within_bar as u32;
    let next_bar = f.beat_interval * beats_left;
    BigEndian::write_u32(&mut p[0x0d..0x11], next_bar);
    BigEndian::write_u32(&mut p[0x15..0x19], next_bar + f.bar_interval);
    BigEndian::write_u16(&mut p[0x3b..0x3d], (f.tempo * 100.0).round() as u16);
    p[0x3d] = f.beat_within_bar;
    p[0x40] = f.device_number;
    p
}

const MEDIA_QUERY_PAYLOAD: [u8; 17] = [
    0x01, 0x00, 0x0d, 0x00, 0x0c, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00,
];

pub fn media_query_payload(
    device_number: u8,
    source_ip: [u8; 4],
    target_player: u8,
    slot: TrackSourceSlot,
) -> [u8; 17] {
    let mut p = MEDIA_QUERY_PAYLOAD;
    p[0x02] = device_number;
    p[0x05..0x09].copy_from_slice(&source_ip);
    p[0x0c] = target_player;
    p[0x10] = slot as u8;
    p
}

const SYNC_CONTROL_PAYLOAD: [u8; 13] = [
    0x01, 0x00, 0x0d, 0x00, 0x08, 0x00, 0x00, 0x00, 0x0d, 0x00, 0x00, 0x00, 0x0f,
];

pub fn sync_control_payload(device_number: u8, command: SyncCommand) -> [u8; 13] {
    let mut p = SYNC_CONTROL_PAYLOAD;
    p[0x02] = device_number;
    p[0x08] = device_number;
    p[0x0c] = command as u8;
    p
}

const FADER_START_PAYLOAD: [u8; 9] = [0x01, 0x00, 0x0d, 0x00, 0x04, 0x02, 0x02, 0x02, 0x02];

/// Build a fader start payload. A player named in both sets is told to
/// stop; player numbers outside 1 to 4 are ignored.
pub fn fader_start_payload(
    device_number: u8,
    start: &HashSet<u8>,
    stop: &HashSet<u8>,
) -> [u8; 9] {
    let mut p = FADER_START_PAYLOAD;
    p[0x02] = device_number;
    for player in 1..=4u8 {
        if start.contains(&player) {
            p[player as usize + 4] = 0;
        }
        if stop.contains(&player) {
            p[player as usize + 4] = 1;
        }
    }
    p
}

const CHANNELS_ON_AIR_PAYLOAD: [u8; 14] = [
    0x01, 0x00, 0x0d, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

pub fn channels_on_air_payload(device_number: u8, on_air: &HashSet<u8>) -> [u8; 14] {
    let mut p = CHANNELS_ON_AIR_PAYLOAD;
    p[0x02] = device_number;
    for player in 1..=4u8 {
        if on_air.contains(&player) {
            p[player as usize + 4] = 1;
        }
    }
    p
}

const LOAD_TRACK_PAYLOAD: [u8; 58] = [
    0x01, 0x00, 0x0d, 0x00, 0x34, 0x0d, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x32, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

pub fn load_track_payload(
    device_number: u8,
    rekordbox_id: u32,
    source_player: u8,
    source_slot: TrackSourceSlot,
    source_type: TrackType,
) -> [u8; 58] {
    let mut p = LOAD_TRACK_PAYLOAD;
    p[0x02] = device_number;
    p[0x05] = device_number;
    p[0x09] = source_player;
    p[0x0a] = source_slot as u8;
    p[0x0b] = source_type as u8;
    BigEndian::write_u32(&mut p[0x0d..0x11], rekordbox_id);
    p
}

const MASTER_HANDOFF_REQUEST_PAYLOAD: [u8; 9] =
    [0x01, 0x00, 0x0d, 0x00, 0x04, 0x00, 0x00, 0x00, 0x0d];

pub fn master_handoff_request_payload(device_number: u8) -> [u8; 9] {
    let mut p = MASTER_HANDOFF_REQUEST_PAYLOAD;
    p[0x02] = device_number;
    p[0x08] = device_number;
    p
}

const MASTER_HANDOFF_RESPONSE_PAYLOAD: [u8; 13] = [
    0x01, 0x00, 0x0d, 0x00, 0x08, 0x00, 0x00, 0x00, 0x0d, 0x00, 0x00, 0x00, 0x01,
];

/// The positive yield acknowledgment we send when handing off the master
/// role to another player.
pub fn master_handoff_response_payload(device_number: u8) -> [u8; 13] {
    let mut p = MASTER_HANDOFF_RESPONSE_PAYLOAD;
    p[0x02] = device_number;
    p[0x08] = device_number;
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announcement_round_trip() {
        let pkt = AnnouncementPacket {
            name: "Virtual Player".to_string(),
            device_number: 3,
            mac_addr: [0x00, 0xe0, 0x36, 0xd2, 0x68, 0xf8],
            ip_addr: [192, 168, 1, 247],
        };
        let data = pkt.to_bytes();
        assert_eq!(data.len(), 0x36);
        assert_eq!(data[DEVICE_NUMBER_OFFSET], 3);
        assert_eq!(&data[IP_OFFSET..IP_OFFSET + 4], &[192, 168, 1, 247]);

        match Packet::parse(&data, ANNOUNCEMENT_PORT).unwrap() {
            Packet::Announcement(parsed) => assert_eq!(parsed, pkt),
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_status_round_trip() {
        let fields = StatusFields {
            device_number: 2,
            playing: true,
            master: true,
            synced: false,
            on_air: true,
            sync_counter: 5,
            tempo: 128.5,
            handoff_target: 0xff,
            beat: 63,
            beat_within_bar: 3,
            packet_counter: 17,
        };
        let data = assemble(
            PacketType::CdjStatus,
            "Virtual Player",
            &status_payload(&fields),
        );
        assert_eq!(data.len(), 212);

        match Packet::parse(&data, UPDATE_PORT).unwrap() {
            Packet::CdjStatus(status) => {
                assert_eq!(status.name, "Virtual Player");
                assert_eq!(status.device_number, 2);
                assert!(status.is_playing());
                assert!(status.is_tempo_master());
                assert!(!status.is_synced());
                assert!(status.is_on_air());
                assert_eq!(status.sync_number, 5);
                assert_eq!(status.tempo(), Some(128.5));
                assert_eq!(status.effective_tempo(), Some(128.5));
                assert_eq!(status.handoff_target, None);
                assert_eq!(status.beat, 63);
                assert_eq!(status.beat_within_bar, 3);
                assert_eq!(status.packet_count, 17);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_status_handoff_byte() {
        let mut fields = StatusFields {
            device_number: 1,
            playing: false,
            master: true,
            synced: false,
            on_air: false,
            sync_counter: 1,
            tempo: 120.0,
            handoff_target: 4,
            beat: 1,
            beat_within_bar: 1,
            packet_counter: 1,
        };
        let data = assemble(PacketType::CdjStatus, "a", &status_payload(&fields));
        match Packet::parse(&data, UPDATE_PORT).unwrap() {
            Packet::CdjStatus(status) => assert_eq!(status.handoff_target, Some(4)),
            other => panic!("unexpected packet {:?}", other),
        }

        fields.handoff_target = 0xff;
        let data = assemble(PacketType::CdjStatus, "a", &status_payload(&fields));
        match Packet::parse(&data, UPDATE_PORT).unwrap() {
            Packet::CdjStatus(status) => assert_eq!(status.handoff_target, None),
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_beat_round_trip() {
        let fields = BeatFields {
            device_number: 4,
            beat_interval: 500,
            bar_interval: 2000,
            beats_per_bar: 4,
            beat_within_bar: 2,
            tempo: 120.0,
        };
        let data = assemble(PacketType::Beat, "Virtual Player", &beat_payload(&fields));
        assert_eq!(data.len(), 96);

        match Packet::parse(&data, BEAT_PORT).unwrap() {
            Packet::Beat(beat) => {
                assert_eq!(beat.device_number, 4);
                assert_eq!(beat.next_beat_ms, 500);
                assert_eq!(beat.second_beat_ms, 1000);
                assert_eq!(beat.next_bar_ms, 1500); // three beats to the bar line
                assert_eq!(beat.fourth_beat_ms, 2000);
                assert_eq!(beat.second_bar_ms, 3500);
                assert_eq!(beat.eighth_beat_ms, 4000);
                assert_eq!(beat.tempo(), 120.0);
                assert_eq!(beat.effective_tempo(), 120.0);
                assert_eq!(beat.beat_within_bar, 2);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_load_track_round_trip() {
        let payload = load_track_payload(2, 0x1234, 3, TrackSourceSlot::UsbSlot, TrackType::Rekordbox);
        let data = assemble(PacketType::LoadTrack, "Virtual Player", &payload);

        match Packet::parse(&data, UPDATE_PORT).unwrap() {
            Packet::LoadTrack(cmd) => {
                assert_eq!(cmd.device_number, 2);
                assert_eq!(cmd.source_player, 3);
                assert_eq!(cmd.source_slot, TrackSourceSlot::UsbSlot as u8);
                assert_eq!(cmd.source_type, TrackType::Rekordbox as u8);
                assert_eq!(cmd.rekordbox_id, 0x1234);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_fader_start_stop_wins() {
        let start: HashSet<u8> = [1, 3].into_iter().collect();
        let stop: HashSet<u8> = [2, 3].into_iter().collect();
        let payload = fader_start_payload(5, &start, &stop);
        assert_eq!(&payload[5..9], &[0, 1, 1, 2]);

        let data = assemble(PacketType::FaderStart, "Virtual Player", &payload);
        match Packet::parse(&data, BEAT_PORT).unwrap() {
            Packet::FaderStart(cmd) => {
                assert_eq!(cmd.start_set(), [1].into_iter().collect());
                assert_eq!(cmd.stop_set(), [2, 3].into_iter().collect());
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_fader_start_ignores_out_of_range_players() {
        let start: HashSet<u8> = [0, 1, 9].into_iter().collect();
        let stop: HashSet<u8> = [200].into_iter().collect();
        let payload = fader_start_payload(5, &start, &stop);
        assert_eq!(&payload[5..9], &[0, 2, 2, 2]);
    }

    #[test]
    fn test_channels_on_air_round_trip() {
        let on: HashSet<u8> = [2, 4].into_iter().collect();
        let payload = channels_on_air_payload(1, &on);
        assert_eq!(&payload[5..9], &[0, 1, 0, 1]);

        let data = assemble(PacketType::ChannelsOnAir, "Mixer", &payload);
        match Packet::parse(&data, BEAT_PORT).unwrap() {
            Packet::ChannelsOnAir(cmd) => assert_eq!(cmd.on_air_set(), on),
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_sync_control_commands() {
        for (command, value) in [
            (SyncCommand::SyncOn, 0x10),
            (SyncCommand::SyncOff, 0x20),
            (SyncCommand::BecomeMaster, 0x01),
        ] {
            let payload = sync_control_payload(2, command);
            assert_eq!(payload[0x0c], value);
            let data = assemble(PacketType::SyncControl, "Virtual Player", &payload);
            match Packet::parse(&data, BEAT_PORT).unwrap() {
                Packet::SyncControl(cmd) => {
                    assert_eq!(cmd.device_number, 2);
                    assert_eq!(cmd.command(), Some(command));
                }
                other => panic!("unexpected packet {:?}", other),
            }
        }
    }

    #[test]
    fn test_master_handoff_round_trip() {
        let data = assemble(
            PacketType::MasterHandoffRequest,
            "Virtual Player",
            &master_handoff_request_payload(3),
        );
        match Packet::parse(&data, BEAT_PORT).unwrap() {
            Packet::MasterHandoffRequest(req) => assert_eq!(req.device_number, 3),
            other => panic!("unexpected packet {:?}", other),
        }

        let data = assemble(
            PacketType::MasterHandoffResponse,
            "Virtual Player",
            &master_handoff_response_payload(3),
        );
        match Packet::parse(&data, BEAT_PORT).unwrap() {
            Packet::MasterHandoffResponse(resp) => {
                assert_eq!(resp.device_number, 3);
                assert!(resp.yielded);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_media_query_payload() {
        let payload = media_query_payload(4, [10, 0, 0, 7], 2, TrackSourceSlot::SdSlot);
        assert_eq!(payload[0x02], 4);
        assert_eq!(&payload[0x05..0x09], &[10, 0, 0, 7]);
        assert_eq!(payload[0x0c], 2);
        assert_eq!(payload[0x10], TrackSourceSlot::SdSlot as u8);

        let data = assemble(PacketType::MediaQuery, "Virtual Player", &payload);
        match Packet::parse(&data, UPDATE_PORT).unwrap() {
            Packet::MediaQuery(query) => {
                assert_eq!(query.device_number, 4);
                assert_eq!(query.source_ip, [10, 0, 0, 7]);
                assert_eq!(query.target_player, 2);
                assert_eq!(query.slot, TrackSourceSlot::SdSlot as u8);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unknown_magic() {
        let mut data = assemble(PacketType::CdjStatus, "x", &[0u8; 181]);
        data[0] = 0x00;
        assert!(matches!(
            Packet::parse(&data, UPDATE_PORT),
            Err(VlinkError::UnknownKind)
        ));
    }

    #[test]
    fn test_rejects_wrong_port() {
        let data = assemble(PacketType::CdjStatus, "x", &[0u8; 181]);
        assert!(matches!(
            Packet::parse(&data, BEAT_PORT),
            Err(VlinkError::UnknownKind)
        ));
    }

    #[test]
    fn test_rejects_too_short_status() {
        let data = assemble(PacketType::CdjStatus, "x", &[0u8; 100]);
        assert!(matches!(
            Packet::parse(&data, UPDATE_PORT),
            Err(VlinkError::MalformedPacket { .. })
        ));
    }

    #[test]
    fn test_accepts_over_length_status() {
        let mut payload = vec![0u8; 400];
        payload[..181].copy_from_slice(&status_payload(&StatusFields {
            device_number: 2,
            playing: false,
            master: false,
            synced: true,
            on_air: false,
            sync_counter: 1,
            tempo: 120.0,
            handoff_target: 0xff,
            beat: 1,
            beat_within_bar: 1,
            packet_counter: 1,
        }));
        let data = assemble(PacketType::CdjStatus, "CDJ-3000", &payload);
        match Packet::parse(&data, UPDATE_PORT).unwrap() {
            Packet::CdjStatus(status) => {
                assert_eq!(status.device_number, 2);
                assert!(status.is_synced());
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_no_track_tempo_is_none() {
        let mut payload = status_payload(&StatusFields {
            device_number: 2,
            playing: false,
            master: false,
            synced: false,
            on_air: false,
            sync_counter: 1,
            tempo: 120.0,
            handoff_target: 0xff,
            beat: 1,
            beat_within_bar: 1,
            packet_counter: 1,
        });
        payload[0x73] = 0xff;
        payload[0x74] = 0xff;
        let data = assemble(PacketType::CdjStatus, "x", &payload);
        match Packet::parse(&data, UPDATE_PORT).unwrap() {
            Packet::CdjStatus(status) => {
                assert_eq!(status.tempo(), None);
                assert_eq!(status.effective_tempo(), None);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_pitch_multiplier() {
        assert_eq!(pitch_multiplier(0x100000), 1.0);
        assert_eq!(pitch_multiplier(0x000000), 0.0);
        assert_eq!(pitch_multiplier(0x200000), 2.0);
    }
}
