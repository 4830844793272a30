use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Monotonic epoch shared by every metronome in the process, so that start
/// times can live in plain atomics.
fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Nanoseconds elapsed since the process epoch.
pub(crate) fn now_ns() -> i64 {
    epoch().elapsed().as_nanos() as i64
}

const NS_PER_MS: f64 = 1_000_000.0;

/// A beat clock: counts beats at a configurable tempo from an adjustable
/// start instant. All fields are atomic so the status sender, beat sender,
/// and ingest task can read a consistent-enough timeline without locking;
/// the tempo is stored as the bit pattern of an `f64`.
#[derive(Debug)]
pub struct Metronome {
    /// Start of beat one, in nanoseconds relative to the process epoch.
    start: AtomicI64,
    /// Tempo in BPM, as `f64` bits.
    tempo: AtomicU64,
    beats_per_bar: AtomicU32,
}

pub const DEFAULT_TEMPO: f64 = 120.0;
pub const DEFAULT_BEATS_PER_BAR: u32 = 4;

impl Metronome {
    pub fn new() -> Metronome {
        Metronome {
            start: AtomicI64::new(now_ns()),
            tempo: AtomicU64::new(DEFAULT_TEMPO.to_bits()),
            beats_per_bar: AtomicU32::new(DEFAULT_BEATS_PER_BAR),
        }
    }

    /// Milliseconds a whole number of beats takes at a tempo.
    pub fn beats_to_ms(beats: u32, tempo: f64) -> f64 {
        beats as f64 * 60_000.0 / tempo
    }

    fn interval_ns(tempo: f64) -> f64 {
        60_000_000_000.0 / tempo
    }

    /// Fractional beat position of `instant` on a timeline starting at
    /// `start` with the given beat interval.
    fn position(instant: i64, start: i64, interval: f64) -> f64 {
        (instant - start) as f64 / interval
    }

    pub fn tempo(&self) -> f64 {
        f64::from_bits(self.tempo.load(Ordering::Acquire))
    }

    /// Change the tempo, keeping the current beat number and phase so the
    /// timeline does not jump. Tempo must be positive.
    pub fn set_tempo(&self, bpm: f64) {
        debug_assert!(bpm > 0.0);
        let instant = now_ns();
        let start = self.start.load(Ordering::Acquire);
        let position = Self::position(instant, start, Self::interval_ns(self.tempo()));
        self.tempo.store(bpm.to_bits(), Ordering::Release);
        let new_start = instant - (position * Self::interval_ns(bpm)).round() as i64;
        self.start.store(new_start, Ordering::Release);
    }

    pub fn beats_per_bar(&self) -> u32 {
        self.beats_per_bar.load(Ordering::Acquire)
    }

    pub fn set_beats_per_bar(&self, beats: u32) {
        debug_assert!(beats > 0);
        self.beats_per_bar.store(beats, Ordering::Release);
    }

    /// The beat interval in milliseconds.
    pub fn beat_interval(&self) -> f64 {
        60_000.0 / self.tempo()
    }

    /// The bar interval in milliseconds.
    pub fn bar_interval(&self) -> f64 {
        self.beat_interval() * self.beats_per_bar() as f64
    }

    /// Start of beat one, nanoseconds relative to the process epoch.
    pub fn start_time(&self) -> i64 {
        self.start.load(Ordering::Acquire)
    }

    /// The current beat number, one-based. Can fall below one if the start
    /// has been adjusted into the future; callers that care must correct.
    pub fn beat(&self) -> i64 {
        self.snapshot().beat()
    }

    /// How far we are into the current beat, in the range [0, 1).
    pub fn beat_phase(&self) -> f64 {
        self.snapshot().beat_phase()
    }

    /// Relocate the start so that the specified beat is beginning right now.
    pub fn jump_to_beat(&self, beat: i64) {
        let interval = Self::interval_ns(self.tempo());
        let start = now_ns() - ((beat - 1) as f64 * interval).round() as i64;
        self.start.store(start, Ordering::Release);
    }

    /// Shift the start so the current phase becomes `phase`, moving by no
    /// more than half a beat in either direction; the beat number may
    /// change by one when snapping forward across a boundary.
    pub fn set_beat_phase(&self, phase: f64) {
        let instant = now_ns();
        let interval = Self::interval_ns(self.tempo());
        let start = self.start.load(Ordering::Acquire);
        let position = Self::position(instant, start, interval);
        let delta = phase - (position - position.floor());
        let shift = delta - delta.round();
        self.start
            .store(start - (shift * interval).round() as i64, Ordering::Release);
    }

    /// Slide the whole timeline by `ms` (positive values delay every beat).
    pub fn adjust_start(&self, ms: i64) {
        self.start
            .fetch_add(ms * NS_PER_MS as i64, Ordering::AcqRel);
    }

    /// The instant (epoch-relative nanoseconds) at which the given beat
    /// falls on the current timeline.
    pub fn time_of_beat(&self, beat: i64) -> i64 {
        let interval = Self::interval_ns(self.tempo());
        self.start.load(Ordering::Acquire) + ((beat - 1) as f64 * interval).round() as i64
    }

    /// Capture the timeline state as of now.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_at(now_ns())
    }

    /// Capture the timeline state as of an arbitrary instant.
    pub fn snapshot_at(&self, instant: i64) -> Snapshot {
        let start = self.start.load(Ordering::Acquire);
        let tempo = self.tempo();
        let position = Self::position(instant, start, Self::interval_ns(tempo));
        Snapshot {
            start_time: start,
            tempo,
            beats_per_bar: self.beats_per_bar(),
            instant,
            beat: position.floor() as i64 + 1,
            beat_phase: position - position.floor(),
        }
    }
}

impl Default for Metronome {
    fn default() -> Self {
        Metronome::new()
    }
}

/// An immutable record of a metronome's timeline at one instant, from which
/// all derived values (beat, phase, intervals, distances) can be read
/// without racing the live clock.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Snapshot {
    start_time: i64,
    tempo: f64,
    beats_per_bar: u32,
    instant: i64,
    beat: i64,
    beat_phase: f64,
}

impl Snapshot {
    /// The instant this snapshot describes, nanoseconds past the epoch.
    pub fn instant(&self) -> i64 {
        self.instant
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    pub fn beats_per_bar(&self) -> u32 {
        self.beats_per_bar
    }

    /// One-based beat number at the snapshot instant.
    pub fn beat(&self) -> i64 {
        self.beat
    }

    /// Where the beat falls in its bar, 1 through beats-per-bar.
    pub fn beat_within_bar(&self) -> u32 {
        ((self.beat - 1).rem_euclid(self.beats_per_bar as i64)) as u32 + 1
    }

    /// Fraction of the way through the current beat, [0, 1).
    pub fn beat_phase(&self) -> f64 {
        self.beat_phase
    }

    /// The beat interval in milliseconds.
    pub fn beat_interval(&self) -> f64 {
        60_000.0 / self.tempo
    }

    /// The bar interval in milliseconds.
    pub fn bar_interval(&self) -> f64 {
        self.beat_interval() * self.beats_per_bar as f64
    }

    /// Milliseconds until the next beat begins.
    pub fn time_until_next_beat(&self) -> f64 {
        (1.0 - self.beat_phase) * self.beat_interval()
    }

    /// Milliseconds until the next bar begins.
    pub fn time_until_next_bar(&self) -> f64 {
        let beats_left = self.beats_per_bar - self.beat_within_bar() + 1;
        (beats_left as f64 - self.beat_phase) * self.beat_interval()
    }

    /// Signed distance in milliseconds from the nearest beat: negative when
    /// the nearest beat is still coming up, positive once it has passed.
    pub fn distance_from_beat(&self) -> f64 {
        if self.beat_phase <= 0.5 {
            self.beat_phase * self.beat_interval()
        } else {
            (self.beat_phase - 1.0) * self.beat_interval()
        }
    }
}
