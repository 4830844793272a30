use byteorder::{ByteOrder, LittleEndian};

/// Per-track table mapping beat numbers to the time at which each beat
/// occurs and where it falls within its bar.
#[derive(Clone, Debug, PartialEq)]
pub struct BeatGrid {
    beat_within_bar: Vec<u8>,
    /// Beat start times in milliseconds from the start of the track.
    time_within_track: Vec<u64>,
}

/// Size of the header preceding the beat records in a raw grid.
const GRID_HEADER: usize = 20;
/// Size of one beat record in a raw grid.
const GRID_RECORD: usize = 16;

impl BeatGrid {
    /// Build a grid from the raw bytes of a beat grid response. Each beat
    /// record carries the beat-within-bar in its first byte and the time in
    /// milliseconds at offset four. Unlike nearly every other number in the
    /// protocol, the beat timings are little-endian.
    pub fn from_raw(data: &[u8]) -> BeatGrid {
        let beat_count = data.len().saturating_sub(GRID_HEADER) / GRID_RECORD;
        let mut beat_within_bar = Vec::with_capacity(beat_count);
        let mut time_within_track = Vec::with_capacity(beat_count);
        for beat in 0..beat_count {
            let base = GRID_HEADER + beat * GRID_RECORD;
            beat_within_bar.push(data[base]);
            time_within_track.push(LittleEndian::read_u32(&data[base + 4..base + 8]) as u64);
        }
        BeatGrid {
            beat_within_bar,
            time_within_track,
        }
    }

    /// Build a grid from parallel arrays, for callers with their own cache
    /// format. Panics if the arrays disagree in length.
    pub fn from_values(beat_within_bar: Vec<u8>, time_within_track: Vec<u64>) -> BeatGrid {
        assert_eq!(beat_within_bar.len(), time_within_track.len());
        BeatGrid {
            beat_within_bar,
            time_within_track,
        }
    }

    pub fn beat_count(&self) -> usize {
        self.time_within_track.len()
    }

    /// The interval between the last two beats, used to keep answering
    /// sensibly when players report beats past the end of the grid while
    /// looping. Zero when the grid is too small to tell.
    fn trailing_interval(&self) -> u64 {
        let n = self.time_within_track.len();
        if n < 2 {
            return 0;
        }
        self.time_within_track[n - 1] - self.time_within_track[n - 2]
    }

    /// The time at which a beat falls within the track, in milliseconds.
    /// Beat zero means we are before the first beat, so the time is zero;
    /// beats past the end of the grid extrapolate at the trailing interval.
    pub fn time_of_beat(&self, beat: usize) -> u64 {
        if beat == 0 || self.time_within_track.is_empty() {
            return 0;
        }
        let count = self.time_within_track.len();
        if beat <= count {
            return self.time_within_track[beat - 1];
        }
        self.time_within_track[count - 1] + (beat - count) as u64 * self.trailing_interval()
    }

    /// The musical count of a beat, 1 through 4, where 1 is the down beat.
    /// Beats past the end of the grid continue the cycle; zero is returned
    /// for beat zero or an empty grid.
    pub fn beat_within_bar(&self, beat: usize) -> u8 {
        if beat == 0 || self.beat_within_bar.is_empty() {
            return 0;
        }
        let count = self.beat_within_bar.len();
        if beat <= count {
            return self.beat_within_bar[beat - 1];
        }
        let last = self.beat_within_bar[count - 1] as usize;
        ((last - 1 + (beat - count)) % 4) as u8 + 1
    }

    /// Find the beat in which a track position falls. Returns the one-based
    /// beat number, or -1 if the position is before the first beat. Times
    /// past the last beat extrapolate at the trailing interval instead of
    /// pinning to the final beat.
    pub fn find_beat_at_time(&self, milliseconds: u64) -> i64 {
        match self.time_within_track.binary_search(&milliseconds) {
            Ok(index) => index as i64 + 1,
            Err(0) => -1,
            Err(insertion) if insertion == self.time_within_track.len() => {
                let last = self.time_within_track[insertion - 1];
                let interval = self.trailing_interval();
                if interval == 0 {
                    insertion as i64
                } else {
                    insertion as i64 + ((milliseconds - last) / interval) as i64
                }
            }
            Err(insertion) => insertion as i64,
        }
    }
}

/// One memory point or loop stored with a track.
#[derive(Clone, Debug, PartialEq)]
pub struct CueEntry {
    /// Position of the cue in milliseconds from the start of the track.
    pub cue_time: u64,
    /// End of the loop in milliseconds, zero when this is not a loop.
    pub loop_time: u64,
    /// Hot cue number, zero for an ordinary memory point.
    pub hot_cue_number: u8,
    pub is_loop: bool,
    pub color: u8,
    pub comment: String,
}

/// The cue entries of a track, ordered by position.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CueList {
    entries: Vec<CueEntry>,
}

impl CueList {
    pub fn new(mut entries: Vec<CueEntry>) -> CueList {
        entries.sort_by_key(|e| e.cue_time);
        CueList { entries }
    }

    pub fn entries(&self) -> &[CueEntry] {
        &self.entries
    }

    /// The latest entry at or before the given track position.
    pub fn entry_before(&self, milliseconds: u64) -> Option<&CueEntry> {
        self.entries
            .iter()
            .take_while(|e| e.cue_time <= milliseconds)
            .last()
    }

    /// The first entry strictly after the given track position.
    pub fn entry_after(&self, milliseconds: u64) -> Option<&CueEntry> {
        self.entries.iter().find(|e| e.cue_time > milliseconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_grid(beats: &[(u8, u32)]) -> Vec<u8> {
        let mut data = vec![0u8; GRID_HEADER];
        for (bar_pos, time) in beats {
            let mut record = [0u8; GRID_RECORD];
            record[0] = *bar_pos;
            LittleEndian::write_u32(&mut record[4..8], *time);
            data.extend_from_slice(&record);
        }
        data
    }

    #[test]
    fn test_from_raw() {
        let grid = BeatGrid::from_raw(&raw_grid(&[(1, 0), (2, 500), (3, 1000), (4, 1500)]));
        assert_eq!(grid.beat_count(), 4);
        assert_eq!(grid.time_of_beat(3), 1000);
        assert_eq!(grid.beat_within_bar(4), 4);
    }

    #[test]
    fn test_empty_grid() {
        let grid = BeatGrid::from_raw(&raw_grid(&[]));
        assert_eq!(grid.beat_count(), 0);
        assert_eq!(grid.time_of_beat(1), 0);
        assert_eq!(grid.beat_within_bar(1), 0);
        assert_eq!(grid.find_beat_at_time(0), -1);
    }

    #[test]
    fn test_find_beat_at_time() {
        let grid = BeatGrid::from_values(vec![1, 2, 3, 4], vec![10, 510, 1010, 1510]);
        assert_eq!(grid.find_beat_at_time(0), -1);
        assert_eq!(grid.find_beat_at_time(10), 1);
        assert_eq!(grid.find_beat_at_time(600), 2);
        assert_eq!(grid.find_beat_at_time(1510), 4);
    }

    #[test]
    fn test_extrapolation_past_last_beat() {
        let grid = BeatGrid::from_values(vec![1, 2, 3, 4], vec![0, 500, 1000, 1500]);
        // A looping player can report positions and beats beyond the grid.
        assert_eq!(grid.find_beat_at_time(2000), 5);
        assert_eq!(grid.find_beat_at_time(3100), 7);
        assert_eq!(grid.time_of_beat(6), 2500);
        assert_eq!(grid.beat_within_bar(5), 1);
        assert_eq!(grid.beat_within_bar(7), 3);
    }

    #[test]
    fn test_single_beat_grid_does_not_extrapolate() {
        let grid = BeatGrid::from_values(vec![1], vec![100]);
        assert_eq!(grid.find_beat_at_time(5000), 1);
        assert_eq!(grid.time_of_beat(3), 100);
    }

    #[test]
    fn test_cue_list_ordering_and_lookup() {
        let list = CueList::new(vec![
            CueEntry {
                cue_time: 4000,
                loop_time: 6000,
                hot_cue_number: 0,
                is_loop: true,
                color: 2,
                comment: "chorus loop".to_string(),
            },
            CueEntry {
                cue_time: 1000,
                loop_time: 0,
                hot_cue_number: 1,
                is_loop: false,
                color: 0,
                comment: String::new(),
            },
        ]);
        assert_eq!(list.entries()[0].cue_time, 1000);
        assert_eq!(list.entry_before(2500).unwrap().hot_cue_number, 1);
        assert!(list.entry_before(500).is_none());
        assert_eq!(list.entry_after(2500).unwrap().cue_time, 4000);
        assert!(list.entry_after(5000).is_none());
    }
}
