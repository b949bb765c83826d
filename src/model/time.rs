/// Tempos below this are floored before any beat/second conversion.
pub const MIN_TEMPO_BPM: f64 = 40.0;
pub const DEFAULT_TEMPO_BPM: f64 = 120.0;

/// Returned for note names that can't be parsed.
pub const FALLBACK_FREQUENCY_HZ: f64 = 440.0;

const PITCH_CLASSES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

pub fn safe_tempo(tempo_bpm: f64) -> f64 {
    // f64::max ignores NaN, so a NaN tempo also lands on the floor.
    tempo_bpm.max(MIN_TEMPO_BPM)
}

/// Length of one beat in seconds at the given tempo.
pub fn beat_seconds(tempo_bpm: f64) -> f64 {
    60.0 / safe_tempo(tempo_bpm)
}

pub fn beats_to_seconds(beats: f64, tempo_bpm: f64) -> f64 {
    beats * beat_seconds(tempo_bpm)
}

pub fn seconds_to_beats(seconds: f64, tempo_bpm: f64) -> f64 {
    seconds / beat_seconds(tempo_bpm)
}

/// Maps a MIDI number to `{PitchClass}{Octave}`, clamping it into `0..=127` first.
pub fn midi_to_note_name(midi: i32) -> String {
    let clamped = midi.clamp(0, 127);
    let pitch_class = PITCH_CLASSES[(clamped % 12) as usize];
    let octave = clamped / 12 - 1;

    format!("{}{}", pitch_class, octave)
}

/// Parses `<A-G>[#]<octave>` where the octave is a single digit, optionally negative.
///
/// Sharps that don't exist in the chromatic table (`E#`, `B#`) resolve to the C of the same
/// octave rather than failing.
pub fn note_name_to_midi(name: &str) -> Option<i32> {
    let mut chars = name.chars().peekable();

    let letter = chars.next().filter(|c| ('A'..='G').contains(c))?;
    let sharp = chars.next_if_eq(&'#').is_some();
    let negative = chars.next_if_eq(&'-').is_some();
    let digit = chars.next()?.to_digit(10)? as i32;

    if chars.next().is_some() {
        return None;
    }

    let octave = if negative { -digit } else { digit };
    let class = if sharp {
        format!("{}#", letter)
    } else {
        letter.to_string()
    };
    let note_index = PITCH_CLASSES
        .iter()
        .position(|&pc| pc == class)
        .unwrap_or(0) as i32;

    Some((octave + 1) * 12 + note_index)
}

/// Equal-tempered frequency with A4 (MIDI 69) at 440 Hz.
pub fn midi_to_frequency(midi: f64) -> f64 {
    440.0 * 2f64.powf((midi - 69.0) / 12.0)
}

pub fn note_name_to_frequency(name: &str) -> f64 {
    note_name_to_midi(name)
        .map(|midi| midi_to_frequency(midi as f64))
        .unwrap_or(FALLBACK_FREQUENCY_HZ)
}

#[cfg(test)]
mod test {
    use super::*;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-6
    }

    #[test]
    fn beats_to_seconds_at_common_tempos() {
        assert!(approx_eq(beats_to_seconds(1.0, 120.0), 0.5));
        assert!(approx_eq(beats_to_seconds(4.0, 60.0), 4.0));
        assert!(approx_eq(beats_to_seconds(0.5, 120.0), 0.25));
    }

    #[test]
    fn tempo_is_floored() {
        assert!(approx_eq(beats_to_seconds(1.0, 0.0), 1.5));
        assert!(approx_eq(beats_to_seconds(1.0, -300.0), 1.5));
        assert!(approx_eq(beats_to_seconds(1.0, f64::NAN), 1.5));
        assert!(approx_eq(beats_to_seconds(1.0, 39.0), beats_to_seconds(1.0, 40.0)));
    }

    #[test]
    fn monotonic_in_beats_and_inverse_in_tempo() {
        for tempo in [40.0, 73.5, 120.0, 200.0, 999.0] {
            let mut last = 0.0;
            for step in 0..64 {
                let seconds = beats_to_seconds(step as f64 * 0.25, tempo);
                assert!(seconds >= last);
                last = seconds;
            }

            let doubled = beats_to_seconds(3.0, tempo * 2.0);
            assert!(approx_eq(doubled * 2.0, beats_to_seconds(3.0, tempo)));
        }
    }

    #[test]
    fn seconds_round_trip_to_beats() {
        let beats = seconds_to_beats(beats_to_seconds(2.75, 96.0), 96.0);
        assert!(approx_eq(beats, 2.75));
    }

    #[test]
    fn note_names_from_midi() {
        assert_eq!(midi_to_note_name(60), "C4");
        assert_eq!(midi_to_note_name(69), "A4");
        assert_eq!(midi_to_note_name(61), "C#4");
        assert_eq!(midi_to_note_name(0), "C-1");
        assert_eq!(midi_to_note_name(127), "G9");
        assert_eq!(midi_to_note_name(200), "G9");
        assert_eq!(midi_to_note_name(-12), "C-1");
    }

    #[test]
    fn note_names_to_midi() {
        assert_eq!(note_name_to_midi("C4"), Some(60));
        assert_eq!(note_name_to_midi("A#3"), Some(58));
        assert_eq!(note_name_to_midi("C-1"), Some(0));
        assert_eq!(note_name_to_midi("E#4"), Some(60));
        assert_eq!(note_name_to_midi("H4"), None);
        assert_eq!(note_name_to_midi("C10"), None);
        assert_eq!(note_name_to_midi(""), None);
        assert_eq!(note_name_to_midi("c4"), None);
    }

    #[test]
    fn frequencies() {
        assert!(approx_eq(note_name_to_frequency("A4"), 440.0));
        assert!(approx_eq(note_name_to_frequency("A5"), 880.0));
        assert!((note_name_to_frequency("C4") - 261.625_565).abs() < 1e-3);
        assert!(approx_eq(midi_to_frequency(57.0), 220.0));
    }

    #[test]
    fn unparseable_names_fall_back() {
        assert_eq!(note_name_to_frequency("invalid"), FALLBACK_FREQUENCY_HZ);
        assert_eq!(note_name_to_frequency(""), FALLBACK_FREQUENCY_HZ);
        assert_eq!(note_name_to_frequency("Bb4"), FALLBACK_FREQUENCY_HZ);
    }
}
