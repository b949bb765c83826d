use crate::model::note::{NoteEvent, ScheduledEvent, clamp_velocity};
use crate::model::time::beats_to_seconds;

/// Floor for scheduled note lengths, so malformed notes still sound.
pub const MIN_EVENT_SECONDS: f64 = 0.02;

/// Projects a note list onto the wall clock at `tempo_bpm`.
///
/// The input is never modified and may be in any order. The output is sorted by start time, then
/// by MIDI number; notes that tie on both keep their input order. Every value is normalized
/// instead of rejected: start times are clamped to zero, lengths to [`MIN_EVENT_SECONDS`],
/// velocity into `0..=1`, and an empty pitch name is derived from `midi`.
pub fn build_scheduled_events(notes: &[NoteEvent], tempo_bpm: f64) -> Vec<ScheduledEvent> {
    let mut events: Vec<ScheduledEvent> = notes
        .iter()
        .map(|note| ScheduledEvent {
            id: note.id.clone(),
            midi: note.midi,
            pitch: note.pitch_name(),
            time_seconds: beats_to_seconds(note.time, tempo_bpm).max(0.0),
            duration_seconds: beats_to_seconds(note.duration, tempo_bpm).max(MIN_EVENT_SECONDS),
            velocity: clamp_velocity(note.velocity),
        })
        .collect();

    events.sort_by(|a, b| {
        a.time_seconds
            .total_cmp(&b.time_seconds)
            .then_with(|| a.midi.cmp(&b.midi))
    });

    events
}

/// End of the last scheduled event, in seconds.
pub fn schedule_end(events: &[ScheduledEvent]) -> f64 {
    events
        .iter()
        .map(ScheduledEvent::end_seconds)
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod test {
    use super::*;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9
    }

    fn note(id: &str, midi: i32, time: f64, duration: f64, velocity: f64) -> NoteEvent {
        NoteEvent::new(id, midi, time, duration, velocity)
    }

    #[test]
    fn two_note_phrase_at_120() {
        let notes = vec![
            note("a", 60, 0.0, 0.5, 0.85),
            note("b", 64, 0.5, 0.5, 0.85),
        ];

        let events = build_scheduled_events(&notes, 120.0);
        assert_eq!(events.len(), 2);

        assert_eq!(events[0].id, "a");
        assert!(approx_eq(events[0].time_seconds, 0.0));
        assert!(approx_eq(events[0].duration_seconds, 0.25));

        assert_eq!(events[1].id, "b");
        assert!(approx_eq(events[1].time_seconds, 0.25));
        assert!(approx_eq(events[1].duration_seconds, 0.25));
    }

    #[test]
    fn sorts_unordered_input() {
        let notes = vec![
            note("n2", 64, 1.0, 0.5, 0.8),
            note("n1", 60, 0.0, 0.25, 0.9),
        ];

        let events = build_scheduled_events(&notes, 120.0);
        assert_eq!(events[0].id, "n1");
        assert!(approx_eq(events[0].time_seconds, 0.0));
        assert_eq!(events[1].id, "n2");
        assert!(approx_eq(events[1].time_seconds, 0.5));
        assert!(approx_eq(events[1].duration_seconds, 0.25));
    }

    #[test]
    fn ties_break_on_midi() {
        let notes = vec![
            note("high", 72, 1.0, 1.0, 0.5),
            note("low", 48, 1.0, 1.0, 0.5),
            note("mid", 60, 1.0, 1.0, 0.5),
            note("first", 90, 0.0, 1.0, 0.5),
        ];

        let ids: Vec<String> = build_scheduled_events(&notes, 100.0)
            .into_iter()
            .map(|e| e.id)
            .collect();

        assert_eq!(ids, vec!["first", "low", "mid", "high"]);
    }

    #[test]
    fn negative_times_collapse_to_zero_before_sorting() {
        let notes = vec![
            note("later-negative", 50, -0.5, 1.0, 0.5),
            note("earlier-negative", 70, -1.0, 1.0, 0.5),
        ];

        let events = build_scheduled_events(&notes, 120.0);
        assert!(events.iter().all(|e| e.time_seconds == 0.0));
        assert_eq!(events[0].id, "later-negative");
        assert_eq!(events[1].id, "earlier-negative");
    }

    #[test]
    fn normalizes_invalid_note_values() {
        let mut bad = note("bad", 200, -1.0, 0.0, 3.0);
        bad.pitch.clear();

        let events = build_scheduled_events(&[bad], 100.0);
        let event = &events[0];

        assert_eq!(event.time_seconds, 0.0);
        assert!(event.duration_seconds >= MIN_EVENT_SECONDS);
        assert_eq!(event.velocity, 1.0);
        assert_eq!(event.pitch, "G9");
        assert_eq!(event.midi, 200);

        let nan = note("nan", 60, f64::NAN, f64::NAN, f64::NAN);
        let event = &build_scheduled_events(&[nan], 100.0)[0];
        assert_eq!(event.velocity, 0.0);
        assert_eq!(event.time_seconds, 0.0);
        assert_eq!(event.duration_seconds, MIN_EVENT_SECONDS);
    }

    #[test]
    fn clamps_every_out_of_range_field() {
        let notes = vec![
            note("neg-vel", 60, 2.0, -4.0, -0.5),
            note("zero", 61, -3.0, 0.0, 1.5),
            note("ok", 62, 1.0, 1.0, 0.5),
        ];

        for event in build_scheduled_events(&notes, 40.0) {
            assert!((0.0..=1.0).contains(&event.velocity));
            assert!(event.time_seconds >= 0.0);
            assert!(event.duration_seconds > 0.0);
        }
    }

    #[test]
    fn is_idempotent_and_leaves_input_alone() {
        let notes = vec![
            note("c", 67, 2.0, 0.5, 0.4),
            note("a", 60, 0.0, 1.0, 0.9),
            note("b", 64, 0.0, 1.0, 0.7),
        ];
        let snapshot = notes.clone();

        let first = build_scheduled_events(&notes, 133.0);
        let second = build_scheduled_events(&notes, 133.0);

        assert_eq!(first, second);
        assert_eq!(notes, snapshot);
    }

    #[test]
    fn empty_input() {
        assert!(build_scheduled_events(&[], 120.0).is_empty());
        assert_eq!(schedule_end(&[]), 0.0);
    }

    #[test]
    fn schedule_end_is_latest_release() {
        let notes = vec![
            note("long", 60, 0.0, 8.0, 0.5),
            note("late", 62, 6.0, 1.0, 0.5),
        ];

        let events = build_scheduled_events(&notes, 120.0);
        assert!(approx_eq(schedule_end(&events), 4.0));
    }
}
