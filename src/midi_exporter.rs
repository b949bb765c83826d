use crate::error::{Error, Result};
use crate::model::note::{NoteEvent, clamp_velocity};
use crate::model::time::safe_tempo;
use log::{debug, info};
use midly::num::{u4, u7, u15, u24, u28};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::fs;
use std::path::Path;

pub const EXPORT_TICKS_PER_BEAT: u16 = 128;
const MICROSECONDS_PER_MINUTE: f64 = 60_000_000.0;
const MAX_TEMPO_MICROSECONDS: u32 = 0x00FF_FFFF;
const MAX_DELTA_TICKS: u64 = 0x0FFF_FFFF;

struct AbsoluteEvent {
    tick: u64,
    /// Note-offs sort ahead of note-ons on the same tick.
    order: u8,
    kind: TrackEventKind<'static>,
}

fn beats_to_ticks(beats: f64) -> u64 {
    let ticks = (beats * EXPORT_TICKS_PER_BEAT as f64).round();
    if ticks.is_finite() && ticks > 1.0 {
        ticks as u64
    } else {
        1
    }
}

/// Velocity on the 0-100 scale stored by exported files.
pub fn export_velocity_percent(velocity: f64) -> u8 {
    (clamp_velocity(velocity) * 100.0).round() as u8
}

fn percent_to_byte(percent: u8) -> u8 {
    ((percent as f64 * 127.0 / 100.0).round() as u8).min(127)
}

fn tempo_microseconds(tempo_bpm: f64) -> u32 {
    (MICROSECONDS_PER_MINUTE / safe_tempo(tempo_bpm))
        .round()
        .min(MAX_TEMPO_MICROSECONDS as f64) as u32
}

/// Encodes `notes` as a single-track Standard MIDI File at 128 ticks per beat, with one tempo
/// event up front. Every start and length is at least one tick.
pub fn export_notes_to_midi(notes: &[NoteEvent], tempo_bpm: f64) -> Result<Vec<u8>> {
    let mut sorted: Vec<&NoteEvent> = notes.iter().collect();
    sorted.sort_by(|a, b| a.time.total_cmp(&b.time).then_with(|| a.midi.cmp(&b.midi)));

    let channel = u4::new(0);
    let mut absolute: Vec<AbsoluteEvent> = Vec::with_capacity(sorted.len() * 2);

    for note in sorted {
        let start = beats_to_ticks(note.time);
        let end = start.saturating_add(beats_to_ticks(note.duration));
        let key = u7::new(note.midi.clamp(0, 127) as u8);
        let vel = u7::new(percent_to_byte(export_velocity_percent(note.velocity)));

        absolute.push(AbsoluteEvent {
            tick: start,
            order: 1,
            kind: TrackEventKind::Midi {
                channel,
                message: MidiMessage::NoteOn { key, vel },
            },
        });
        absolute.push(AbsoluteEvent {
            tick: end,
            order: 0,
            kind: TrackEventKind::Midi {
                channel,
                message: MidiMessage::NoteOff { key, vel },
            },
        });
    }

    absolute.sort_by_key(|event| (event.tick, event.order));

    let mut track = Vec::with_capacity(absolute.len() + 2);
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(tempo_microseconds(tempo_bpm)))),
    });

    let mut previous_tick = 0u64;
    for event in absolute {
        let delta = event.tick.saturating_sub(previous_tick);
        if delta > MAX_DELTA_TICKS {
            return Err(Error::MidiEncode(format!(
                "gap of {} ticks before tick {} does not fit a delta time",
                delta, event.tick
            )));
        }

        track.push(TrackEvent {
            delta: u28::new(delta as u32),
            kind: event.kind,
        });
        previous_tick = event.tick;
    }

    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    let smf = Smf {
        header: Header::new(
            Format::SingleTrack,
            Timing::Metrical(u15::new(EXPORT_TICKS_PER_BEAT)),
        ),
        tracks: vec![track],
    };

    let mut bytes = Vec::new();
    smf.write_std(&mut bytes)
        .map_err(|e| Error::MidiEncode(e.to_string()))?;

    debug!(
        "Encoded {} note(s) into {} MIDI bytes..!",
        notes.len(),
        bytes.len()
    );

    Ok(bytes)
}

pub fn write_midi_file<P: AsRef<Path>>(path: P, notes: &[NoteEvent], tempo_bpm: f64) -> Result<()> {
    let bytes = export_notes_to_midi(notes, tempo_bpm)?;
    fs::write(path.as_ref(), &bytes)?;
    info!(
        "Exported {} note(s) to {}..!",
        notes.len(),
        path.as_ref().display()
    );
    Ok(())
}
