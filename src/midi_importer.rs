use crate::error::{Error, Result};
use crate::model::note::NoteEvent;
use crate::model::time::midi_to_note_name;
use log::{debug, info, warn};
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Used when the header doesn't carry a metrical ticks-per-beat value.
pub const IMPORT_DEFAULT_TICKS_PER_BEAT: u16 = 480;

/// Imported notes never fall below this velocity, so near-silent input stays audible.
const MIN_IMPORT_VELOCITY: f64 = 0.05;
const MICROSECONDS_PER_MINUTE: f64 = 60_000_000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ImportedMidi {
    pub notes: Vec<NoteEvent>,
    /// BPM from the first tempo meta event, if the file has one.
    pub tempo_bpm: Option<f64>,
    pub ticks_per_beat: u16,
    pub track_name: Option<String>,
}

struct PendingNote {
    start_tick: u64,
    velocity: f64,
}

pub fn import_midi_file<P: AsRef<Path>>(path: P) -> Result<ImportedMidi> {
    let bytes = fs::read(path.as_ref()).map_err(|e| {
        Error::MidiParse(format!(
            "failed to read {}: {}",
            path.as_ref().display(),
            e
        ))
    })?;

    let imported = import_midi(&bytes)?;
    info!(
        "Imported {} note(s) from {}..!",
        imported.notes.len(),
        path.as_ref().display()
    );

    Ok(imported)
}

/// Decodes a Standard MIDI File into notes, sorted by start beat then MIDI number.
pub fn parse_midi_bytes(bytes: &[u8]) -> Result<Vec<NoteEvent>> {
    import_midi(bytes).map(|imported| imported.notes)
}

/// Pairs note-ons with the next matching note-off (or zero-velocity note-on) on the same channel
/// and key, track by track. A second note-on before the note-off replaces the pending one, stray
/// note-offs are ignored, and notes still open when their track ends are dropped.
pub fn import_midi(bytes: &[u8]) -> Result<ImportedMidi> {
    let smf = Smf::parse(bytes).map_err(|e| Error::MidiParse(e.to_string()))?;

    let ticks_per_beat = match smf.header.timing {
        Timing::Metrical(t) => t.as_int(),
        Timing::Timecode(fps, subframe) => {
            debug!(
                "SMPTE timing ({:?} fps, {} subframes), assuming {} ticks per beat..!",
                fps, subframe, IMPORT_DEFAULT_TICKS_PER_BEAT
            );
            IMPORT_DEFAULT_TICKS_PER_BEAT
        }
    };
    let tick_scale = ticks_per_beat.max(1) as f64;

    debug!(
        "MIDI format: {:?}, tracks: {}, ticks per beat: {}",
        smf.header.format,
        smf.tracks.len(),
        ticks_per_beat
    );

    let mut notes: Vec<NoteEvent> = Vec::new();
    let mut tempo_bpm: Option<f64> = None;
    let mut track_name: Option<String> = None;

    for (track_idx, track) in smf.tracks.iter().enumerate() {
        let mut abs_tick: u64 = 0;
        let mut pending: HashMap<(u8, u8), PendingNote> = HashMap::new();

        for (event_idx, event) in track.iter().enumerate() {
            abs_tick = abs_tick.saturating_add(event.delta.as_int() as u64);

            match &event.kind {
                TrackEventKind::Meta(MetaMessage::Tempo(micro)) => {
                    if tempo_bpm.is_none() && micro.as_int() > 0 {
                        tempo_bpm = Some(MICROSECONDS_PER_MINUTE / micro.as_int() as f64);
                    }
                }
                TrackEventKind::Meta(MetaMessage::TrackName(name)) => {
                    if track_name.is_none() {
                        track_name = Some(String::from_utf8_lossy(name).into_owned());
                    }
                }
                TrackEventKind::Midi { channel, message } => {
                    let ch = channel.as_int();

                    let key = match message {
                        MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                            pending.insert(
                                (ch, key.as_int()),
                                PendingNote {
                                    start_tick: abs_tick,
                                    velocity: (vel.as_int() as f64 / 127.0)
                                        .max(MIN_IMPORT_VELOCITY),
                                },
                            );
                            continue;
                        }
                        MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                            key.as_int()
                        }
                        _ => continue,
                    };

                    let Some(started) = pending.remove(&(ch, key)) else {
                        warn!(
                            "Orphaned NoteOff for {} ch{} at tick {}..!",
                            key, ch, abs_tick
                        );
                        continue;
                    };

                    let duration_ticks = abs_tick.saturating_sub(started.start_tick).max(1);

                    notes.push(NoteEvent {
                        id: format!("trk-{}-{}-{}", track_idx, event_idx, key),
                        midi: key as i32,
                        pitch: midi_to_note_name(key as i32),
                        time: started.start_tick as f64 / tick_scale,
                        duration: duration_ticks as f64 / tick_scale,
                        velocity: started.velocity,
                        channel: Some(ch),
                    });
                }
                _ => {}
            }
        }

        if !pending.is_empty() {
            warn!(
                "Dropping {} unclosed note(s) at the end of track {}..!",
                pending.len(),
                track_idx
            );
        }
    }

    notes.sort_by(|a, b| a.time.total_cmp(&b.time).then_with(|| a.midi.cmp(&b.midi)));

    Ok(ImportedMidi {
        notes,
        tempo_bpm,
        ticks_per_beat,
        track_name,
    })
}
