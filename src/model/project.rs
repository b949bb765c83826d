use crate::error::Result;
use crate::model::note::NoteEvent;
use crate::model::time::{DEFAULT_TEMPO_BPM, midi_to_note_name};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

const DEFAULT_DURATION: f64 = 0.25;
const DEFAULT_TIME: f64 = 0.0;
const DEFAULT_VELOCITY: f64 = 0.8;
const DEFAULT_MIDI: i32 = 60;

/// The persisted `{ notes, tempo }` project document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Project {
    pub notes: Vec<NoteEvent>,
    pub tempo: f64,
}

impl Project {
    pub fn from_json(payload: &Value) -> Self {
        Self {
            notes: project_json_to_notes(payload),
            tempo: project_tempo(payload),
        }
    }

    pub fn to_json(&self) -> Value {
        notes_to_project_json(&self.notes, self.tempo)
    }
}

pub fn notes_to_project_json(notes: &[NoteEvent], tempo: f64) -> Value {
    serde_json::json!({
        "notes": notes,
        "tempo": tempo,
    })
}

/// Reads the note list out of a project payload, defaulting any missing or malformed field and
/// dropping entries that aren't objects. A payload without a `notes` array yields no notes.
pub fn project_json_to_notes(payload: &Value) -> Vec<NoteEvent> {
    let Some(entries) = payload.get("notes").and_then(Value::as_array) else {
        debug!("Project payload has no notes array..!");
        return Vec::new();
    };

    let mut dropped = 0;
    let notes = entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| match entry.as_object() {
            Some(raw) => Some(note_from_object(raw, index)),
            None => {
                dropped += 1;
                None
            }
        })
        .collect();

    if dropped > 0 {
        warn!("Dropped {} non-object project note entr(ies)..!", dropped);
    }

    notes
}

pub fn project_tempo(payload: &Value) -> f64 {
    number_field(payload.as_object(), "tempo").unwrap_or(DEFAULT_TEMPO_BPM)
}

fn note_from_object(raw: &Map<String, Value>, index: usize) -> NoteEvent {
    let midi = number_field(Some(raw), "midi")
        .map(|midi| midi.round() as i32)
        .unwrap_or(DEFAULT_MIDI);

    let id = match raw.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        Some(Value::Bool(id)) => id.to_string(),
        _ => format!("project-note-{}", index),
    };

    let pitch = match raw.get("pitch") {
        Some(Value::String(pitch)) => pitch.clone(),
        _ => midi_to_note_name(midi),
    };

    let channel = number_field(Some(raw), "channel")
        .filter(|ch| (0.0..16.0).contains(ch))
        .map(|ch| ch as u8);

    NoteEvent {
        id,
        midi,
        pitch,
        time: number_field(Some(raw), "time").unwrap_or(DEFAULT_TIME),
        duration: number_field(Some(raw), "duration").unwrap_or(DEFAULT_DURATION),
        velocity: number_field(Some(raw), "velocity").unwrap_or(DEFAULT_VELOCITY),
        channel,
    }
}

/// Numbers, numeric strings and booleans are accepted; anything else counts as missing.
fn number_field(raw: Option<&Map<String, Value>>, key: &str) -> Option<f64> {
    let value = match raw?.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };

    value.filter(|v| v.is_finite())
}

pub fn load_project<P: AsRef<Path>>(path: P) -> Result<Project> {
    let bytes = fs::read(path.as_ref())?;
    let payload: Value = serde_json::from_slice(&bytes)?;
    let project = Project::from_json(&payload);

    debug!(
        "Loaded project '{}' with {} note(s) at {} bpm..!",
        path.as_ref().display(),
        project.notes.len(),
        project.tempo
    );

    Ok(project)
}

pub fn save_project<P: AsRef<Path>>(path: P, notes: &[NoteEvent], tempo: f64) -> Result<()> {
    let payload = notes_to_project_json(notes, tempo);
    fs::write(path.as_ref(), serde_json::to_vec_pretty(&payload)?)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_json() {
        let notes = vec![
            NoteEvent::new("a", 60, 0.0, 0.5, 0.85),
            NoteEvent::new("b", 64, 0.5, 0.5, 0.7).with_channel(3),
        ];

        let payload = notes_to_project_json(&notes, 96.0);
        let project = Project::from_json(&payload);

        assert_eq!(project.tempo, 96.0);
        assert_eq!(project.notes, notes);
    }

    #[test]
    fn defaults_missing_fields() {
        let payload = json!({ "notes": [ {} ] });
        let notes = project_json_to_notes(&payload);

        assert_eq!(notes.len(), 1);
        let note = &notes[0];
        assert_eq!(note.id, "project-note-0");
        assert_eq!(note.midi, 60);
        assert_eq!(note.pitch, "C4");
        assert_eq!(note.time, 0.0);
        assert_eq!(note.duration, 0.25);
        assert_eq!(note.velocity, 0.8);
        assert_eq!(note.channel, None);
    }

    #[test]
    fn tolerates_malformed_fields() {
        let payload = json!({
            "notes": [
                { "id": 7, "midi": "64", "time": "soon", "duration": null, "velocity": true, "pitch": 12 },
            ],
            "tempo": "fast",
        });

        let project = Project::from_json(&payload);
        let note = &project.notes[0];

        assert_eq!(project.tempo, DEFAULT_TEMPO_BPM);
        assert_eq!(note.id, "7");
        assert_eq!(note.midi, 64);
        assert_eq!(note.pitch, "E4");
        assert_eq!(note.time, 0.0);
        assert_eq!(note.duration, 0.25);
        assert_eq!(note.velocity, 1.0);
    }

    #[test]
    fn drops_non_object_entries() {
        let payload = json!({
            "notes": [ 1, "two", null, [3], { "id": "kept", "midi": 70 } ],
        });

        let notes = project_json_to_notes(&payload);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, "kept");
        assert_eq!(notes[0].pitch, "A#4");
    }

    #[test]
    fn non_object_payload_has_no_notes() {
        assert!(project_json_to_notes(&json!(null)).is_empty());
        assert!(project_json_to_notes(&json!([1, 2])).is_empty());
        assert!(project_json_to_notes(&json!({ "notes": "nope" })).is_empty());
        assert_eq!(project_tempo(&json!(42)), DEFAULT_TEMPO_BPM);
    }

    #[test]
    fn saves_and_loads_files() {
        let path = std::env::temp_dir().join(format!("note_roll_project_{}.json", std::process::id()));
        let notes = vec![NoteEvent::new("a", 67, 1.0, 2.0, 0.5)];

        save_project(&path, &notes, 140.0).unwrap();
        let project = load_project(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(project.tempo, 140.0);
        assert_eq!(project.notes, notes);
    }
}
