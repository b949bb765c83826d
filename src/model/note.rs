use crate::model::time::midi_to_note_name;
use serde::{Deserialize, Serialize};

/// Velocity clamped into `0..=1`. NaN is silent.
pub fn clamp_velocity(velocity: f64) -> f64 {
    if velocity.is_nan() {
        0.0
    } else {
        velocity.clamp(0.0, 1.0)
    }
}

/// An editable note as the editor stores it. Fields are deliberately loose: imported or
/// hand-edited data may carry out-of-range values, and everything downstream clamps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NoteEvent {
    pub id: String,
    pub midi: i32,
    /// Display name such as "C4". May be empty or stale.
    #[serde(default)]
    pub pitch: String,
    /// Start position in beats.
    pub time: f64,
    /// Length in beats.
    pub duration: f64,
    pub velocity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
}

impl NoteEvent {
    pub fn new(id: impl Into<String>, midi: i32, time: f64, duration: f64, velocity: f64) -> Self {
        Self {
            id: id.into(),
            midi,
            pitch: midi_to_note_name(midi),
            time,
            duration,
            velocity,
            channel: None,
        }
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = Some(channel);
        self
    }

    /// The stored pitch name, or one derived from `midi` when it's empty.
    pub fn pitch_name(&self) -> String {
        if self.pitch.is_empty() {
            midi_to_note_name(self.midi)
        } else {
            self.pitch.clone()
        }
    }

    pub fn end(&self) -> f64 {
        self.time + self.duration
    }
}

/// A note projected onto the wall clock, ready to hand to an engine.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEvent {
    pub id: String,
    pub midi: i32,
    pub pitch: String,
    pub time_seconds: f64,
    pub duration_seconds: f64,
    pub velocity: f64,
}

impl ScheduledEvent {
    pub fn end_seconds(&self) -> f64 {
        self.time_seconds + self.duration_seconds
    }

    /// MIDI key number usable as a 7-bit data byte.
    pub fn key(&self) -> u8 {
        self.midi.clamp(0, 127) as u8
    }

    /// Velocity on the 0-127 scale used for live MIDI output.
    pub fn velocity_byte(&self) -> u8 {
        (self.velocity * 127.0).round().clamp(0.0, 127.0) as u8
    }
}
