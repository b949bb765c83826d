use crate::engine::EngineKind;
use crate::engine::voice::Waveform;
use log::info;
use std::path::Path;

pub fn parse_engine_kind(s: &str) -> EngineKind {
    match s.to_lowercase().as_str() {
        "t" | "tone" | "synth" => EngineKind::Tone,
        "s" | "sf" | "soundfont" | "sampler" => EngineKind::Soundfont,
        other => {
            info!("Unknown engine '{}', defaulting to `tone`..!", other);
            EngineKind::Tone
        }
    }
}

pub fn parse_waveform(s: &str) -> Waveform {
    match s.to_lowercase().as_str() {
        "sine" => Waveform::Sine,
        "tri" | "triangle" => Waveform::Triangle,
        "saw" | "sawtooth" => Waveform::Sawtooth,
        "square" => Waveform::Square,
        other => {
            info!("Unknown waveform '{}', defaulting to `sawtooth`..!", other);
            Waveform::Sawtooth
        }
    }
}

/// Whether `path` names a Standard MIDI File rather than a project file.
pub fn is_midi_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext.to_lowercase().as_str(), "mid" | "midi" | "smf"))
}
