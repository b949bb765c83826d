use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to parse MIDI: {0}")]
    MidiParse(String),

    #[error("Failed to encode MIDI: {0}")]
    MidiEncode(String),

    #[error("Audio output is unavailable: {0}")]
    AudioUnavailable(String),

    #[error("Audio context is closed..!")]
    ContextClosed,

    #[error("Failed to load instrument '{name}': {reason}")]
    InstrumentLoad { name: String, reason: String },

    #[error("Engine '{0}' has been disposed..!")]
    Disposed(&'static str),

    #[error("Invalid render options: {0}")]
    InvalidRenderOptions(String),

    #[error("Failed to encode WAV: {0}")]
    Wav(#[from] hound::Error),

    #[error("Invalid project JSON: {0}")]
    Project(#[from] serde_json::Error),

    #[error("MIDI output error: {0}")]
    MidiOutput(String),

    #[error("Failed to lock {0}..!")]
    Lock(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
