#![allow(non_snake_case)]

pub mod engine;
pub mod error;
pub mod midi_exporter;
pub mod midi_importer;
pub mod midi_output;
pub mod model;
pub mod player;
pub mod render;
pub mod util;

pub use engine::context::{AudioHost, HeadlessHost};
pub use engine::sampler::{DEFAULT_INSTRUMENT, DirectoryLoader, SampleLoader};
pub use engine::scheduler::build_scheduled_events;
pub use engine::timer::seconds_to_duration;
pub use engine::voice::Waveform;
pub use engine::{AudioEngine, EngineKind, PlaybackOptions, default_audio_host};
pub use error::{Error, Result};
pub use midi_exporter::*;
pub use midi_importer::*;
pub use midi_output::{MidiAccess, MidiOutputState, default_midi_access, detect_midi_support};
pub use model::config::*;
pub use model::note::*;
pub use model::project::*;
pub use model::time::*;
pub use player::*;
pub use render::*;
pub use util::*;
