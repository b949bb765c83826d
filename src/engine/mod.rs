use crate::error::Result;
use crate::model::note::ScheduledEvent;
use context::AudioHost;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub mod context;
#[cfg(feature = "cpal-output")]
pub mod device;
pub mod sampler;
pub mod scheduler;
pub mod timer;
pub mod tone;
pub mod voice;

/// Every engine starts its first note this far after the call to play.
pub const LEAD_IN_SECONDS: f64 = 0.04;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Tone,
    Soundfont,
}

impl EngineKind {
    pub fn name(&self) -> &'static str {
        match self {
            EngineKind::Tone => "tone",
            EngineKind::Soundfont => "soundfont",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackOptions {
    /// Engine to play on; `None` keeps whichever engine is current.
    pub engine: Option<EngineKind>,
    pub looped: bool,
    /// Sample instrument name, only meaningful to the soundfont engine.
    pub instrument: Option<String>,
    /// Beats per minute; `None` means the default tempo.
    pub tempo: Option<f64>,
}

pub trait AudioEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Acquire the audio context (and whatever else the engine needs) ahead of playback.
    fn init(&self, options: &PlaybackOptions) -> Result<()>;

    /// Stops anything already scheduled, then schedules `events` relative to now.
    fn play(&self, events: &[ScheduledEvent], options: &PlaybackOptions) -> Result<()>;

    fn pause(&self) -> Result<()>;

    /// Continues after a pause. Returns the resumed position in seconds, or `None` when the
    /// engine cannot resume.
    fn resume(&self) -> Result<Option<f64>>;

    fn stop(&self) -> Result<()>;

    fn scheduled_count(&self) -> usize;

    /// Whether any scheduled trigger has yet to fire.
    fn is_playing(&self) -> bool;

    /// Releases the engine's audio resources. Idempotent; the engine is unusable afterwards.
    fn dispose(&self) -> Result<()>;
}

/// The device-backed host when built with `cpal-output`, otherwise a headless host that logs.
pub fn default_audio_host() -> Arc<dyn AudioHost> {
    #[cfg(feature = "cpal-output")]
    {
        Arc::new(device::CpalHost)
    }

    #[cfg(not(feature = "cpal-output"))]
    {
        Arc::new(context::HeadlessHost)
    }
}
