use crate::engine::context::{AudioContext, AudioHost, VoiceId};
use crate::engine::timer::{Job, Timer};
use crate::engine::voice::{SampleBuffer, Source};
use crate::engine::{AudioEngine, EngineKind, LEAD_IN_SECONDS, PlaybackOptions};
use crate::error::{Error, Result};
use crate::model::note::{ScheduledEvent, clamp_velocity};
use crate::model::time::note_name_to_midi;
use hound::{SampleFormat, WavReader};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const DEFAULT_INSTRUMENT: &str = "acoustic_grand_piano";

/// A named set of sampled notes, keyed by the MIDI number each was recorded at.
#[derive(Debug, Clone)]
pub struct Instrument {
    pub name: String,
    samples: BTreeMap<u8, Arc<SampleBuffer>>,
}

impl Instrument {
    pub fn new(name: impl Into<String>, samples: BTreeMap<u8, Arc<SampleBuffer>>) -> Self {
        Self {
            name: name.into(),
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The nearest sampled root to `midi` and the playback rate that re-pitches it.
    pub fn sample_for(&self, midi: u8) -> Option<(Arc<SampleBuffer>, f64)> {
        let below = self.samples.range(..=midi).next_back();
        let above = self.samples.range(midi..).next();

        let (&root, buffer) = match (below, above) {
            (Some(b), Some(a)) => {
                if midi - *b.0 <= *a.0 - midi {
                    b
                } else {
                    a
                }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return None,
        };

        let rate = 2f64.powf((midi as f64 - root as f64) / 12.0);
        Some((Arc::clone(buffer), rate))
    }
}

/// Source of instrument sample sets.
pub trait SampleLoader: Send + Sync {
    fn load(&self, instrument: &str) -> Result<Instrument>;
}

/// Loads `<root>/<instrument>/<name>.wav`, where each file stem is a note name ("C4", "F#3") or
/// a MIDI number ("60"). Multi-channel files are folded to mono.
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    root: PathBuf,
}

impl DirectoryLoader {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn load_buffer(path: &Path) -> Result<SampleBuffer> {
        let mut reader = WavReader::open(path)?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
            SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1) as u32)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        let frames = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();

        Ok(SampleBuffer {
            sample_rate: spec.sample_rate,
            frames,
        })
    }
}

fn stem_to_midi(stem: &str) -> Option<u8> {
    let midi = match stem.parse::<i32>() {
        Ok(midi) => midi,
        Err(_) => note_name_to_midi(stem)?,
    };
    u8::try_from(midi).ok().filter(|m| *m <= 127)
}

impl SampleLoader for DirectoryLoader {
    fn load(&self, instrument: &str) -> Result<Instrument> {
        let dir = self.root.join(instrument);
        let entries = fs::read_dir(&dir).map_err(|e| Error::InstrumentLoad {
            name: instrument.to_string(),
            reason: format!("{}: {}", dir.display(), e),
        })?;

        let mut samples = BTreeMap::new();
        for entry in entries {
            let path = entry?.path();
            let is_wav = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));
            if !is_wav {
                continue;
            }

            let Some(midi) = path.file_stem().and_then(|s| s.to_str()).and_then(stem_to_midi)
            else {
                debug!("Skipping unrecognised sample file {}..!", path.display());
                continue;
            };

            match Self::load_buffer(&path) {
                Ok(buffer) => {
                    samples.insert(midi, Arc::new(buffer));
                }
                Err(why) => warn!("Failed to read sample {}: {}", path.display(), why),
            }
        }

        if samples.is_empty() {
            return Err(Error::InstrumentLoad {
                name: instrument.to_string(),
                reason: format!("no readable samples in {}", dir.display()),
            });
        }

        info!(
            "Loaded instrument '{}' with {} sample(s)..!",
            instrument,
            samples.len()
        );

        Ok(Instrument::new(instrument, samples))
    }
}

/// Holds the most recently loaded instrument. Asking for a different name replaces it.
pub struct InstrumentCache {
    loader: Arc<dyn SampleLoader>,
    current: Option<Arc<Instrument>>,
}

impl InstrumentCache {
    pub fn new(loader: Arc<dyn SampleLoader>) -> Self {
        Self {
            loader,
            current: None,
        }
    }

    pub fn current(&self) -> Option<Arc<Instrument>> {
        self.current.clone()
    }

    pub fn get(&mut self, name: &str) -> Result<Arc<Instrument>> {
        if let Some(current) = &self.current {
            if current.name == name {
                return Ok(Arc::clone(current));
            }
        }

        debug!("Loading instrument '{}'..!", name);
        let instrument = Arc::new(self.loader.load(name)?);
        self.current = Some(Arc::clone(&instrument));
        Ok(instrument)
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}

struct SamplerState {
    context: Option<Arc<AudioContext>>,
    cache: InstrumentCache,
    instrument_name: String,
    sounding: Arc<Mutex<HashSet<VoiceId>>>,
    scheduled_count: usize,
    disposed: bool,
}

/// Sample-based instrument engine. Each note is an independent trigger on the engine's own
/// context clock; there is no transport, so pausing is the same as stopping.
pub struct SamplerEngine {
    host: Arc<dyn AudioHost>,
    inner: Mutex<SamplerState>,
}

impl SamplerEngine {
    pub fn new(host: Arc<dyn AudioHost>, loader: Arc<dyn SampleLoader>) -> Self {
        Self {
            host,
            inner: Mutex::new(SamplerState {
                context: None,
                cache: InstrumentCache::new(loader),
                instrument_name: DEFAULT_INSTRUMENT.to_string(),
                sounding: Arc::new(Mutex::new(HashSet::new())),
                scheduled_count: 0,
                disposed: false,
            }),
        }
    }

    pub fn instrument_name(&self) -> String {
        self.inner
            .lock()
            .map(|inner| inner.instrument_name.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SamplerState>> {
        self.inner.lock().map_err(|_| Error::Lock("sampler engine"))
    }

    fn ensure_ready(
        &self,
        inner: &mut SamplerState,
        options: &PlaybackOptions,
    ) -> Result<(Arc<AudioContext>, Arc<Instrument>)> {
        if inner.disposed {
            return Err(Error::Disposed("soundfont"));
        }

        let context = match &inner.context {
            Some(context) => Arc::clone(context),
            None => {
                let context = Arc::new(AudioContext::open("soundfont", self.host.as_ref())?);
                inner.context = Some(Arc::clone(&context));
                context
            }
        };

        context.resume()?;

        if let Some(name) = &options.instrument {
            inner.instrument_name = name.clone();
        }
        let instrument = inner.cache.get(&inner.instrument_name.clone())?;

        Ok((context, instrument))
    }

    fn halt(inner: &mut SamplerState) -> Result<()> {
        if let Some(context) = &inner.context {
            context.cancel_scheduled()?;

            let voices: Vec<VoiceId> = match inner.sounding.lock() {
                Ok(mut sounding) => sounding.drain().collect(),
                Err(_) => Vec::new(),
            };
            for voice in voices {
                context.destination().stop_voice(voice);
            }
        }
        Ok(())
    }
}

fn build_timers(
    events: &[ScheduledEvent],
    context: &Arc<AudioContext>,
    instrument: &Instrument,
    sounding: &Arc<Mutex<HashSet<VoiceId>>>,
) -> Vec<Timer> {
    let mut timers = Vec::with_capacity(events.len() * 2);

    for event in events {
        let midi = note_name_to_midi(&event.pitch)
            .and_then(|m| u8::try_from(m).ok())
            .filter(|m| *m <= 127)
            .unwrap_or_else(|| event.key());

        let Some((buffer, rate)) = instrument.sample_for(midi) else {
            continue;
        };

        let voice = context.next_voice_id();
        let gain = clamp_velocity(event.velocity) as f32;

        let destination = Arc::clone(context.destination());
        let on_sounding = Arc::clone(sounding);
        let note_on: Job = Arc::new(move || {
            if let Ok(mut sounding) = on_sounding.lock() {
                sounding.insert(voice);
            }
            destination.start_voice(
                voice,
                Source::Sample {
                    buffer: Arc::clone(&buffer),
                    rate,
                },
                gain,
            );
        });

        let destination = Arc::clone(context.destination());
        let off_sounding = Arc::clone(sounding);
        let note_off: Job = Arc::new(move || {
            let was_sounding = off_sounding
                .lock()
                .map(|mut sounding| sounding.remove(&voice))
                .unwrap_or(true);
            if was_sounding {
                destination.stop_voice(voice);
            }
        });

        timers.push(Timer::new(event.time_seconds, note_on));
        timers.push(Timer::new(event.end_seconds(), note_off));
    }

    timers
}

impl AudioEngine for SamplerEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Soundfont
    }

    fn init(&self, options: &PlaybackOptions) -> Result<()> {
        let mut inner = self.lock()?;
        self.ensure_ready(&mut inner, options).map(|_| ())
    }

    fn play(&self, events: &[ScheduledEvent], options: &PlaybackOptions) -> Result<()> {
        let mut inner = self.lock()?;
        Self::halt(&mut inner)?;
        inner.scheduled_count = 0;

        let (context, instrument) = self.ensure_ready(&mut inner, options)?;

        let timers = build_timers(events, &context, &instrument, &inner.sounding);
        let start_at = context.current_time() + LEAD_IN_SECONDS;
        context.schedule(start_at, timers)?;

        inner.scheduled_count = events.len();

        info!(
            "Soundfont engine scheduled {} event(s) on '{}'..!",
            events.len(),
            instrument.name
        );

        Ok(())
    }

    fn pause(&self) -> Result<()> {
        // No transport to hold a position, so a pause is a full stop.
        self.stop()
    }

    fn resume(&self) -> Result<Option<f64>> {
        Ok(None)
    }

    fn stop(&self) -> Result<()> {
        let mut inner = self.lock()?;
        Self::halt(&mut inner)?;
        inner.scheduled_count = 0;
        Ok(())
    }

    fn scheduled_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.scheduled_count)
            .unwrap_or(0)
    }

    fn is_playing(&self) -> bool {
        match self.inner.lock() {
            Ok(inner) => inner.context.as_ref().is_some_and(|c| c.has_pending()),
            Err(_) => false,
        }
    }

    fn dispose(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.disposed {
            return Ok(());
        }

        Self::halt(&mut inner)?;
        inner.scheduled_count = 0;
        inner.cache.clear();

        if let Some(context) = inner.context.take() {
            context.close()?;
        }

        inner.disposed = true;
        debug!("Soundfont engine disposed..!");
        Ok(())
    }
}
