use crate::engine::context::{AudioContext, AudioHost, Destination, VoiceId};
use crate::engine::scheduler::schedule_end;
use crate::engine::timer::{Job, Timer, TimerPlan, seconds_to_duration};
use crate::engine::voice::{Source, Waveform};
use crate::engine::{AudioEngine, EngineKind, LEAD_IN_SECONDS, PlaybackOptions};
use crate::error::{Error, Result};
use crate::model::note::{ScheduledEvent, clamp_velocity};
use crate::model::time::{DEFAULT_TEMPO_BPM, note_name_to_frequency};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Polyphonic oscillator voice. Every slot in the schedule gets its own voice while it sounds.
pub struct PolySynth {
    destination: Arc<dyn Destination>,
    waveform: Waveform,
    next_voice: AtomicU64,
    voices: Mutex<HashMap<usize, VoiceId>>,
}

impl PolySynth {
    pub fn new(destination: Arc<dyn Destination>, waveform: Waveform) -> Self {
        Self {
            destination,
            waveform,
            next_voice: AtomicU64::new(1),
            voices: Mutex::new(HashMap::new()),
        }
    }

    pub fn trigger_attack(&self, slot: usize, pitch: &str, velocity: f64) {
        let voice = self.next_voice.fetch_add(1, Ordering::Relaxed);
        let source = Source::Oscillator {
            waveform: self.waveform,
            frequency: note_name_to_frequency(pitch),
        };

        let previous = match self.voices.lock() {
            Ok(mut voices) => voices.insert(slot, voice),
            Err(_) => None,
        };
        if let Some(previous) = previous {
            self.destination.stop_voice(previous);
        }

        self.destination
            .start_voice(voice, source, clamp_velocity(velocity) as f32);
    }

    pub fn trigger_release(&self, slot: usize) {
        let voice = match self.voices.lock() {
            Ok(mut voices) => voices.remove(&slot),
            Err(_) => None,
        };

        if let Some(voice) = voice {
            self.destination.stop_voice(voice);
        }
    }

    pub fn release_all(&self) {
        let voices: Vec<VoiceId> = match self.voices.lock() {
            Ok(mut voices) => voices.drain().map(|(_, voice)| voice).collect(),
            Err(_) => Vec::new(),
        };

        for voice in voices {
            self.destination.stop_voice(voice);
        }
    }

    pub fn active_voices(&self) -> usize {
        self.voices.lock().map(|v| v.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Stopped,
    Started,
    Paused,
}

/// Transport clock of the tone engine: tempo, loop region and play position.
#[derive(Debug, Clone)]
pub struct Transport {
    pub bpm: f64,
    pub looped: bool,
    /// Seconds; the latest event end of the current schedule.
    pub loop_end: f64,
    state: TransportState,
    /// Context time at which position zero played.
    started_at: f64,
    /// Position captured by the last pause.
    paused_at: f64,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            bpm: DEFAULT_TEMPO_BPM,
            looped: false,
            loop_end: 1.0,
            state: TransportState::Stopped,
            started_at: 0.0,
            paused_at: 0.0,
        }
    }
}

impl Transport {
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Play position in seconds at context time `now`, wrapped into the loop when looping.
    pub fn position(&self, now: f64) -> f64 {
        match self.state {
            TransportState::Stopped => 0.0,
            TransportState::Paused => self.paused_at,
            TransportState::Started => {
                let elapsed = (now - self.started_at).max(0.0);
                if self.looped && self.loop_end > 0.0 {
                    elapsed % self.loop_end
                } else {
                    elapsed
                }
            }
        }
    }

    fn plan(&self, timers: Vec<Timer>, start_offset: f64) -> TimerPlan {
        TimerPlan {
            timers,
            loop_length: self
                .looped
                .then(|| seconds_to_duration(self.loop_end)),
            start_offset: seconds_to_duration(start_offset),
        }
    }
}

struct ToneState {
    context: Option<Arc<AudioContext>>,
    synth: Option<Arc<PolySynth>>,
    transport: Transport,
    timers: Vec<Timer>,
    scheduled_count: usize,
    disposed: bool,
}

/// Synthesized-tone engine: a shared [`PolySynth`] driven by a looping [`Transport`].
pub struct ToneEngine {
    host: Arc<dyn AudioHost>,
    inner: Mutex<ToneState>,
}

impl ToneEngine {
    pub fn new(host: Arc<dyn AudioHost>) -> Self {
        Self {
            host,
            inner: Mutex::new(ToneState {
                context: None,
                synth: None,
                transport: Transport::default(),
                timers: Vec::new(),
                scheduled_count: 0,
                disposed: false,
            }),
        }
    }

    pub fn transport(&self) -> Transport {
        self.inner
            .lock()
            .map(|inner| inner.transport.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ToneState>> {
        self.inner.lock().map_err(|_| Error::Lock("tone engine"))
    }

    fn ensure_ready(&self, inner: &mut ToneState) -> Result<(Arc<AudioContext>, Arc<PolySynth>)> {
        if inner.disposed {
            return Err(Error::Disposed("tone"));
        }

        let context = match &inner.context {
            Some(context) => Arc::clone(context),
            None => {
                let context = Arc::new(AudioContext::open("tone", self.host.as_ref())?);
                inner.context = Some(Arc::clone(&context));
                context
            }
        };

        context.resume()?;

        let synth = match &inner.synth {
            Some(synth) => Arc::clone(synth),
            None => {
                debug!("Building tone engine poly synth..!");
                let synth = Arc::new(PolySynth::new(
                    Arc::clone(context.destination()),
                    Waveform::Triangle,
                ));
                inner.synth = Some(Arc::clone(&synth));
                synth
            }
        };

        Ok((context, synth))
    }

    fn halt(inner: &mut ToneState) -> Result<()> {
        if let Some(context) = &inner.context {
            context.cancel_scheduled()?;
        }
        if let Some(synth) = &inner.synth {
            synth.release_all();
        }
        Ok(())
    }
}

fn build_timers(events: &[ScheduledEvent], synth: &Arc<PolySynth>) -> Vec<Timer> {
    let mut timers = Vec::with_capacity(events.len() * 2);

    for (slot, event) in events.iter().enumerate() {
        let on_synth = Arc::clone(synth);
        let pitch = event.pitch.clone();
        let velocity = event.velocity;
        let note_on: Job = Arc::new(move || on_synth.trigger_attack(slot, &pitch, velocity));

        let off_synth = Arc::clone(synth);
        let note_off: Job = Arc::new(move || off_synth.trigger_release(slot));

        timers.push(Timer::new(event.time_seconds, note_on));
        timers.push(Timer::new(event.end_seconds(), note_off));
    }

    timers
}

impl AudioEngine for ToneEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Tone
    }

    fn init(&self, _options: &PlaybackOptions) -> Result<()> {
        let mut inner = self.lock()?;
        self.ensure_ready(&mut inner).map(|_| ())
    }

    fn play(&self, events: &[ScheduledEvent], options: &PlaybackOptions) -> Result<()> {
        let mut inner = self.lock()?;
        Self::halt(&mut inner)?;
        inner.scheduled_count = 0;
        inner.transport.state = TransportState::Stopped;

        let (context, synth) = self.ensure_ready(&mut inner)?;

        let max_end = schedule_end(events);
        let timers = build_timers(events, &synth);

        inner.transport.bpm = options.tempo.unwrap_or(DEFAULT_TEMPO_BPM);
        inner.transport.looped = options.looped;
        inner.transport.loop_end = if max_end > 0.0 { max_end } else { 1.0 };

        let start_at = context.current_time() + LEAD_IN_SECONDS;
        let plan = inner.transport.plan(timers.clone(), 0.0);
        context.schedule_plan(start_at, plan)?;

        inner.transport.state = TransportState::Started;
        inner.transport.started_at = start_at;
        inner.timers = timers;
        inner.scheduled_count = events.len();

        info!(
            "Tone engine scheduled {} event(s) | loop: {} | loop end: {:.3}s..!",
            events.len(),
            inner.transport.looped,
            inner.transport.loop_end
        );

        Ok(())
    }

    fn pause(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.transport.state != TransportState::Started {
            return Ok(());
        }

        let now = inner
            .context
            .as_ref()
            .map(|context| context.current_time())
            .unwrap_or(0.0);
        let position = inner.transport.position(now);

        Self::halt(&mut inner)?;
        inner.transport.paused_at = position;
        inner.transport.state = TransportState::Paused;

        debug!("Tone transport paused at {:.3}s..!", position);
        Ok(())
    }

    fn resume(&self) -> Result<Option<f64>> {
        let mut inner = self.lock()?;
        if inner.transport.state != TransportState::Paused {
            return Ok(None);
        }

        let (context, _) = self.ensure_ready(&mut inner)?;
        let position = inner.transport.paused_at;
        let start_at = context.current_time() + LEAD_IN_SECONDS;

        let plan = inner.transport.plan(inner.timers.clone(), position);
        context.schedule_plan(start_at, plan)?;

        inner.transport.state = TransportState::Started;
        inner.transport.started_at = start_at - position;

        debug!("Tone transport resumed from {:.3}s..!", position);
        Ok(Some(position))
    }

    fn stop(&self) -> Result<()> {
        let mut inner = self.lock()?;
        Self::halt(&mut inner)?;

        inner.transport.state = TransportState::Stopped;
        inner.transport.paused_at = 0.0;
        inner.timers.clear();
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
            Ok(inner) => {
                inner.transport.state == TransportState::Started
                    && inner.context.as_ref().is_some_and(|c| c.has_pending())
            }
            Err(_) => false,
        }
    }

    fn dispose(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.disposed {
            return Ok(());
        }

        Self::halt(&mut inner)?;
        inner.timers.clear();
        inner.scheduled_count = 0;
        inner.transport.state = TransportState::Stopped;
        inner.synth = None;

        if let Some(context) = inner.context.take() {
            context.close()?;
        }

        inner.disposed = true;
        debug!("Tone engine disposed..!");
        Ok(())
    }
}
