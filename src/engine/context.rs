use crate::engine::timer::{Timer, TimerPlan, TimerQueue, seconds_to_duration};
use crate::engine::voice::Source;
use crate::error::{Error, Result};
use log::{debug, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub type VoiceId = u64;

/// The sound-producing end of an audio context. Implementations mix or forward voices; how they
/// synthesize is their own business.
pub trait Destination: Send + Sync {
    fn start_voice(&self, voice: VoiceId, source: Source, gain: f32);

    fn stop_voice(&self, voice: VoiceId);

    /// Stop every voice immediately.
    fn silence(&self);
}

/// The host audio subsystem. Each call to [`AudioHost::open`] yields an independent output.
pub trait AudioHost: Send + Sync {
    fn open(&self) -> Result<Arc<dyn Destination>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Suspended,
    Running,
    Closed,
}

#[derive(Debug)]
struct Clock {
    elapsed: Duration,
    resumed_at: Option<Instant>,
}

/// An audio processing context: one output, a clock that only advances while running, and a
/// timer worker for triggers scheduled against that clock.
pub struct AudioContext {
    destination: Arc<dyn Destination>,
    state: Mutex<ContextState>,
    clock: Mutex<Clock>,
    timers: TimerQueue,
    next_voice: AtomicU64,
}

impl AudioContext {
    /// Contexts start suspended and must be resumed before their clock runs.
    pub fn new(name: &'static str, destination: Arc<dyn Destination>) -> Self {
        Self {
            destination,
            state: Mutex::new(ContextState::Suspended),
            clock: Mutex::new(Clock {
                elapsed: Duration::ZERO,
                resumed_at: None,
            }),
            timers: TimerQueue::new(name),
            next_voice: AtomicU64::new(1),
        }
    }

    pub fn open(name: &'static str, host: &dyn AudioHost) -> Result<Self> {
        Ok(Self::new(name, host.open()?))
    }

    pub fn state(&self) -> ContextState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ContextState::Closed)
    }

    pub fn resume(&self) -> Result<()> {
        let Ok(mut state) = self.state.lock() else {
            return Err(Error::Lock("context state"));
        };

        match *state {
            ContextState::Closed => Err(Error::ContextClosed),
            ContextState::Running => Ok(()),
            ContextState::Suspended => {
                let Ok(mut clock) = self.clock.lock() else {
                    return Err(Error::Lock("context clock"));
                };
                clock.resumed_at = Some(Instant::now());
                *state = ContextState::Running;
                debug!("Audio context resumed..!");
                Ok(())
            }
        }
    }

    pub fn suspend(&self) -> Result<()> {
        let Ok(mut state) = self.state.lock() else {
            return Err(Error::Lock("context state"));
        };

        match *state {
            ContextState::Closed => Err(Error::ContextClosed),
            ContextState::Suspended => Ok(()),
            ContextState::Running => {
                let Ok(mut clock) = self.clock.lock() else {
                    return Err(Error::Lock("context clock"));
                };
                if let Some(resumed_at) = clock.resumed_at.take() {
                    clock.elapsed += resumed_at.elapsed();
                }
                *state = ContextState::Suspended;
                Ok(())
            }
        }
    }

    /// Seconds the context has spent running.
    pub fn current_time(&self) -> f64 {
        let Ok(clock) = self.clock.lock() else {
            return 0.0;
        };

        let running = clock
            .resumed_at
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO);

        (clock.elapsed + running).as_secs_f64()
    }

    pub fn destination(&self) -> &Arc<dyn Destination> {
        &self.destination
    }

    pub fn next_voice_id(&self) -> VoiceId {
        self.next_voice.fetch_add(1, Ordering::Relaxed)
    }

    /// Replaces every pending trigger with `timers`, whose offsets count from context time
    /// `start_at`.
    pub fn schedule(&self, start_at: f64, timers: Vec<Timer>) -> Result<u64> {
        self.schedule_plan(start_at, TimerPlan::once(timers))
    }

    pub fn schedule_plan(&self, start_at: f64, plan: TimerPlan) -> Result<u64> {
        match self.state() {
            ContextState::Closed => return Err(Error::ContextClosed),
            ContextState::Suspended => self.resume()?,
            ContextState::Running => {}
        }

        let lead = (start_at - self.current_time()).max(0.0);
        let origin = Instant::now() + seconds_to_duration(lead);

        self.timers.schedule(origin, plan)
    }

    /// Cancels every pending trigger. Voices already sounding are left alone.
    pub fn cancel_scheduled(&self) -> Result<()> {
        self.timers.cancel()
    }

    pub fn has_pending(&self) -> bool {
        self.timers.is_active()
    }

    /// Cancels all triggers, silences the output and closes the context for good.
    pub fn close(&self) -> Result<()> {
        self.timers.cancel()?;
        self.destination.silence();

        let Ok(mut state) = self.state.lock() else {
            return Err(Error::Lock("context state"));
        };
        if *state != ContextState::Closed {
            if let Ok(mut clock) = self.clock.lock() {
                if let Some(resumed_at) = clock.resumed_at.take() {
                    clock.elapsed += resumed_at.elapsed();
                }
            }
            *state = ContextState::Closed;
            debug!("Audio context closed..!");
        }

        Ok(())
    }
}

/// Output that only logs what would have been played.
#[derive(Debug, Default)]
pub struct LogDestination {
    active: Mutex<usize>,
}

impl Destination for LogDestination {
    fn start_voice(&self, voice: VoiceId, source: Source, gain: f32) {
        let active = match self.active.lock() {
            Ok(mut active) => {
                *active += 1;
                *active
            }
            Err(_) => 0,
        };

        match source {
            Source::Oscillator {
                waveform,
                frequency,
            } => info!(
                "voice {:>5} on  | {:?} {:>9.3}Hz | gain {:.3} | active {}",
                voice, waveform, frequency, gain, active
            ),
            Source::Sample { buffer, rate } => info!(
                "voice {:>5} on  | sample {:.3}s x{:.3} | gain {:.3} | active {}",
                voice,
                buffer.duration_seconds(),
                rate,
                gain,
                active
            ),
        }
    }

    fn stop_voice(&self, voice: VoiceId) {
        if let Ok(mut active) = self.active.lock() {
            *active = active.saturating_sub(1);
        }
        debug!("voice {:>5} off", voice);
    }

    fn silence(&self) {
        if let Ok(mut active) = self.active.lock() {
            *active = 0;
        }
        debug!("all voices off");
    }
}

/// Audio host for machines without an output device: every context logs its voices.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessHost;

impl AudioHost for HeadlessHost {
    fn open(&self) -> Result<Arc<dyn Destination>> {
        Ok(Arc::new(LogDestination::default()))
    }
}
