use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use std::sync::Arc;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    Sine,
    #[default]
    Triangle,
    Sawtooth,
    Square,
}

/// Naive (non band-limited) phase-accumulating oscillator.
#[derive(Debug, Clone)]
pub struct Oscillator {
    waveform: Waveform,
    phase: f64,
    increment: f64,
}

impl Oscillator {
    pub fn new(waveform: Waveform, frequency: f64, sample_rate: f64) -> Self {
        let increment = if sample_rate > 0.0 {
            frequency / sample_rate
        } else {
            0.0
        };

        Self {
            waveform,
            phase: 0.0,
            increment,
        }
    }

    pub fn next_sample(&mut self) -> f32 {
        let p = self.phase;
        let value = match self.waveform {
            Waveform::Sine => (p * TAU).sin(),
            Waveform::Triangle => 1.0 - 4.0 * (p - 0.5).abs(),
            Waveform::Sawtooth => 2.0 * p - 1.0,
            Waveform::Square => {
                if p < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
        };

        self.phase = (self.phase + self.increment).fract();
        value as f32
    }
}

/// Mono sample data for one sampled note.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub sample_rate: u32,
    pub frames: Vec<f32>,
}

impl SampleBuffer {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames.len() as f64 / self.sample_rate as f64
    }

    /// Linear-interpolated read at a fractional frame position; silent past the end.
    pub fn read(&self, position: f64) -> f32 {
        if position < 0.0 {
            return 0.0;
        }

        let index = position.floor() as usize;
        let Some(&a) = self.frames.get(index) else {
            return 0.0;
        };
        let b = self.frames.get(index + 1).copied().unwrap_or(0.0);
        let t = (position - index as f64) as f32;

        a + (b - a) * t
    }
}

/// What a destination should sound for one voice.
#[derive(Debug, Clone)]
pub enum Source {
    Oscillator { waveform: Waveform, frequency: f64 },
    /// Sample playback, re-pitched by `rate` (1.0 plays at the recorded pitch).
    Sample { buffer: Arc<SampleBuffer>, rate: f64 },
}
