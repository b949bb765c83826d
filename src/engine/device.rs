use crate::engine::context::{AudioHost, Destination, VoiceId};
use crate::engine::voice::{Oscillator, SampleBuffer, Source};
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, StreamConfig};
use log::{debug, error, info, warn};
use rtrb::{Producer, RingBuffer};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

const COMMAND_CAPACITY: usize = 4096;
const RELEASE_SECONDS: f32 = 0.005;
const MAX_VOICES: usize = 256;

enum VoiceCommand {
    Start {
        voice: VoiceId,
        source: Source,
        gain: f32,
    },
    Stop(VoiceId),
    Silence,
}

enum Generator {
    Oscillator(Oscillator),
    Sample {
        buffer: Arc<SampleBuffer>,
        position: f64,
        step: f64,
    },
}

struct Voice {
    id: VoiceId,
    generator: Generator,
    gain: f32,
    /// Per-sample gain decrement once released.
    release: Option<f32>,
    level: f32,
}

impl Voice {
    fn new(id: VoiceId, source: Source, gain: f32, sample_rate: f64) -> Self {
        let generator = match source {
            Source::Oscillator {
                waveform,
                frequency,
            } => Generator::Oscillator(Oscillator::new(waveform, frequency, sample_rate)),
            Source::Sample { buffer, rate } => {
                let step = rate * buffer.sample_rate as f64 / sample_rate.max(1.0);
                Generator::Sample {
                    buffer,
                    position: 0.0,
                    step,
                }
            }
        };

        Self {
            id,
            generator,
            gain,
            release: None,
            level: 1.0,
        }
    }

    /// Next sample, or `None` once the voice has finished.
    fn next(&mut self) -> Option<f32> {
        if let Some(decrement) = self.release {
            self.level -= decrement;
            if self.level <= 0.0 {
                return None;
            }
        }

        let raw = match &mut self.generator {
            Generator::Oscillator(osc) => osc.next_sample(),
            Generator::Sample {
                buffer,
                position,
                step,
            } => {
                if *position >= buffer.frames.len() as f64 {
                    return None;
                }
                let value = buffer.read(*position);
                *position += *step;
                value
            }
        };

        Some(raw * self.gain * self.level)
    }
}

/// Voice mixer living inside the output callback.
struct Mixer {
    voices: Vec<Voice>,
    sample_rate: f64,
    channels: usize,
}

impl Mixer {
    fn apply(&mut self, command: VoiceCommand) {
        match command {
            VoiceCommand::Start { voice, source, gain } => {
                if self.voices.len() >= MAX_VOICES {
                    self.voices.remove(0);
                }
                self.voices
                    .push(Voice::new(voice, source, gain, self.sample_rate));
            }
            VoiceCommand::Stop(id) => {
                let decrement = 1.0 / (RELEASE_SECONDS * self.sample_rate as f32).max(1.0);
                for voice in self.voices.iter_mut().filter(|v| v.id == id) {
                    voice.release.get_or_insert(decrement);
                }
            }
            VoiceCommand::Silence => self.voices.clear(),
        }
    }

    fn fill(&mut self, data: &mut [f32]) {
        for frame in data.chunks_mut(self.channels.max(1)) {
            let mut sum = 0.0;
            self.voices.retain_mut(|voice| match voice.next() {
                Some(sample) => {
                    sum += sample;
                    true
                }
                None => false,
            });

            let sample = sum.clamp(-1.0, 1.0);
            frame.fill(sample);
        }
    }
}

/// Output on the default cpal device. The stream lives on its own thread for as long as the
/// destination does, since cpal streams cannot move between threads on every platform.
pub struct CpalDestination {
    commands: Mutex<Producer<VoiceCommand>>,
    shutdown: Mutex<Option<Sender<()>>>,
}

impl CpalDestination {
    fn push(&self, command: VoiceCommand) {
        let Ok(mut commands) = self.commands.lock() else {
            warn!("Audio command queue lock poisoned..!");
            return;
        };

        if commands.push(command).is_err() {
            warn!("Audio command queue full, dropping command..!");
        }
    }
}

impl Destination for CpalDestination {
    fn start_voice(&self, voice: VoiceId, source: Source, gain: f32) {
        self.push(VoiceCommand::Start {
            voice,
            source,
            gain,
        });
    }

    fn stop_voice(&self, voice: VoiceId) {
        self.push(VoiceCommand::Stop(voice));
    }

    fn silence(&self) {
        self.push(VoiceCommand::Silence);
    }
}

impl Drop for CpalDestination {
    fn drop(&mut self) {
        if let Ok(mut shutdown) = self.shutdown.lock() {
            if let Some(tx) = shutdown.take() {
                let _ = tx.send(());
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CpalHost;

impl AudioHost for CpalHost {
    fn open(&self) -> Result<Arc<dyn Destination>> {
        let (producer, mut consumer) = RingBuffer::<VoiceCommand>::new(COMMAND_CAPACITY);
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        thread::Builder::new()
            .name("cpal-output".into())
            .spawn(move || {
                let host = cpal::default_host();
                let Some(device) = host.default_output_device() else {
                    let _ = ready_tx.send(Err("no output device available".into()));
                    return;
                };

                let sample_rate = match device.default_output_config() {
                    Ok(config) => config.sample_rate(),
                    Err(why) => {
                        let _ = ready_tx.send(Err(why.to_string()));
                        return;
                    }
                };

                let config = StreamConfig {
                    channels: 2,
                    sample_rate,
                    buffer_size: BufferSize::Default,
                };

                let mut mixer = Mixer {
                    voices: Vec::new(),
                    sample_rate: sample_rate.0 as f64,
                    channels: config.channels as usize,
                };

                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        while let Ok(command) = consumer.pop() {
                            mixer.apply(command);
                        }
                        mixer.fill(data);
                    },
                    |err| error!("Output stream error: {}", err),
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(why) => {
                        let _ = ready_tx.send(Err(why.to_string()));
                        return;
                    }
                };

                if let Err(why) = stream.play() {
                    let _ = ready_tx.send(Err(why.to_string()));
                    return;
                }

                info!("Opened audio output at {}Hz..!", sample_rate.0);
                let _ = ready_tx.send(Ok(()));

                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("Audio output closed..!");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Arc::new(CpalDestination {
                commands: Mutex::new(producer),
                shutdown: Mutex::new(Some(shutdown_tx)),
            })),
            Ok(Err(why)) => Err(Error::AudioUnavailable(why)),
            Err(_) => Err(Error::AudioUnavailable(
                "output thread exited before opening a stream".into(),
            )),
        }
    }
}
