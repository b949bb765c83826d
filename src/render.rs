use crate::engine::voice::{Oscillator, Waveform};
use crate::error::{Error, Result};
use crate::model::note::{NoteEvent, clamp_velocity};
use crate::model::time::{beat_seconds, note_name_to_frequency};
use hound::{SampleFormat, WavSpec, WavWriter};
use log::{debug, info};
use std::fs;
use std::io::Cursor;
use std::path::Path;

pub const DEFAULT_RENDER_GAIN: f64 = 0.12;
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
pub const DEFAULT_RENDER_CHANNELS: u16 = 2;

/// Rendered notes never last less than this, in seconds.
pub const MIN_RENDER_SECONDS: f64 = 0.03;
/// Silence appended after the last note.
pub const RENDER_TAIL_SECONDS: f64 = 1.0;
/// Longest render accepted, tail included. One hour.
pub const MAX_RENDER_SECONDS: f64 = 3_600.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderOptions {
    pub tempo: f64,
    pub gain: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub waveform: Waveform,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            tempo: 120.0,
            gain: DEFAULT_RENDER_GAIN,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_RENDER_CHANNELS,
            waveform: Waveform::Sawtooth,
        }
    }
}

impl RenderOptions {
    fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::InvalidRenderOptions(
                "sample rate must be greater than zero".into(),
            ));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(Error::InvalidRenderOptions(format!(
                "{} channels requested, only mono and stereo are supported",
                self.channels
            )));
        }
        Ok(())
    }
}

/// Planar float audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn interleave(&self) -> Vec<f32> {
        let frames = self.frames();
        let mut out = Vec::with_capacity(frames * self.channels.len());
        for frame in 0..frames {
            for channel in &self.channels {
                out.push(channel[frame]);
            }
        }
        out
    }
}

/// Length of a render of `notes`: the latest note end plus a one second tail.
pub fn render_length_seconds(notes: &[NoteEvent], tempo: f64) -> f64 {
    let beat = beat_seconds(tempo);
    let last_end = notes
        .iter()
        .map(|note| note.end() * beat)
        .fold(0.0, f64::max);

    last_end + RENDER_TAIL_SECONDS
}

/// Renders one oscillator voice per note, summed into every channel.
pub fn render_notes(notes: &[NoteEvent], options: &RenderOptions) -> Result<AudioBuffer> {
    options.validate()?;

    let sample_rate = options.sample_rate as f64;
    let beat = beat_seconds(options.tempo);

    let length = render_length_seconds(notes, options.tempo);
    if !length.is_finite() || length > MAX_RENDER_SECONDS {
        return Err(Error::InvalidRenderOptions(format!(
            "render of {:.1}s exceeds the {}s limit",
            length, MAX_RENDER_SECONDS
        )));
    }
    let frame_count = (length * sample_rate).ceil() as usize;

    let mut mix = vec![0.0f32; frame_count];

    for note in notes {
        let start = (note.time * beat).max(0.0);
        let end = start + (note.duration * beat).max(MIN_RENDER_SECONDS);
        let gain = (options.gain * clamp_velocity(note.velocity)) as f32;

        let first = ((start * sample_rate).round() as usize).min(frame_count);
        let last = ((end * sample_rate).round() as usize).min(frame_count);

        let frequency = note_name_to_frequency(&note.pitch_name());
        let mut osc = Oscillator::new(options.waveform, frequency, sample_rate);

        for sample in &mut mix[first..last] {
            *sample += osc.next_sample() * gain;
        }
    }

    debug!(
        "Rendered {} note(s) into {} frame(s) at {}Hz..!",
        notes.len(),
        frame_count,
        options.sample_rate
    );

    Ok(AudioBuffer {
        sample_rate: options.sample_rate,
        channels: vec![mix; options.channels as usize],
    })
}

/// Clamps to [-1, 1] and scales asymmetrically onto the full i16 range.
pub fn to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32_768.0) as i16
    } else {
        (s * 32_767.0) as i16
    }
}

/// Encodes the buffer as a 16-bit PCM WAV with a canonical 44-byte header.
pub fn encode_wav(buffer: &AudioBuffer) -> Result<Vec<u8>> {
    let channels = buffer.channels.len();
    if !(1..=2).contains(&channels) {
        return Err(Error::InvalidRenderOptions(format!(
            "cannot encode {} channels",
            channels
        )));
    }

    let spec = WavSpec {
        channels: channels as u16,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for sample in buffer.interleave() {
            writer.write_sample(to_pcm16(sample))?;
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

pub fn export_notes_to_wav(notes: &[NoteEvent], options: &RenderOptions) -> Result<Vec<u8>> {
    let buffer = render_notes(notes, options)?;
    encode_wav(&buffer)
}

pub fn write_wav_file<P: AsRef<Path>>(
    path: P,
    notes: &[NoteEvent],
    options: &RenderOptions,
) -> Result<()> {
    let bytes = export_notes_to_wav(notes, options)?;
    fs::write(path.as_ref(), &bytes)?;
    info!(
        "Rendered {} note(s) to {} ({} bytes)..!",
        notes.len(),
        path.as_ref().display(),
        bytes.len()
    );
    Ok(())
}
