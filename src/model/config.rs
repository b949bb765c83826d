use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "NOTE_ROLL",
    about = "Play, render and convert piano-roll projects and MIDI files!"
)]
pub struct Args {
    /// Path to a project JSON file (`{ notes, tempo }`) or a Standard MIDI File (.mid/.midi).
    pub input: PathBuf,

    /// Tempo override in BPM. Defaults to the project's tempo, or the MIDI file's first tempo.
    #[arg(short, long)]
    pub tempo: Option<f64>,

    /// Playback engine: tone|soundfont.
    #[arg(short, long, default_value = "tone")]
    pub engine: String,

    /// Instrument sample set used by the soundfont engine.
    #[arg(short, long, default_value = "acoustic_grand_piano")]
    pub instrument: String,

    /// Directory holding one sub-directory of WAV samples per instrument.
    #[arg(long = "soundfont-dir", default_value = "./soundfonts")]
    pub soundfont_dir: PathBuf,

    /// Loop the schedule until interrupted.
    #[arg(short, long = "loop", default_value_t = false)]
    pub looped: bool,

    /// Mirror playback to an external MIDI output. Pass a port id or name to pick one, otherwise the first port is used.
    #[arg(long = "midi-output", num_args = 0..=1, default_missing_value = "")]
    pub midi_output: Option<String>,

    /// Write the notes as a Standard MIDI File.
    #[arg(long = "export-midi")]
    pub export_midi: Option<PathBuf>,

    /// Render the notes offline and write them as a 16-bit PCM WAV file.
    #[arg(long = "export-wav")]
    pub export_wav: Option<PathBuf>,

    /// Write the notes and tempo as a project JSON file.
    #[arg(long = "export-project")]
    pub export_project: Option<PathBuf>,

    /// Sample rate for WAV export.
    #[arg(long = "sample-rate", default_value_t = 44_100)]
    pub sample_rate: u32,

    /// Channel count for WAV export (1 or 2).
    #[arg(long, default_value_t = 2)]
    pub channels: u16,

    /// Per-voice gain for WAV export.
    #[arg(long, default_value_t = 0.12)]
    pub gain: f64,

    /// Oscillator used for WAV export: sine|triangle|sawtooth|square.
    #[arg(long, default_value = "sawtooth")]
    pub waveform: String,

    /// Dry run (print the first dry_run_max scheduled events and exit).
    #[arg(short, long, default_value_t = false)]
    pub dry_run: bool,

    /// Maximum events to print in dry run.
    #[arg(long, default_value_t = 80)]
    pub dry_run_max: usize,

    /// Only run the requested exports.
    #[arg(long = "skip-playback", default_value_t = false)]
    pub skip_playback: bool,

    /// Prints extra information to the terminal.
    #[arg(short, long)]
    pub verbose: bool,
}
