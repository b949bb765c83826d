use NOTE_ROLL::{
    Args, DEFAULT_TEMPO_BPM, DirectoryLoader, MidiOutputState, MidiPlayer, NoteEvent,
    PlaybackOptions, RenderOptions, build_scheduled_events, default_audio_host,
    default_midi_access, import_midi_file, is_midi_path, load_project, parse_engine_kind,
    parse_waveform, save_project, seconds_to_duration, write_midi_file, write_wav_file,
};
use anyhow::Result;
use clap::Parser;
use log::{debug, info, warn};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// Extra wait after the last note ends, so releases and the lead-in aren't cut off.
const PLAYBACK_TAIL: Duration = Duration::from_millis(500);

fn load_input(args: &Args) -> Result<(Vec<NoteEvent>, f64)> {
    if is_midi_path(&args.input) {
        info!("Importing MIDI file: '{}'...", args.input.display());
        let imported = import_midi_file(&args.input)?;

        debug!(
            "Imported '{}' with {} notes at {} ticks per beat..!",
            imported
                .track_name
                .clone()
                .unwrap_or_else(|| "<untitled>".into()),
            imported.notes.len(),
            imported.ticks_per_beat
        );

        let tempo = args
            .tempo
            .or(imported.tempo_bpm)
            .unwrap_or(DEFAULT_TEMPO_BPM);
        Ok((imported.notes, tempo))
    } else {
        info!("Loading project: '{}'...", args.input.display());
        let project = load_project(&args.input)?;
        let tempo = args.tempo.unwrap_or(project.tempo);
        Ok((project.notes, tempo))
    }
}

fn run_exports(args: &Args, notes: &[NoteEvent], tempo: f64) -> Result<()> {
    if let Some(path) = &args.export_midi {
        write_midi_file(path, notes, tempo)?;
    }

    if let Some(path) = &args.export_wav {
        let options = RenderOptions {
            tempo,
            gain: args.gain,
            sample_rate: args.sample_rate,
            channels: args.channels,
            waveform: parse_waveform(&args.waveform),
        };
        write_wav_file(path, notes, &options)?;
    }

    if let Some(path) = &args.export_project {
        save_project(path, notes, tempo)?;
    }

    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let engine = parse_engine_kind(&args.engine);

    let (notes, tempo) = load_input(&args)?;
    info!("Loaded {} notes at {:.1} BPM..!", notes.len(), tempo);

    run_exports(&args, &notes, tempo)?;

    if args.dry_run || args.verbose {
        let events = build_scheduled_events(&notes, tempo);
        let limit = if args.dry_run {
            args.dry_run_max
        } else {
            events.len()
        };

        info!("Previewing {} of {} events..!", limit.min(events.len()), events.len());
        for (i, ev) in events.iter().take(limit).enumerate() {
            info!(
                "Event {:>4}: {:<4} midi={:<3} at {:>9.3}s for {:>7.3}s | vel {:.2} | id {}",
                i, ev.pitch, ev.midi, ev.time_seconds, ev.duration_seconds, ev.velocity, ev.id
            );
        }

        if args.dry_run {
            return Ok(());
        }
    }

    if args.skip_playback {
        info!("Skipping playback..!");
        return Ok(());
    }

    let player = Arc::new(MidiPlayer::new(
        default_audio_host(),
        Arc::new(DirectoryLoader::new(&args.soundfont_dir)),
    ));

    if let Some(id) = &args.midi_output {
        let access = default_midi_access();
        let requested = (!id.is_empty()).then_some(id.as_str());

        match player.use_midi_output(access.as_deref(), requested) {
            MidiOutputState::Supported => {}
            state => warn!("MIDI output unavailable ({:?}), playing audio only..!", state),
        }
    }

    let player_for_handler = Arc::clone(&player);
    let (done_tx, done_rx) = mpsc::channel::<()>();

    ctrlc::set_handler(move || {
        warn!("Ctrl-C received, stopping playback..!");
        let _ = player_for_handler.stop();
        let _ = done_tx.send(());
    })?;

    let options = PlaybackOptions {
        engine: Some(engine),
        looped: args.looped,
        instrument: Some(args.instrument.clone()),
        tempo: Some(tempo),
    };

    let used = player.play_with_fallback(&notes, &options)?;
    info!(
        "Scheduled {} events on the {} engine..!",
        player.scheduled_count(),
        used
    );

    if args.looped {
        info!("Looping until Ctrl-C..!");
        let _ = done_rx.recv();
    } else {
        let wait = seconds_to_duration(player.schedule_length()).saturating_add(PLAYBACK_TAIL);
        match done_rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => info!("Playback finished..!"),
        }
    }

    player.stop()?;
    player.dispose()?;
    info!("Exiting..!");

    Ok(())
}
