use crate::engine::context::AudioHost;
use crate::engine::sampler::{SampleLoader, SamplerEngine};
use crate::engine::scheduler::{build_scheduled_events, schedule_end};
use crate::engine::tone::ToneEngine;
use crate::engine::{AudioEngine, EngineKind, PlaybackOptions};
use crate::error::{Error, Result};
use crate::midi_output::{MidiAccess, MidiMirror, MidiOutputState};
use crate::model::note::{NoteEvent, ScheduledEvent};
use crate::model::time::DEFAULT_TEMPO_BPM;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct PlayerState {
    engine_kind: EngineKind,
    last_events: Vec<ScheduledEvent>,
    disposed: bool,
}

/// Turns note lists into schedules, hands them to one of two engines, and optionally mirrors
/// them to an external MIDI output.
///
/// Every method takes `&self`, so a player can sit behind an `Arc` and be stopped from a signal
/// handler while another thread waits on playback.
pub struct MidiPlayer {
    tone: ToneEngine,
    sampler: SamplerEngine,
    mirror: MidiMirror,
    state: Mutex<PlayerState>,
}

impl MidiPlayer {
    pub fn new(host: Arc<dyn AudioHost>, loader: Arc<dyn SampleLoader>) -> Self {
        Self {
            tone: ToneEngine::new(Arc::clone(&host)),
            sampler: SamplerEngine::new(host, loader),
            mirror: MidiMirror::new(),
            state: Mutex::new(PlayerState::default()),
        }
    }

    fn engine(&self, kind: EngineKind) -> &dyn AudioEngine {
        match kind {
            EngineKind::Tone => &self.tone,
            EngineKind::Soundfont => &self.sampler,
        }
    }

    fn active(&self) -> &dyn AudioEngine {
        self.engine(self.engine_kind())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PlayerState>> {
        self.state.lock().map_err(|_| Error::Lock("player state"))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.lock()?.disposed {
            return Err(Error::Disposed("player"));
        }
        Ok(())
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.state
            .lock()
            .map(|state| state.engine_kind)
            .unwrap_or_default()
    }

    /// Makes `kind` the active engine and initializes it.
    pub fn set_engine(&self, kind: EngineKind, options: &PlaybackOptions) -> Result<()> {
        {
            let mut state = self.lock()?;
            if state.disposed {
                return Err(Error::Disposed("player"));
            }
            state.engine_kind = kind;
        }

        self.engine(kind).init(options)
    }

    /// Selects the output to mirror playback to. Never fails; the outcome is the returned state.
    pub fn use_midi_output(
        &self,
        access: Option<&dyn MidiAccess>,
        output_id: Option<&str>,
    ) -> MidiOutputState {
        self.mirror.attach(access, output_id)
    }

    pub fn midi_output_state(&self) -> MidiOutputState {
        self.mirror.state()
    }

    pub fn estimate_scheduled_count(&self, notes: &[NoteEvent], tempo_bpm: f64) -> usize {
        build_scheduled_events(notes, tempo_bpm).len()
    }

    /// Schedules `notes` on the requested engine, or the current one when none is requested.
    /// Whatever was playing before is stopped first, on either engine.
    pub fn play(&self, notes: &[NoteEvent], options: &PlaybackOptions) -> Result<()> {
        self.ensure_live()?;

        let previous = self.engine_kind();
        let resolved = PlaybackOptions {
            engine: Some(options.engine.unwrap_or(previous)),
            looped: options.looped,
            instrument: options.instrument.clone(),
            tempo: Some(options.tempo.unwrap_or(DEFAULT_TEMPO_BPM)),
        };
        let kind = resolved.engine.unwrap_or_default();
        let tempo = resolved.tempo.unwrap_or(DEFAULT_TEMPO_BPM);

        self.mirror.clear()?;
        self.engine(previous).stop()?;

        let events = build_scheduled_events(notes, tempo);
        self.lock()?.last_events = events.clone();

        self.set_engine(kind, &resolved)?;
        self.engine(kind).play(&events, &resolved)?;
        self.mirror.schedule(&events)?;

        info!(
            "Playing {} event(s) on the {} engine at {:.1} BPM{}..!",
            events.len(),
            kind,
            tempo,
            if resolved.looped { " (looped)" } else { "" }
        );

        Ok(())
    }

    /// Plays as [`MidiPlayer::play`] does, but if the soundfont engine fails, retries the same
    /// notes on the tone engine. Returns the engine that ended up playing.
    pub fn play_with_fallback(
        &self,
        notes: &[NoteEvent],
        options: &PlaybackOptions,
    ) -> Result<EngineKind> {
        let requested = options.engine.unwrap_or_else(|| self.engine_kind());

        match self.play(notes, options) {
            Ok(()) => Ok(requested),
            Err(why) if requested == EngineKind::Soundfont => {
                warn!(
                    "Soundfont playback failed ({}), falling back to the tone engine..!",
                    why
                );
                let fallback = PlaybackOptions {
                    engine: Some(EngineKind::Tone),
                    ..options.clone()
                };
                self.play(notes, &fallback)?;
                Ok(EngineKind::Tone)
            }
            Err(why) => Err(why),
        }
    }

    pub fn pause(&self) -> Result<()> {
        self.active().pause()?;
        self.mirror.clear()
    }

    /// Continues a paused tone engine. The mirror picks up from the same position.
    pub fn resume(&self) -> Result<Option<f64>> {
        let Some(position) = self.active().resume()? else {
            debug!("Nothing to resume..!");
            return Ok(None);
        };

        let remaining: Vec<ScheduledEvent> = self
            .scheduled_events()
            .into_iter()
            .filter(|event| event.time_seconds >= position)
            .map(|mut event| {
                event.time_seconds -= position;
                event
            })
            .collect();
        self.mirror.schedule(&remaining)?;

        Ok(Some(position))
    }

    pub fn stop(&self) -> Result<()> {
        self.active().stop()?;
        self.mirror.clear()
    }

    pub fn scheduled_count(&self) -> usize {
        self.active().scheduled_count()
    }

    /// A copy of the schedule computed by the latest play.
    pub fn scheduled_events(&self) -> Vec<ScheduledEvent> {
        self.state
            .lock()
            .map(|state| state.last_events.clone())
            .unwrap_or_default()
    }

    /// Seconds from the first trigger to the end of the last note.
    pub fn schedule_length(&self) -> f64 {
        self.state
            .lock()
            .map(|state| schedule_end(&state.last_events))
            .unwrap_or(0.0)
    }

    pub fn is_playing(&self) -> bool {
        self.active().is_playing() || self.mirror.is_active()
    }

    /// Tears down both engines and the mirror. Later calls do nothing.
    pub fn dispose(&self) -> Result<()> {
        {
            let mut state = self.lock()?;
            if state.disposed {
                return Ok(());
            }
            state.disposed = true;
            state.last_events.clear();
        }

        self.mirror.detach()?;
        self.tone.dispose()?;
        self.sampler.dispose()?;

        debug!("Player disposed..!");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::context::testing::{RecordingHost, UnavailableHost};
    use crate::engine::sampler::testing::StaticLoader;
    use crate::midi_output::testing::FakeAccess;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn notes() -> Vec<NoteEvent> {
        vec![
            NoteEvent::new("b", 64, 0.1, 0.1, 0.85),
            NoteEvent::new("a", 60, 0.0, 0.1, 0.85),
        ]
    }

    fn player(loader: StaticLoader) -> (MidiPlayer, Arc<RecordingHost>) {
        let host = Arc::new(RecordingHost::default());
        (MidiPlayer::new(host.clone(), Arc::new(loader)), host)
    }

    fn soundfont() -> PlaybackOptions {
        PlaybackOptions {
            engine: Some(EngineKind::Soundfont),
            instrument: Some("piano".into()),
            ..Default::default()
        }
    }

    #[test]
    fn plays_on_tone_engine_by_default() {
        env_logger::try_init().unwrap_or(());

        let (player, host) = player(StaticLoader::default());
        player.play(&notes(), &PlaybackOptions::default()).unwrap();

        assert_eq!(player.engine_kind(), EngineKind::Tone);
        assert_eq!(player.scheduled_count(), 2);

        let events = player.scheduled_events();
        assert_eq!(events[0].id, "a");
        assert_eq!(events[1].id, "b");
        assert_eq!(events[1].time_seconds, 0.05);
        assert_eq!(player.schedule_length(), 0.1);

        thread::sleep(Duration::from_millis(300));
        assert_eq!(host.last().starts(), 2);

        player.dispose().unwrap();
    }

    #[test]
    fn estimate_matches_schedule_without_side_effects() {
        let (player, _) = player(StaticLoader::default());
        assert_eq!(player.estimate_scheduled_count(&notes(), 90.0), 2);
        assert!(player.scheduled_events().is_empty());
        assert_eq!(player.scheduled_count(), 0);
    }

    #[test]
    fn scheduled_events_are_a_copy() {
        let (player, _) = player(StaticLoader::default());
        player.play(&notes(), &PlaybackOptions::default()).unwrap();

        let mut copy = player.scheduled_events();
        copy.clear();
        assert_eq!(player.scheduled_events().len(), 2);
        player.stop().unwrap();
    }

    #[test]
    fn switching_engines_stops_the_previous_one() {
        let (player, host) = player(StaticLoader::default());

        let late = vec![NoteEvent::new("late", 60, 0.6, 0.2, 0.8)];
        player.play(&late, &PlaybackOptions::default()).unwrap();
        player.play(&notes(), &soundfont()).unwrap();

        assert_eq!(player.engine_kind(), EngineKind::Soundfont);
        assert_eq!(player.scheduled_count(), 2);

        thread::sleep(Duration::from_millis(500));

        let opened = host.opened.lock().unwrap().clone();
        assert_eq!(opened.len(), 2);
        assert_eq!(opened[0].starts(), 0);
        assert_eq!(opened[1].starts(), 2);
    }

    #[test]
    fn falls_back_to_tone_when_samples_fail() {
        let (player, host) = player(StaticLoader::failing());

        assert!(matches!(
            player.play(&notes(), &soundfont()),
            Err(Error::InstrumentLoad { .. })
        ));

        let used = player.play_with_fallback(&notes(), &soundfont()).unwrap();
        assert_eq!(used, EngineKind::Tone);
        assert_eq!(player.engine_kind(), EngineKind::Tone);
        assert_eq!(player.scheduled_count(), 2);

        thread::sleep(Duration::from_millis(300));
        assert_eq!(host.last().starts(), 2);
    }

    #[test]
    fn failed_play_stops_the_previous_schedule() {
        let (player, host) = player(StaticLoader::rejecting("violin"));

        let late = vec![NoteEvent::new("late", 60, 0.6, 0.2, 0.8)];
        player.play(&late, &soundfont()).unwrap();

        let violin = PlaybackOptions {
            instrument: Some("violin".into()),
            ..soundfont()
        };
        assert!(player.play(&late, &violin).is_err());

        thread::sleep(Duration::from_millis(600));
        assert_eq!(host.last().starts(), 0);
        assert_eq!(player.scheduled_count(), 0);
    }

    #[test]
    fn huge_note_values_play_without_panicking() {
        let payload = serde_json::json!({
            "notes": [
                { "id": "ok", "midi": 60, "time": 0, "duration": 0.1, "velocity": 0.8 },
                { "id": "huge", "midi": 62, "time": 0, "duration": 1e300, "velocity": 0.8 },
                { "id": "far", "midi": 64, "time": 1e300, "duration": 1, "velocity": 0.8 },
            ]
        });
        let notes = crate::model::project::project_json_to_notes(&payload);
        let (player, host) = player(StaticLoader::default());

        player.play(&notes, &PlaybackOptions::default()).unwrap();
        assert_eq!(player.scheduled_count(), 3);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(host.last().starts(), 2);

        player.stop().unwrap();
        assert!(!player.is_playing());

        let looped = PlaybackOptions {
            looped: true,
            ..Default::default()
        };
        player.play(&notes, &looped).unwrap();
        player.pause().unwrap();
        player.resume().unwrap();
        player.dispose().unwrap();
    }

    #[test]
    fn fallback_does_not_mask_tone_failures() {
        let player = MidiPlayer::new(
            Arc::new(UnavailableHost),
            Arc::new(StaticLoader::default()),
        );

        assert!(matches!(
            player.play_with_fallback(&notes(), &PlaybackOptions::default()),
            Err(Error::AudioUnavailable(_))
        ));
    }

    #[test]
    fn mirrors_to_midi_output() {
        let (player, _) = player(StaticLoader::default());
        let access = FakeAccess::with_ports(&["synth"]);

        assert_eq!(player.midi_output_state(), MidiOutputState::Unsupported);
        assert_eq!(
            player.use_midi_output(Some(&access), None),
            MidiOutputState::Supported
        );

        player.play(&notes(), &PlaybackOptions::default()).unwrap();
        thread::sleep(Duration::from_millis(300));

        let messages: Vec<Vec<u8>> = access.sent().into_iter().map(|(_, m)| m).collect();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], vec![0x90, 60, 108]);
        assert_eq!(messages[3], vec![0x80, 64, 0]);
    }

    #[test]
    fn stop_clears_engine_and_mirror() {
        let (player, host) = player(StaticLoader::default());
        let access = FakeAccess::with_ports(&["synth"]);
        player.use_midi_output(Some(&access), None);

        let late = vec![NoteEvent::new("late", 60, 0.6, 0.2, 0.8)];
        player.play(&late, &PlaybackOptions::default()).unwrap();
        player.stop().unwrap();

        thread::sleep(Duration::from_millis(500));
        assert_eq!(player.scheduled_count(), 0);
        assert_eq!(host.last().starts(), 0);
        assert!(access.sent().is_empty());
        assert!(!player.is_playing());
    }

    #[test]
    fn pause_and_resume_continue_the_mirror() {
        let (player, _) = player(StaticLoader::default());
        let access = FakeAccess::with_ports(&["synth"]);
        player.use_midi_output(Some(&access), None);

        let phrase = vec![
            NoteEvent::new("early", 60, 0.0, 0.1, 0.8),
            NoteEvent::new("late", 67, 1.0, 0.1, 0.8),
        ];
        player.play(&phrase, &PlaybackOptions::default()).unwrap();
        thread::sleep(Duration::from_millis(150));
        player.pause().unwrap();

        let position = player.resume().unwrap().unwrap();
        assert!(position > 0.0 && position < 0.5);

        thread::sleep(Duration::from_millis(700));
        let keys: Vec<u8> = access
            .sent()
            .into_iter()
            .filter(|(_, m)| m[0] == 0x90)
            .map(|(_, m)| m[1])
            .collect();
        assert_eq!(keys, vec![60, 67]);
    }

    #[test]
    fn dispose_tears_everything_down_once() {
        let (player, _) = player(StaticLoader::default());
        player.play(&notes(), &PlaybackOptions::default()).unwrap();

        player.dispose().unwrap();
        player.dispose().unwrap();

        assert!(player.scheduled_events().is_empty());
        assert!(matches!(
            player.play(&notes(), &PlaybackOptions::default()),
            Err(Error::Disposed("player"))
        ));
    }
}
