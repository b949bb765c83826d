use crate::engine::timer::{Job, Timer, TimerPlan, TimerQueue};
use crate::error::{Error, Result};
use crate::model::note::ScheduledEvent;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub const NOTE_ON: u8 = 0x90;
pub const NOTE_OFF: u8 = 0x80;

/// Outcome of probing for an external MIDI output.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MidiOutputState {
    #[default]
    Unsupported,
    NoOutput,
    PermissionDenied,
    Supported,
}

pub trait OutputPort: Send {
    fn id(&self) -> String;

    fn name(&self) -> String;

    fn send(&mut self, message: &[u8]) -> Result<()>;
}

/// Host MIDI subsystem. An `Err` from [`MidiAccess::request_outputs`] means access was refused.
pub trait MidiAccess: Send + Sync {
    fn request_outputs(&self) -> Result<Vec<Box<dyn OutputPort>>>;
}

pub fn detect_midi_support(access: Option<&dyn MidiAccess>) -> MidiOutputState {
    let Some(access) = access else {
        return MidiOutputState::Unsupported;
    };

    match access.request_outputs() {
        Ok(outputs) if outputs.is_empty() => MidiOutputState::NoOutput,
        Ok(_) => MidiOutputState::Supported,
        Err(why) => {
            debug!("MIDI access refused: {}", why);
            MidiOutputState::PermissionDenied
        }
    }
}

pub fn note_on_message(event: &ScheduledEvent) -> [u8; 3] {
    [NOTE_ON, event.key(), event.velocity_byte()]
}

pub fn note_off_message(event: &ScheduledEvent) -> [u8; 3] {
    [NOTE_OFF, event.key(), 0]
}

type SharedPort = Arc<Mutex<Option<Box<dyn OutputPort>>>>;
/// Keys with a note-on sent and no note-off yet, with how many times each is held.
type SoundingKeys = Arc<Mutex<HashMap<u8, usize>>>;

fn send_message(port: &SharedPort, message: &[u8]) {
    let Ok(mut guard) = port.lock() else {
        return;
    };
    if let Some(output) = guard.as_mut() {
        if let Err(why) = output.send(message) {
            warn!("Failed to send MIDI message {:02X?}: {}", message, why);
        }
    }
}

fn send_job(port: &SharedPort, sounding: &SoundingKeys, message: [u8; 3]) -> Job {
    let port = Arc::clone(port);
    let sounding = Arc::clone(sounding);
    Arc::new(move || {
        if let Ok(mut keys) = sounding.lock() {
            let key = message[1];
            if message[0] == NOTE_ON {
                *keys.entry(key).or_insert(0) += 1;
            } else if let Some(held) = keys.get_mut(&key) {
                *held -= 1;
                if *held == 0 {
                    keys.remove(&key);
                }
            }
        }
        send_message(&port, &message);
    })
}

/// Replays a schedule as raw note messages on an external output, on its own timers and with
/// no lead-in.
pub struct MidiMirror {
    output: SharedPort,
    sounding: SoundingKeys,
    state: Mutex<MidiOutputState>,
    timers: TimerQueue,
}

impl Default for MidiMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl MidiMirror {
    pub fn new() -> Self {
        Self {
            output: Arc::new(Mutex::new(None)),
            sounding: Arc::new(Mutex::new(HashMap::new())),
            state: Mutex::new(MidiOutputState::Unsupported),
            timers: TimerQueue::new("midi-mirror"),
        }
    }

    pub fn state(&self) -> MidiOutputState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(MidiOutputState::Unsupported)
    }

    pub fn has_output(&self) -> bool {
        self.output.lock().map(|o| o.is_some()).unwrap_or(false)
    }

    /// Attaches the output whose id matches `output_id`, falling back to the first one. Never
    /// fails: whatever happens is reported through the returned state.
    pub fn attach(&self, access: Option<&dyn MidiAccess>, output_id: Option<&str>) -> MidiOutputState {
        let (state, selected) = match access {
            None => (MidiOutputState::Unsupported, None),
            Some(access) => match access.request_outputs() {
                Err(why) => {
                    warn!("MIDI output access denied: {}", why);
                    (MidiOutputState::PermissionDenied, None)
                }
                Ok(outputs) if outputs.is_empty() => (MidiOutputState::NoOutput, None),
                Ok(mut outputs) => {
                    let index = output_id
                        .and_then(|id| outputs.iter().position(|o| o.id() == id))
                        .unwrap_or(0);
                    (MidiOutputState::Supported, Some(outputs.swap_remove(index)))
                }
            },
        };

        if let Some(output) = &selected {
            info!("Mirroring playback to MIDI output '{}'..!", output.name());
        }

        if let Ok(mut guard) = self.output.lock() {
            *guard = selected;
        }
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }

        state
    }

    pub fn detach(&self) -> Result<()> {
        self.clear()?;
        let Ok(mut guard) = self.output.lock() else {
            return Err(Error::Lock("midi output"));
        };
        *guard = None;
        Ok(())
    }

    /// Replaces any pending messages with `events`, timed from now.
    pub fn schedule(&self, events: &[ScheduledEvent]) -> Result<()> {
        if !self.has_output() {
            return Ok(());
        }

        let mut timers = Vec::with_capacity(events.len() * 2);
        for event in events {
            timers.push(Timer::new(
                event.time_seconds,
                send_job(&self.output, &self.sounding, note_on_message(event)),
            ));
            timers.push(Timer::new(
                event.end_seconds(),
                send_job(&self.output, &self.sounding, note_off_message(event)),
            ));
        }

        self.timers.schedule(Instant::now(), TimerPlan::once(timers))?;
        debug!("Mirroring {} event(s) to MIDI output..!", events.len());
        Ok(())
    }

    /// Cancels every message not yet sent and releases the keys still held on the output.
    pub fn clear(&self) -> Result<()> {
        self.timers.cancel()?;

        let mut held: Vec<u8> = {
            let Ok(mut keys) = self.sounding.lock() else {
                return Err(Error::Lock("midi sounding keys"));
            };
            keys.drain().map(|(key, _)| key).collect()
        };
        held.sort_unstable();

        for key in &held {
            send_message(&self.output, &[NOTE_OFF, *key, 0]);
        }
        if !held.is_empty() {
            debug!("Released {} held MIDI key(s)..!", held.len());
        }

        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.timers.is_active()
    }
}

#[cfg(feature = "midi-output")]
pub mod midir_backend {
    use super::*;
    use midir::{MidiOutput, MidiOutputConnection};

    const CLIENT_NAME: &str = "NOTE_ROLL";

    /// One system MIDI output port, connected on first send.
    pub struct MidirPort {
        id: String,
        name: String,
        port: midir::MidiOutputPort,
        connection: Option<MidiOutputConnection>,
    }

    impl MidirPort {
        fn connect(&mut self) -> Result<&mut MidiOutputConnection> {
            if self.connection.is_none() {
                let output =
                    MidiOutput::new(CLIENT_NAME).map_err(|e| Error::MidiOutput(e.to_string()))?;
                let connection = output
                    .connect(&self.port, "note-roll-out")
                    .map_err(|e| Error::MidiOutput(e.to_string()))?;
                self.connection = Some(connection);
            }

            self.connection
                .as_mut()
                .ok_or_else(|| Error::MidiOutput("connection unavailable".into()))
        }
    }

    impl OutputPort for MidirPort {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn name(&self) -> String {
            self.name.clone()
        }

        fn send(&mut self, message: &[u8]) -> Result<()> {
            self.connect()?
                .send(message)
                .map_err(|e| Error::MidiOutput(e.to_string()))
        }
    }

    #[derive(Debug, Default, Clone, Copy)]
    pub struct MidirAccess;

    impl MidiAccess for MidirAccess {
        fn request_outputs(&self) -> Result<Vec<Box<dyn OutputPort>>> {
            let output = MidiOutput::new(CLIENT_NAME).map_err(|e| Error::MidiOutput(e.to_string()))?;

            let ports = output
                .ports()
                .into_iter()
                .map(|port| {
                    let name = output
                        .port_name(&port)
                        .unwrap_or_else(|_| "unknown".to_string());
                    Box::new(MidirPort {
                        id: port.id(),
                        name,
                        port,
                        connection: None,
                    }) as Box<dyn OutputPort>
                })
                .collect();

            Ok(ports)
        }
    }
}

/// The system MIDI subsystem when built with `midi-output`.
pub fn default_midi_access() -> Option<Box<dyn MidiAccess>> {
    #[cfg(feature = "midi-output")]
    {
        Some(Box::new(midir_backend::MidirAccess))
    }

    #[cfg(not(feature = "midi-output"))]
    {
        None
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub type SentLog = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

    pub struct FakePort {
        pub id: String,
        pub sent: SentLog,
    }

    impl OutputPort for FakePort {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn name(&self) -> String {
            format!("Fake {}", self.id)
        }

        fn send(&mut self, message: &[u8]) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((self.id.clone(), message.to_vec()));
            Ok(())
        }
    }

    /// Hands out fresh fake ports with the given ids, all logging into one shared list.
    pub struct FakeAccess {
        pub ids: Vec<String>,
        pub denied: bool,
        pub sent: SentLog,
    }

    impl FakeAccess {
        pub fn with_ports(ids: &[&str]) -> Self {
            Self {
                ids: ids.iter().map(|id| id.to_string()).collect(),
                denied: false,
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn denied() -> Self {
            Self {
                denied: true,
                ..Self::with_ports(&[])
            }
        }

        pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl MidiAccess for FakeAccess {
        fn request_outputs(&self) -> Result<Vec<Box<dyn OutputPort>>> {
            if self.denied {
                return Err(Error::MidiOutput("permission denied".into()));
            }

            Ok(self
                .ids
                .iter()
                .map(|id| {
                    Box::new(FakePort {
                        id: id.clone(),
                        sent: Arc::clone(&self.sent),
                    }) as Box<dyn OutputPort>
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod test {
    use super::testing::FakeAccess;
    use super::*;
    use crate::engine::scheduler::build_scheduled_events;
    use crate::model::note::NoteEvent;
    use std::thread;
    use std::time::Duration;

    fn events() -> Vec<ScheduledEvent> {
        build_scheduled_events(
            &[
                NoteEvent::new("a", 60, 0.0, 0.1, 0.5),
                NoteEvent::new("b", 64, 0.1, 0.1, 1.0),
            ],
            120.0,
        )
    }

    #[test]
    fn detects_every_state() {
        assert_eq!(detect_midi_support(None), MidiOutputState::Unsupported);
        assert_eq!(
            detect_midi_support(Some(&FakeAccess::with_ports(&[]))),
            MidiOutputState::NoOutput
        );
        assert_eq!(
            detect_midi_support(Some(&FakeAccess::denied())),
            MidiOutputState::PermissionDenied
        );
        assert_eq!(
            detect_midi_support(Some(&FakeAccess::with_ports(&["x"]))),
            MidiOutputState::Supported
        );
    }

    #[test]
    fn message_bytes() {
        let loud = &build_scheduled_events(&[NoteEvent::new("n", 300, 0.0, 1.0, 2.0)], 120.0)[0];
        assert_eq!(note_on_message(loud), [0x90, 127, 127]);
        assert_eq!(note_off_message(loud), [0x80, 127, 0]);

        let soft = &build_scheduled_events(&[NoteEvent::new("n", 60, 0.0, 1.0, 0.5)], 120.0)[0];
        assert_eq!(note_on_message(soft), [0x90, 60, 64]);
    }

    #[test]
    fn attach_prefers_requested_id() {
        let access = FakeAccess::with_ports(&["one", "two"]);
        let mirror = MidiMirror::new();

        assert_eq!(
            mirror.attach(Some(&access), Some("two")),
            MidiOutputState::Supported
        );
        mirror.schedule(&events()[..1]).unwrap();
        thread::sleep(Duration::from_millis(200));

        let sent = access.sent();
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|(id, _)| id == "two"));

        let fallback = FakeAccess::with_ports(&["one", "two"]);
        mirror.attach(Some(&fallback), Some("missing"));
        mirror.schedule(&events()[..1]).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(fallback.sent()[0].0, "one");
    }

    #[test]
    fn mirrors_schedule_in_order() {
        env_logger::try_init().unwrap_or(());

        let access = FakeAccess::with_ports(&["out"]);
        let mirror = MidiMirror::new();
        mirror.attach(Some(&access), None);

        mirror.schedule(&events()).unwrap();
        thread::sleep(Duration::from_millis(300));

        let messages: Vec<Vec<u8>> = access.sent().into_iter().map(|(_, m)| m).collect();
        assert_eq!(
            messages,
            vec![
                vec![0x90, 60, 64],
                vec![0x80, 60, 0],
                vec![0x90, 64, 127],
                vec![0x80, 64, 0],
            ]
        );
    }

    #[test]
    fn clear_cancels_pending_messages() {
        let access = FakeAccess::with_ports(&["out"]);
        let mirror = MidiMirror::new();
        mirror.attach(Some(&access), None);

        let late = build_scheduled_events(&[NoteEvent::new("late", 60, 0.5, 0.5, 0.8)], 120.0);
        mirror.schedule(&late).unwrap();
        mirror.clear().unwrap();

        thread::sleep(Duration::from_millis(400));
        assert!(access.sent().is_empty());
    }

    #[test]
    fn clear_releases_held_keys() {
        let access = FakeAccess::with_ports(&["out"]);
        let mirror = MidiMirror::new();
        mirror.attach(Some(&access), None);

        let notes = vec![
            NoteEvent::new("short", 60, 0.0, 0.1, 0.8),
            NoteEvent::new("long", 64, 0.0, 8.0, 0.8),
            NoteEvent::new("late", 67, 4.0, 1.0, 0.8),
        ];
        mirror.schedule(&build_scheduled_events(&notes, 120.0)).unwrap();
        thread::sleep(Duration::from_millis(200));
        mirror.clear().unwrap();

        let messages: Vec<Vec<u8>> = access.sent().into_iter().map(|(_, m)| m).collect();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[3], vec![0x80, 64, 0]);
        assert_eq!(messages.iter().filter(|m| m[0] == 0x80 && m[1] == 60).count(), 1);
        assert!(messages.iter().all(|m| m[1] != 67));

        mirror.clear().unwrap();
        assert_eq!(access.sent().len(), 4);
    }

    #[test]
    fn failed_attach_leaves_audio_only() {
        let mirror = MidiMirror::new();
        assert_eq!(
            mirror.attach(Some(&FakeAccess::denied()), None),
            MidiOutputState::PermissionDenied
        );
        assert_eq!(mirror.state(), MidiOutputState::PermissionDenied);
        assert!(!mirror.has_output());

        mirror.schedule(&events()).unwrap();
        assert!(!mirror.is_active());
    }
}
