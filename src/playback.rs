// Playback Engine — spec §4.8.
//
// File parsing (tempo map, tick-to-millisecond conversion) is
// grounded on `Cycl0o0-MIDI-RS/src/midi/parser.rs` — the closest pack
// example to this exact job, generalized from its per-track tempo map
// to one shared across all tracks (a type-1 file's tempo meta events
// usually live on track 0 but apply to every track's timeline). The
// scheduler state machine (tempo/volume/seek/loop, the 20ms note
// trigger tolerance, the 60fps LED-commit / 4Hz status-broadcast
// throttle) is grounded on
// `original_source/backend/playback_service.py`.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};

#[derive(Debug)]
pub enum ParseError {
    Io(std::io::Error),
    Midi(String),
    InvalidFile(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Io(e) => write!(f, "io error: {}", e),
            ParseError::Midi(e) => write!(f, "midi decode error: {}", e),
            ParseError::InvalidFile(e) => write!(f, "invalid file: {}", e),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<std::io::Error> for ParseError {
    fn from(e: std::io::Error) -> Self {
        ParseError::Io(e)
    }
}

impl From<midly::Error> for ParseError {
    fn from(e: midly::Error) -> Self {
        ParseError::Midi(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hand {
    Left,
    Right,
    Both,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub index: usize,
    pub name: Option<String>,
    pub hand: Hand,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct NoteEvent {
    pub start_ms: f64,
    pub duration_ms: f64,
    pub note: u8,
    pub velocity: u8,
    pub channel: u8,
    pub track: usize,
    pub hand: Hand,
}

impl NoteEvent {
    pub fn end_ms(&self) -> f64 {
        self.start_ms + self.duration_ms
    }
}

#[derive(Debug, Clone)]
pub struct ParsedMidi {
    pub events: Vec<NoteEvent>,
    pub tempo_default_bpm: f64,
    pub total_duration_ms: f64,
    pub track_info: Vec<TrackInfo>,
}

const DEFAULT_TEMPO_US_PER_BEAT: f64 = 500_000.0;

fn detect_hand_from_name(name: &str) -> Option<Hand> {
    let lower = name.to_lowercase();
    let left_hints = ["left", "l.h", "lh ", "bass"];
    let right_hints = ["right", "r.h", "rh ", "melody", "treble"];
    if left_hints.iter().any(|h| lower.contains(h)) {
        Some(Hand::Left)
    } else if right_hints.iter().any(|h| lower.contains(h)) {
        Some(Hand::Right)
    } else {
        None
    }
}

/// Parses raw Standard MIDI File bytes into a flat, timestamped note
/// list with per-track hand detection.
pub fn parse_bytes(data: &[u8]) -> Result<ParsedMidi, ParseError> {
    let smf = Smf::parse(data)?;

    let ticks_per_beat = match smf.header.timing {
        Timing::Metrical(tpb) => tpb.as_int() as f64,
        Timing::Timecode(fps, subframe) => (fps.as_f32() * subframe as f32) as f64,
    };
    if ticks_per_beat <= 0.0 {
        return Err(ParseError::InvalidFile("non-positive ticks-per-beat".into()));
    }

    // Tempo changes apply across the whole file's shared tick timeline,
    // even though each track's delta-times are scanned independently.
    let mut tempo_map: Vec<(u64, f64)> = vec![(0, DEFAULT_TEMPO_US_PER_BEAT)];
    for track in &smf.tracks {
        let mut tick = 0u64;
        for event in track {
            tick += event.delta.as_int() as u64;
            if let TrackEventKind::Meta(MetaMessage::Tempo(tempo)) = event.kind {
                tempo_map.push((tick, tempo.as_int() as f64));
            }
        }
    }
    tempo_map.sort_by_key(|&(tick, _)| tick);
    tempo_map.dedup_by_key(|&mut (tick, _)| tick);

    let ticks_to_ms = |tick: u64| -> f64 {
        let mut ms = 0.0;
        let mut last_tick = 0u64;
        let mut last_tempo = DEFAULT_TEMPO_US_PER_BEAT;
        for &(tempo_tick, tempo) in &tempo_map {
            if tempo_tick > tick {
                break;
            }
            let delta_ticks = (tempo_tick - last_tick) as f64;
            ms += (delta_ticks / ticks_per_beat) * (last_tempo / 1000.0);
            last_tick = tempo_tick;
            last_tempo = tempo;
        }
        let delta_ticks = (tick - last_tick) as f64;
        ms += (delta_ticks / ticks_per_beat) * (last_tempo / 1000.0);
        ms
    };

    let mut all_events = Vec::new();
    let mut track_info = Vec::with_capacity(smf.tracks.len());

    for (track_idx, track) in smf.tracks.iter().enumerate() {
        let mut track_name: Option<String> = None;
        let mut active: std::collections::HashMap<(u8, u8), (u64, u8)> = std::collections::HashMap::new();
        let mut track_events: Vec<NoteEvent> = Vec::new();
        let mut tick = 0u64;

        for event in track {
            tick += event.delta.as_int() as u64;
            match event.kind {
                TrackEventKind::Meta(MetaMessage::TrackName(name)) => {
                    track_name = Some(String::from_utf8_lossy(name).trim().to_string());
                }
                TrackEventKind::Midi { channel, message } => {
                    let channel = channel.as_int();
                    match message {
                        MidiMessage::NoteOn { key, vel } => {
                            let note = key.as_int();
                            let velocity = vel.as_int();
                            if velocity > 0 {
                                active.insert((note, channel), (tick, velocity));
                            } else if let Some((start_tick, vel)) = active.remove(&(note, channel)) {
                                let start_ms = ticks_to_ms(start_tick);
                                let duration_ms = (ticks_to_ms(tick) - start_ms).max(0.0);
                                track_events.push(NoteEvent {
                                    start_ms,
                                    duration_ms,
                                    note,
                                    velocity: vel,
                                    channel,
                                    track: track_idx,
                                    hand: Hand::Unknown,
                                });
                            }
                        }
                        MidiMessage::NoteOff { key, .. } => {
                            let note = key.as_int();
                            if let Some((start_tick, vel)) = active.remove(&(note, channel)) {
                                let start_ms = ticks_to_ms(start_tick);
                                let duration_ms = (ticks_to_ms(tick) - start_ms).max(0.0);
                                track_events.push(NoteEvent {
                                    start_ms,
                                    duration_ms,
                                    note,
                                    velocity: vel,
                                    channel,
                                    track: track_idx,
                                    hand: Hand::Unknown,
                                });
                            }
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        // Notes left open at end-of-track get a default 100ms duration.
        for ((note, channel), (start_tick, velocity)) in active {
            let start_ms = ticks_to_ms(start_tick);
            track_events.push(NoteEvent {
                start_ms,
                duration_ms: 100.0,
                note,
                velocity,
                channel,
                track: track_idx,
                hand: Hand::Unknown,
            });
        }

        if track_events.is_empty() {
            if let Some(name) = &track_name {
                track_info.push(TrackInfo {
                    index: track_idx,
                    name: Some(name.clone()),
                    hand: Hand::Unknown,
                    confidence: 0.0,
                });
            }
            continue;
        }

        let (hand, confidence) = if let Some(name) = &track_name {
            match detect_hand_from_name(name) {
                Some(h) => (h, 1.0),
                None => hand_by_note_range(&track_events),
            }
        } else {
            hand_by_note_range(&track_events)
        };

        for event in track_events.iter_mut() {
            event.hand = hand;
        }

        track_info.push(TrackInfo {
            index: track_idx,
            name: track_name,
            hand,
            confidence,
        });
        all_events.extend(track_events);
    }

    all_events.sort_by(|a, b| a.start_ms.partial_cmp(&b.start_ms).unwrap());

    let total_duration_ms = all_events
        .iter()
        .map(|e| e.end_ms())
        .fold(0.0f64, f64::max);

    let tempo_default_bpm = 60_000_000.0 / DEFAULT_TEMPO_US_PER_BEAT;

    Ok(ParsedMidi {
        events: all_events,
        tempo_default_bpm,
        total_duration_ms,
        track_info,
    })
}

/// Note-range-vs-middle-C fallback, then channel hint, then (by the
/// time this is reached there's nothing left to discriminate on, so)
/// track-index parity as a last resort — matches spec.md §4.8's
/// priority list.
fn hand_by_note_range(events: &[NoteEvent]) -> (Hand, f64) {
    if events.is_empty() {
        return (Hand::Unknown, 0.0);
    }
    let avg_note: f64 = events.iter().map(|e| e.note as f64).sum::<f64>() / events.len() as f64;
    if (avg_note - 60.0).abs() > 3.0 {
        return if avg_note < 60.0 {
            (Hand::Left, 0.6)
        } else {
            (Hand::Right, 0.6)
        };
    }

    let channels: std::collections::HashSet<u8> = events.iter().map(|e| e.channel).collect();
    if channels.len() == 1 {
        let channel = *channels.iter().next().unwrap();
        if channel == 0 {
            return (Hand::Right, 0.4);
        } else if channel == 1 {
            return (Hand::Left, 0.4);
        }
    }

    let track = events[0].track;
    if track % 2 == 0 {
        (Hand::Right, 0.2)
    } else {
        (Hand::Left, 0.2)
    }
}

pub fn parse_file(path: &Path) -> Result<ParsedMidi, ParseError> {
    let data = std::fs::read(path)?;
    parse_bytes(&data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Stopped,
    Error,
}

#[derive(Debug, Clone)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub current_time_s: f64,
    pub total_duration_s: f64,
    pub filename: Option<String>,
    pub progress: f64,
    pub tempo: f64,
    pub volume: f64,
    pub loop_enabled: bool,
    pub loop_start_s: f64,
    pub loop_end_s: f64,
}

/// One scheduler tick's output: LEDs to turn on/off this cycle.
#[derive(Debug, Clone)]
pub enum PlaybackTickEvent {
    NoteOn { note: u8, velocity: u8, channel: u8 },
    NoteOff { note: u8, channel: u8 },
}

const NOTE_TRIGGER_TOLERANCE_S: f64 = 0.02;
const MIN_TEMPO: f64 = 0.1;
const MAX_TEMPO: f64 = 4.0;

/// A raw-bytes sink for the optional MIDI echo path (spec §4.8). Kept
/// as a plain callback rather than a concrete `midir` type so the
/// scheduler doesn't need to know about port lifecycles.
pub type MidiSender = Box<dyn Fn(&[u8]) + Send>;

struct Inner {
    parsed: Option<ParsedMidi>,
    filename: Option<String>,
    state: PlaybackState,
    tempo_multiplier: f64,
    volume_multiplier: f64,
    start_epoch: Option<Instant>,
    paused_at_s: f64,
    loop_enabled: bool,
    loop_start_s: f64,
    loop_end_s: f64,
    active_notes: std::collections::HashMap<u8, f64>,
    /// `note -> channel` for notes currently forwarded to the MIDI
    /// echo output, so a note-off can be sent on the same channel it
    /// was opened on.
    forwarded_notes: std::collections::HashMap<u8, u8>,
    midi_out: Option<MidiSender>,
}

/// Sends note-off for every still-forwarded note and clears the set —
/// shared by natural end-of-timeline, loop-jump, and `stop()`/error,
/// matching spec §4.8: "On stop or error, emit note_off for every note
/// that was forwarded."
fn flush_forwarded(inner: &mut Inner) {
    let notes: Vec<(u8, u8)> = inner.forwarded_notes.drain().collect();
    if let Some(sender) = inner.midi_out.as_ref() {
        for (note, channel) in notes {
            sender(&[0x80 | (channel & 0x0F), note, 0]);
        }
    }
}

/// Schedules note-on/note-off events against a monotonic host clock
/// (never wall-clock), independent of any learning-mode gating —
/// `learning::Gate` observes `current_time_s()` and decides whether
/// the caller should hold the scheduler at its current position.
pub struct PlaybackEngine {
    inner: Mutex<Inner>,
}

impl PlaybackEngine {
    pub fn new() -> Self {
        PlaybackEngine {
            inner: Mutex::new(Inner {
                parsed: None,
                filename: None,
                state: PlaybackState::Idle,
                tempo_multiplier: 1.0,
                volume_multiplier: 1.0,
                start_epoch: None,
                paused_at_s: 0.0,
                loop_enabled: false,
                loop_start_s: 0.0,
                loop_end_s: 0.0,
                active_notes: std::collections::HashMap::new(),
                forwarded_notes: std::collections::HashMap::new(),
                midi_out: None,
            }),
        }
    }

    /// Installs (or clears, with `None`) the MIDI echo sink. Absence
    /// is non-fatal: forwarding is simply skipped (spec §6, "MIDI
    /// output driver... absence is non-fatal").
    pub fn set_midi_out(&self, sender: Option<MidiSender>) {
        self.inner.lock().unwrap().midi_out = sender;
    }

    pub fn volume_multiplier(&self) -> f64 {
        self.inner.lock().unwrap().volume_multiplier
    }

    pub fn load(&self, parsed: ParsedMidi, filename: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.filename = Some(filename.into());
        inner.parsed = Some(parsed);
        inner.state = PlaybackState::Idle;
        inner.start_epoch = None;
        inner.paused_at_s = 0.0;
        inner.active_notes.clear();
        flush_forwarded(&mut inner);
    }

    pub fn play(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.parsed.is_none() {
            inner.state = PlaybackState::Error;
            return;
        }
        let resume_from = inner.paused_at_s;
        inner.start_epoch = Some(Instant::now() - Self::duration_for(resume_from, inner.tempo_multiplier));
        inner.state = PlaybackState::Playing;
    }

    pub fn pause(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == PlaybackState::Playing {
            inner.paused_at_s = self.current_time_locked(&inner);
            inner.state = PlaybackState::Paused;
        }
    }

    pub fn resume(&self) {
        self.play();
    }

    pub fn stop(&self) -> Vec<PlaybackTickEvent> {
        let mut inner = self.inner.lock().unwrap();
        inner.state = PlaybackState::Stopped;
        inner.start_epoch = None;
        inner.paused_at_s = 0.0;
        let turned_off: Vec<PlaybackTickEvent> = inner
            .active_notes
            .keys()
            .map(|&note| PlaybackTickEvent::NoteOff { note, channel: 0 })
            .collect();
        inner.active_notes.clear();
        flush_forwarded(&mut inner);
        turned_off
    }

    pub fn seek_to(&self, time_s: f64) {
        let mut inner = self.inner.lock().unwrap();
        let total = inner.parsed.as_ref().map(|p| p.total_duration_ms / 1000.0).unwrap_or(0.0);
        let clamped = time_s.clamp(0.0, total);
        inner.active_notes.clear();
        if inner.state == PlaybackState::Playing {
            inner.start_epoch = Some(Instant::now() - Self::duration_for(clamped, inner.tempo_multiplier));
        } else {
            inner.paused_at_s = clamped;
        }
    }

    pub fn set_tempo(&self, multiplier: f64) {
        let mut inner = self.inner.lock().unwrap();
        let clamped = multiplier.clamp(MIN_TEMPO, MAX_TEMPO);
        if inner.state == PlaybackState::Playing {
            let current = self.current_time_locked(&inner);
            inner.tempo_multiplier = clamped;
            inner.start_epoch = Some(Instant::now() - Self::duration_for(current, clamped));
        } else {
            inner.tempo_multiplier = clamped;
        }
    }

    pub fn set_volume(&self, multiplier: f64) {
        self.inner.lock().unwrap().volume_multiplier = multiplier.clamp(0.0, 1.0);
    }

    pub fn set_loop(&self, enabled: bool, start_s: f64, end_s: f64) {
        let mut inner = self.inner.lock().unwrap();
        let total = inner.parsed.as_ref().map(|p| p.total_duration_ms / 1000.0).unwrap_or(0.0);
        let clamped_start = start_s.clamp(0.0, total);
        let clamped_end = end_s.clamp(clamped_start + 1.0, total.max(clamped_start + 1.0));
        inner.loop_enabled = enabled;
        inner.loop_start_s = clamped_start;
        inner.loop_end_s = clamped_end;
    }

    fn duration_for(time_s: f64, tempo_multiplier: f64) -> std::time::Duration {
        let wall_secs = if tempo_multiplier > 0.0 {
            time_s / tempo_multiplier
        } else {
            0.0
        };
        std::time::Duration::from_secs_f64(wall_secs.max(0.0))
    }

    fn current_time_locked(&self, inner: &Inner) -> f64 {
        match (inner.state, inner.start_epoch) {
            (PlaybackState::Playing, Some(epoch)) => epoch.elapsed().as_secs_f64() * inner.tempo_multiplier,
            _ => inner.paused_at_s,
        }
    }

    pub fn current_time_s(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        self.current_time_locked(&inner)
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.lock().unwrap().state
    }

    pub fn status(&self) -> PlaybackStatus {
        let inner = self.inner.lock().unwrap();
        let total = inner.parsed.as_ref().map(|p| p.total_duration_ms / 1000.0).unwrap_or(0.0);
        let current = self.current_time_locked(&inner);
        PlaybackStatus {
            state: inner.state,
            current_time_s: current,
            total_duration_s: total,
            filename: inner.filename.clone(),
            progress: if total > 0.0 { (current / total).clamp(0.0, 1.0) } else { 0.0 },
            tempo: inner.tempo_multiplier,
            volume: inner.volume_multiplier,
            loop_enabled: inner.loop_enabled,
            loop_start_s: inner.loop_start_s,
            loop_end_s: inner.loop_end_s,
        }
    }

    /// Advances the scheduler one poll cycle: triggers any event
    /// within the 20ms tolerance window, expires active notes whose
    /// time has passed, and handles loop-jump/natural-end. Returns
    /// the LED-relevant events for this tick, in trigger order
    /// (note-offs before note-ons, matching a clean handoff when a
    /// note retriggers exactly at a loop boundary).
    pub fn tick(&self) -> Vec<PlaybackTickEvent> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != PlaybackState::Playing {
            return Vec::new();
        }
        let Some(parsed) = inner.parsed.clone() else {
            return Vec::new();
        };

        let mut current_time_s = self.current_time_locked(&inner);
        let total_s = parsed.total_duration_ms / 1000.0;
        let mut events = Vec::new();

        if inner.loop_enabled && current_time_s >= inner.loop_end_s {
            events.extend(
                inner
                    .active_notes
                    .keys()
                    .map(|&note| PlaybackTickEvent::NoteOff { note, channel: 0 }),
            );
            inner.active_notes.clear();
            flush_forwarded(&mut inner);
            let start = inner.loop_start_s;
            let tempo = inner.tempo_multiplier;
            inner.start_epoch = Some(Instant::now() - Self::duration_for(start, tempo));
            current_time_s = start;
        } else if current_time_s >= total_s {
            events.extend(
                inner
                    .active_notes
                    .keys()
                    .map(|&note| PlaybackTickEvent::NoteOff { note, channel: 0 }),
            );
            inner.active_notes.clear();
            flush_forwarded(&mut inner);
            inner.state = PlaybackState::Stopped;
            return events;
        }

        let volume = inner.volume_multiplier;
        let expired: Vec<u8> = inner
            .active_notes
            .iter()
            .filter(|&(_, &expiry)| current_time_s >= expiry)
            .map(|(&note, _)| note)
            .collect();
        for note in expired {
            inner.active_notes.remove(&note);
            if let Some(channel) = inner.forwarded_notes.remove(&note) {
                if let Some(sender) = inner.midi_out.as_ref() {
                    sender(&[0x80 | (channel & 0x0F), note, 0]);
                }
            }
            events.push(PlaybackTickEvent::NoteOff { note, channel: 0 });
        }

        for event in &parsed.events {
            let start_s = event.start_ms / 1000.0;
            if (start_s - current_time_s).abs() < NOTE_TRIGGER_TOLERANCE_S
                && !inner.active_notes.contains_key(&event.note)
            {
                let end_s = start_s + event.duration_ms / 1000.0;
                inner.active_notes.insert(event.note, end_s);

                // True velocity drives LED brightness (via the event
                // processor's velocity curve); the MIDI echo gets its
                // own volume-scaled velocity, kept separate so the two
                // effects don't compound on one value.
                if let Some(sender) = inner.midi_out.as_ref() {
                    let echo_velocity =
                        ((event.velocity as f64 * volume).round() as u8).max(if volume > 0.0 { 1 } else { 0 });
                    sender(&[0x90 | (event.channel & 0x0F), event.note, echo_velocity]);
                    inner.forwarded_notes.insert(event.note, event.channel);
                }

                events.push(PlaybackTickEvent::NoteOn {
                    note: event.note,
                    velocity: event.velocity,
                    channel: event.channel,
                });
            }
        }

        events
    }
}

impl Default for PlaybackEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_parsed() -> ParsedMidi {
        ParsedMidi {
            events: vec![
                NoteEvent {
                    start_ms: 0.0,
                    duration_ms: 200.0,
                    note: 60,
                    velocity: 100,
                    channel: 0,
                    track: 0,
                    hand: Hand::Right,
                },
                NoteEvent {
                    start_ms: 500.0,
                    duration_ms: 200.0,
                    note: 64,
                    velocity: 90,
                    channel: 0,
                    track: 0,
                    hand: Hand::Right,
                },
            ],
            tempo_default_bpm: 120.0,
            total_duration_ms: 700.0,
            track_info: vec![],
        }
    }

    #[test]
    fn hand_detection_from_track_name() {
        assert_eq!(detect_hand_from_name("Left Hand"), Some(Hand::Left));
        assert_eq!(detect_hand_from_name("RH Melody"), Some(Hand::Right));
        assert_eq!(detect_hand_from_name("Piano"), None);
    }

    #[test]
    fn set_tempo_preserves_current_time() {
        let engine = PlaybackEngine::new();
        engine.load(sample_parsed(), "test.mid");
        engine.play();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let before = engine.current_time_s();
        engine.set_tempo(2.0);
        let after = engine.current_time_s();
        assert!((before - after).abs() < 0.05);
    }

    #[test]
    fn seek_clamps_to_duration() {
        let engine = PlaybackEngine::new();
        engine.load(sample_parsed(), "test.mid");
        engine.seek_to(-10.0);
        assert_eq!(engine.current_time_s(), 0.0);
        engine.seek_to(999.0);
        assert_eq!(engine.current_time_s(), 0.7);
    }

    #[test]
    fn set_volume_clamps_to_unit_range() {
        let engine = PlaybackEngine::new();
        engine.set_volume(5.0);
        assert_eq!(engine.status().volume, 1.0);
        engine.set_volume(-1.0);
        assert_eq!(engine.status().volume, 0.0);
    }

    #[test]
    fn tick_is_empty_when_not_playing() {
        let engine = PlaybackEngine::new();
        engine.load(sample_parsed(), "test.mid");
        assert!(engine.tick().is_empty());
    }

    #[test]
    fn stop_emits_note_off_for_all_active_notes() {
        let engine = PlaybackEngine::new();
        engine.load(sample_parsed(), "test.mid");
        engine.play();
        // Force an active note directly through a tick at time ~0.
        engine.tick();
        let events = engine.stop();
        assert!(!events.is_empty());
        assert_eq!(engine.state(), PlaybackState::Stopped);
    }
}
