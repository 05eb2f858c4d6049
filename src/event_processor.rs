// Event Processor — spec §4.7.
//
// Stateless-per-call transform plus an active-note table. Decodes raw
// MIDI bytes, resolves LEDs through the canonical mapping snapshot,
// derives color/brightness via the fixed wheel, and hands the caller
// a `ProcessedEvent` to push through the arbiter. Note-color table and
// active-note semantics grounded on
// `original_source/backend/midi/midi_event_processor.py`
// (`_handle_note_on`/`_handle_note_off`); the LED-write shape follows
// the teacher's `renderer.rs::render_midi_to_leds`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;

use crate::arbiter::{Arbiter, Producer};
use crate::color::{self, Rgb};
use crate::mapping::CanonicalMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NoteOn,
    NoteOff,
}

#[derive(Debug, Clone)]
pub struct ProcessedEvent {
    pub kind: EventKind,
    pub note: u8,
    pub velocity: u8,
    pub channel: u8,
    pub led_indices: Vec<u16>,
}

#[derive(Debug, Clone, Copy)]
enum DecodedMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    PolyTouch { channel: u8, note: u8 },
    ControlChange,
    Other,
}

fn decode_message(message: &[u8]) -> Option<DecodedMessage> {
    if message.len() < 2 {
        return None;
    }
    let status = message[0];
    let channel = status & 0x0F;
    let kind = status & 0xF0;
    let note = message[1];

    match kind {
        0x90 => {
            let velocity = *message.get(2).unwrap_or(&0);
            if velocity > 0 {
                Some(DecodedMessage::NoteOn {
                    channel,
                    note,
                    velocity,
                })
            } else {
                Some(DecodedMessage::NoteOff { channel, note })
            }
        }
        0x80 => Some(DecodedMessage::NoteOff { channel, note }),
        0xA0 => Some(DecodedMessage::PolyTouch { channel, note }),
        0xB0 => Some(DecodedMessage::ControlChange),
        _ => Some(DecodedMessage::Other),
    }
}

#[derive(Debug, Clone)]
struct ActiveNote {
    velocity: u8,
    #[allow(dead_code)]
    since: Instant,
    led_indices: Vec<u16>,
    color: Rgb,
}

/// Holds the active-note table and a rebindable reference to the
/// current canonical mapping snapshot.
pub struct EventProcessor {
    snapshot: Mutex<Arc<CanonicalMap>>,
    active: Mutex<HashMap<u8, ActiveNote>>,
}

impl EventProcessor {
    pub fn new(snapshot: Arc<CanonicalMap>) -> Self {
        EventProcessor {
            snapshot: Mutex::new(snapshot),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Rebinds to a fresh canonical mapping after a settings change
    /// and clears the active-note table, matching spec §4.7's
    /// "refresh on settings change" rule.
    pub fn rebind(&self, snapshot: Arc<CanonicalMap>) {
        *self.snapshot.lock().unwrap() = snapshot;
        self.active.lock().unwrap().clear();
    }

    pub fn active_note_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    fn resolve_leds(&self, note: u8) -> Vec<u16> {
        self.snapshot
            .lock()
            .unwrap()
            .leds_for_note(note)
            .map(|s| s.to_vec())
            .unwrap_or_default()
    }

    /// Decodes `message` and updates the active-note table. Returns
    /// `None` for control-change/other messages the processor ignores.
    pub fn process(&self, message: &[u8], timestamp: Instant) -> Option<ProcessedEvent> {
        match decode_message(message)? {
            DecodedMessage::NoteOn {
                channel,
                note,
                velocity,
            } => Some(self.handle_note_on(note, velocity, channel, timestamp)),
            DecodedMessage::NoteOff { channel, note } => Some(self.handle_note_off(note, channel)),
            DecodedMessage::PolyTouch { channel, note } => Some(self.handle_note_off(note, channel)),
            DecodedMessage::ControlChange | DecodedMessage::Other => None,
        }
    }

    fn handle_note_on(&self, note: u8, velocity: u8, channel: u8, timestamp: Instant) -> ProcessedEvent {
        let led_indices = self.resolve_leds(note);
        let final_color = color::color_for_note_on(note, velocity);

        self.active.lock().unwrap().insert(
            note,
            ActiveNote {
                velocity,
                since: timestamp,
                led_indices: led_indices.clone(),
                color: final_color,
            },
        );

        ProcessedEvent {
            kind: EventKind::NoteOn,
            note,
            velocity,
            channel,
            led_indices,
        }
    }

    fn handle_note_off(&self, note: u8, channel: u8) -> ProcessedEvent {
        let led_indices = match self.active.lock().unwrap().remove(&note) {
            Some(entry) => entry.led_indices,
            None => self.resolve_leds(note),
        };

        ProcessedEvent {
            kind: EventKind::NoteOff,
            note,
            velocity: 0,
            channel,
            led_indices,
        }
    }

    /// Resolves `note`'s LEDs through the canonical mapping and writes
    /// them under `producer` — shared by the playback scheduler
    /// (`Producer::Playback`), which needs the same "note -> LEDs ->
    /// color" resolution as live MIDI but without an active-note table
    /// of its own or raw bytes to decode.
    pub fn commit_note(
        &self,
        note: u8,
        on: bool,
        velocity: u8,
        producer: Producer,
        arbiter: &Arbiter,
    ) -> Result<bool> {
        self.commit_note_with_volume(note, on, velocity, 1.0, producer, arbiter)
    }

    /// Same as `commit_note`, but applies `volume` as a final
    /// multiplicative step on the resolved color (spec §4.8/§4.10:
    /// volume scales LED brightness separately from, and after, the
    /// velocity-to-brightness curve — not by pre-scaling velocity
    /// before it reaches that curve).
    pub fn commit_note_with_volume(
        &self,
        note: u8,
        on: bool,
        velocity: u8,
        volume: f64,
        producer: Producer,
        arbiter: &Arbiter,
    ) -> Result<bool> {
        let led_indices = self.resolve_leds(note);
        let pixels: Vec<(usize, u8, u8, u8)> = if on {
            let color = color::apply_brightness(color::color_for_note_on(note, velocity), volume);
            led_indices
                .iter()
                .map(|&l| (l as usize, color.r, color.g, color.b))
                .collect()
        } else {
            led_indices.iter().map(|&l| (l as usize, 0, 0, 0)).collect()
        };
        arbiter.commit(producer, &pixels)
    }

    /// Writes `event`'s LEDs (lit for note_on, dark for note_off) and
    /// commits a frame, subject to the arbiter's current owner.
    pub fn render_and_commit(&self, event: &ProcessedEvent, arbiter: &Arbiter) -> Result<bool> {
        let pixels: Vec<(usize, u8, u8, u8)> = match event.kind {
            EventKind::NoteOn => {
                let active = self.active.lock().unwrap();
                let color = active.get(&event.note).map(|a| a.color).unwrap_or_default();
                event
                    .led_indices
                    .iter()
                    .map(|&l| (l as usize, color.r, color.g, color.b))
                    .collect()
            }
            EventKind::NoteOff => event.led_indices.iter().map(|&l| (l as usize, 0, 0, 0)).collect(),
        };
        arbiter.commit(Producer::EventProcessor, &pixels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PhysicalParams;
    use crate::mapping::{self, AllocationMode, MappingSettings};

    fn test_snapshot() -> Arc<CanonicalMap> {
        let settings = MappingSettings {
            piano_size: crate::geometry::PianoSize::Keys88,
            physical: PhysicalParams::default(),
            leds_per_meter: 144,
            led_physical_width_mm: 5.0,
            strip_offset_mm: None,
            start_led: 0,
            end_led: 200,
            mode: AllocationMode::Physics,
            overhang_threshold_mm: 1.0,
            calibration: Default::default(),
        };
        Arc::new(mapping::build(&settings).unwrap())
    }

    #[test]
    fn note_on_records_active_note_and_resolves_leds() {
        let processor = EventProcessor::new(test_snapshot());
        let event = processor
            .process(&[0x90, 60, 100], Instant::now())
            .unwrap();
        assert_eq!(event.kind, EventKind::NoteOn);
        assert_eq!(event.note, 60);
        assert!(!event.led_indices.is_empty());
        assert_eq!(processor.active_note_count(), 1);
    }

    #[test]
    fn note_on_velocity_zero_is_treated_as_note_off() {
        let processor = EventProcessor::new(test_snapshot());
        processor.process(&[0x90, 60, 100], Instant::now());
        let event = processor.process(&[0x90, 60, 0], Instant::now()).unwrap();
        assert_eq!(event.kind, EventKind::NoteOff);
        assert_eq!(processor.active_note_count(), 0);
    }

    #[test]
    fn note_off_falls_back_to_recompute_when_not_active() {
        let processor = EventProcessor::new(test_snapshot());
        let event = processor.process(&[0x80, 60, 0], Instant::now()).unwrap();
        assert_eq!(event.kind, EventKind::NoteOff);
        assert!(!event.led_indices.is_empty());
    }

    #[test]
    fn control_change_is_ignored() {
        let processor = EventProcessor::new(test_snapshot());
        assert!(processor.process(&[0xB0, 7, 64], Instant::now()).is_none());
    }

    #[test]
    fn polytouch_triggers_note_off() {
        let processor = EventProcessor::new(test_snapshot());
        processor.process(&[0x90, 60, 100], Instant::now());
        let event = processor.process(&[0xA0, 60, 50], Instant::now()).unwrap();
        assert_eq!(event.kind, EventKind::NoteOff);
    }

    #[test]
    fn commit_note_lights_and_clears_without_touching_active_table() {
        use crate::arbiter::Arbiter;
        use crate::led_driver::SimulatedLedDriver;

        let processor = EventProcessor::new(test_snapshot());
        let arbiter = Arbiter::new(Box::new(SimulatedLedDriver::new(250)));
        arbiter.set_owner(Producer::Playback);

        let committed = processor
            .commit_note(60, true, 100, Producer::Playback, &arbiter)
            .unwrap();
        assert!(committed);
        assert_eq!(processor.active_note_count(), 0);

        let committed = processor
            .commit_note(60, false, 0, Producer::Playback, &arbiter)
            .unwrap();
        assert!(committed);
    }

    #[test]
    fn commit_note_with_volume_scales_brightness_after_the_velocity_curve() {
        use crate::arbiter::Arbiter;
        use crate::led_driver::SimulatedLedDriver;

        let processor = EventProcessor::new(test_snapshot());
        let arbiter = Arbiter::new(Box::new(SimulatedLedDriver::new(250)));
        arbiter.set_owner(Producer::Playback);

        // velocity=100 gives brightness 0.1 + 100/127*0.9 ~= 0.808; at
        // volume=0.5 the final brightness is ~0.404, not the ~0.454 a
        // pre-scaled velocity of 50 would produce.
        let expected = color::apply_brightness(color::color_for_note_on(60, 100), 0.5);
        let leds = processor.resolve_leds(60);
        assert!(!leds.is_empty());

        let committed = processor
            .commit_note_with_volume(60, true, 100, 0.5, Producer::Playback, &arbiter)
            .unwrap();
        assert!(committed);
        assert_ne!(expected, color::color_for_note_on(60, 50));
    }

    #[test]
    fn rebind_clears_active_notes() {
        let processor = EventProcessor::new(test_snapshot());
        processor.process(&[0x90, 60, 100], Instant::now());
        assert_eq!(processor.active_note_count(), 1);
        processor.rebind(test_snapshot());
        assert_eq!(processor.active_note_count(), 0);
    }
}
