// Control surface — spec §6 "Control surface (provided, transport-agnostic)".
//
// A thin, transport-agnostic wrapper the way the teacher's `httpd.rs`
// handlers wrap `BandwidthConfig` mutations: every public method here
// corresponds to one operation named in spec.md §6, takes plain
// values, and returns a `MappingResult`/`anyhow::Result` the transport
// layer (`httpd.rs`) folds into an HTTP response. Holds the one
// process-wide `Settings`, `MappingCache`, `EventProcessor`,
// `PlaybackEngine`, `LearningGate`, `MidiInputAdapter` and `Arbiter`
// instances spec.md §9 calls out as "the only process-wide objects".

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::arbiter::{Arbiter, Producer};
use crate::color::{self, Rgb};
use crate::error::{MappingError, MappingResult};
use crate::event_processor::EventProcessor;
use crate::learning::LearningGate;
use crate::mapping::MappingCache;
use crate::midi_input::{AdapterState, MidiInputAdapter, MidiOutputAdapter};
use crate::playback::{self, PlaybackEngine};
use crate::settings::{DistributionMode, Settings, SolderJointSetting};

pub struct ControlSurface {
    settings: RwLock<Settings>,
    mapping: MappingCache,
    pub event_processor: Arc<EventProcessor>,
    pub arbiter: Arc<Arbiter>,
    pub playback: PlaybackEngine,
    pub learning: LearningGate,
    pub midi: Arc<MidiInputAdapter>,
    pub midi_out: Arc<MidiOutputAdapter>,
    /// Fires whenever the canonical mapping is rebuilt, for the SSE
    /// status stream in `httpd.rs`.
    pub change_tx: broadcast::Sender<()>,
}

impl ControlSurface {
    pub fn new(settings: Settings, arbiter: Arc<Arbiter>) -> MappingResult<Arc<Self>> {
        let mapping_settings = settings.to_mapping_settings();
        let mapping = MappingCache::new(&mapping_settings)?;
        let event_processor = Arc::new(EventProcessor::new(mapping.snapshot()));
        let learning = LearningGate::new(settings.learning_gate_config());
        let (change_tx, _) = broadcast::channel(16);
        let midi_out = Arc::new(MidiOutputAdapter::new());
        let playback = PlaybackEngine::new();

        let echo_out = midi_out.clone();
        playback.set_midi_out(Some(Box::new(move |bytes: &[u8]| echo_out.send(bytes))));

        Ok(Arc::new(ControlSurface {
            settings: RwLock::new(settings),
            mapping,
            event_processor,
            arbiter,
            playback,
            learning,
            midi: Arc::new(MidiInputAdapter::new()),
            midi_out,
            change_tx,
        }))
    }

    pub fn settings_snapshot(&self) -> Settings {
        self.settings.read().unwrap().clone()
    }

    pub fn mapping_snapshot(&self) -> Arc<crate::mapping::CanonicalMap> {
        self.mapping.snapshot()
    }

    /// Rebuilds the canonical mapping from the current settings,
    /// rebinds the event processor, persists settings to disk, and
    /// notifies SSE subscribers. Spec §4.5: consumers either observe
    /// the old snapshot or the new one, never a torn state.
    fn rebuild(&self) -> MappingResult<()> {
        let settings = self.settings.read().unwrap().clone();
        let mapping_settings = settings.to_mapping_settings();
        self.mapping.rebuild(&mapping_settings)?;
        self.event_processor.rebind(self.mapping.snapshot());
        self.learning.set_config(settings.learning_gate_config());
        let _ = settings.save();
        let _ = self.change_tx.send(());
        Ok(())
    }

    fn piano_midi_start(&self) -> u8 {
        self.settings.read().unwrap().piano_size().midi_range().0
    }

    // ---- calibration.get_canonical_mapping ----

    pub fn get_canonical_mapping(&self) -> Value {
        let map = self.mapping.snapshot();
        let mut by_key = Vec::with_capacity(map.key_count());
        for k in 0..map.key_count() {
            by_key.push(map.leds_for_key(k).unwrap_or(&[]).to_vec());
        }
        json!({
            "midi_start": map.midi_start,
            "midi_end": map.midi_end,
            "key_to_leds": by_key,
            "pitch_calibration": map.pitch_calibration.as_ref().map(|p| json!({
                "was_adjusted": p.was_adjusted,
                "theoretical_pitch_mm": p.theoretical_pitch_mm,
                "calibrated_pitch_mm": p.calibrated_pitch_mm,
                "difference_mm": p.difference_mm,
                "difference_percent": p.difference_percent,
                "reason": p.reason,
            })),
            "clamp_count": map.clamp_count,
            "warnings": map.warnings.0,
        })
    }

    // ---- calibration.{set_start_led, set_end_led} ----

    pub fn set_start_led(&self, value: u16) -> MappingResult<()> {
        let mut settings = self.settings.write().unwrap();
        if value > settings.calibration.end_led {
            return Err(MappingError::invalid_input(
                "start_led",
                "must be <= end_led",
            ));
        }
        settings.calibration.start_led = value;
        drop(settings);
        self.rebuild()
    }

    pub fn set_end_led(&self, value: u16) -> MappingResult<()> {
        let mut settings = self.settings.write().unwrap();
        if value < settings.calibration.start_led {
            return Err(MappingError::invalid_input(
                "end_led",
                "must be >= start_led",
            ));
        }
        settings.calibration.end_led = value;
        drop(settings);
        self.rebuild()
    }

    // ---- calibration.{set_key_offset, delete_key_offset, set_all_key_offsets, reset_calibration} ----

    pub fn set_key_offset(&self, midi_note: u8, offset: i32) -> MappingResult<()> {
        let (lo, hi) = {
            let settings = self.settings.read().unwrap();
            settings.piano_size().midi_range()
        };
        if midi_note < lo || midi_note > hi {
            return Err(MappingError::invalid_input(
                "midi_note",
                format!("must be within [{}, {}]", lo, hi),
            ));
        }
        self.settings
            .write()
            .unwrap()
            .calibration
            .key_offsets
            .insert(midi_note.to_string(), offset);
        self.rebuild()
    }

    pub fn delete_key_offset(&self, midi_note: u8) -> MappingResult<()> {
        let removed = self
            .settings
            .write()
            .unwrap()
            .calibration
            .key_offsets
            .remove(&midi_note.to_string());
        if removed.is_none() {
            return Err(MappingError::not_found(format!(
                "no key offset set for note {}",
                midi_note
            )));
        }
        self.rebuild()
    }

    pub fn set_all_key_offsets(&self, offsets: BTreeMap<String, i32>) -> MappingResult<()> {
        self.settings.write().unwrap().calibration.key_offsets = offsets;
        self.rebuild()
    }

    pub fn reset_calibration(&self) -> MappingResult<()> {
        {
            let mut settings = self.settings.write().unwrap();
            settings.calibration.key_offsets.clear();
            settings.calibration.led_soldering_joints.clear();
            settings.calibration.led_selection_overrides.clear();
        }
        self.rebuild()
    }

    // ---- calibration.{set_distribution_mode, set_physics_parameters} ----

    pub fn set_distribution_mode(&self, mode: &str) -> MappingResult<()> {
        let parsed = match mode {
            "piano_overlap" => DistributionMode::PianoOverlap,
            "piano_no_overlap" => DistributionMode::PianoNoOverlap,
            "physics" => DistributionMode::Physics,
            "custom" => DistributionMode::Custom,
            other => {
                return Err(MappingError::invalid_input(
                    "distribution_mode",
                    format!("unknown mode '{}'", other),
                ))
            }
        };
        self.settings.write().unwrap().calibration.distribution_mode = parsed;
        self.rebuild()
    }

    pub fn set_physics_parameters(
        &self,
        white_key_width: Option<f32>,
        black_key_width: Option<f32>,
        white_key_gap: Option<f32>,
        led_physical_width: Option<f32>,
        overhang_threshold_mm: Option<f32>,
    ) -> MappingResult<()> {
        {
            let mut settings = self.settings.write().unwrap();
            if let Some(v) = white_key_width {
                settings.calibration.white_key_width = v;
            }
            if let Some(v) = black_key_width {
                settings.calibration.black_key_width = v;
            }
            if let Some(v) = white_key_gap {
                settings.calibration.white_key_gap = v;
            }
            if let Some(v) = led_physical_width {
                settings.calibration.led_physical_width = v;
            }
            if let Some(v) = overhang_threshold_mm {
                settings.calibration.led_overhang_threshold = v;
            }
            settings.sanitize();
        }
        self.rebuild()
    }

    // ---- calibration.soldering_joints.* ----

    pub fn joints_list(&self) -> BTreeMap<String, SolderJointSetting> {
        self.settings.read().unwrap().calibration.led_soldering_joints.clone()
    }

    pub fn joints_get(&self, led_index: u16) -> MappingResult<SolderJointSetting> {
        self.settings
            .read()
            .unwrap()
            .calibration
            .led_soldering_joints
            .get(&led_index.to_string())
            .cloned()
            .ok_or_else(|| MappingError::not_found(format!("no solder joint at LED {}", led_index)))
    }

    pub fn joints_set(
        &self,
        led_index: u16,
        width_mm: f64,
        offset_mm: f64,
        description: Option<String>,
    ) -> MappingResult<()> {
        let joint = Settings::new_solder_joint(width_mm, offset_mm, description);
        self.settings
            .write()
            .unwrap()
            .calibration
            .led_soldering_joints
            .insert(led_index.to_string(), joint);
        self.rebuild()
    }

    pub fn joints_delete(&self, led_index: u16) -> MappingResult<()> {
        let removed = self
            .settings
            .write()
            .unwrap()
            .calibration
            .led_soldering_joints
            .remove(&led_index.to_string());
        if removed.is_none() {
            return Err(MappingError::not_found(format!("no solder joint at LED {}", led_index)));
        }
        self.rebuild()
    }

    /// `mode == "replace"` discards existing joints first; `"append"`
    /// merges into the current set (later entries win on key clash).
    pub fn joints_bulk_set(&self, mode: &str, joints: BTreeMap<String, SolderJointSetting>) -> MappingResult<()> {
        if mode != "replace" && mode != "append" {
            return Err(MappingError::invalid_input("mode", "must be 'replace' or 'append'"));
        }
        {
            let mut settings = self.settings.write().unwrap();
            if mode == "replace" {
                settings.calibration.led_soldering_joints = joints;
            } else {
                settings.calibration.led_soldering_joints.extend(joints);
            }
        }
        self.rebuild()
    }

    pub fn joints_clear_all(&self) -> MappingResult<()> {
        self.settings.write().unwrap().calibration.led_soldering_joints.clear();
        self.rebuild()
    }

    /// `from`/`to` are one of `"mm"` or `"led"`, converted at the
    /// current (density-derived, not a fixed constant) joint pitch.
    pub fn joints_convert(&self, value: f64, from: &str, to: &str) -> MappingResult<f64> {
        let pitch_mm = 1000.0 / self.settings.read().unwrap().led.leds_per_meter as f64;
        let mm = match from {
            "mm" => value,
            "led" => value * pitch_mm,
            other => return Err(MappingError::invalid_input("from", format!("unknown unit '{}'", other))),
        };
        match to {
            "mm" => Ok(mm),
            "led" => Ok(mm / pitch_mm),
            other => Err(MappingError::invalid_input("to", format!("unknown unit '{}'", other))),
        }
    }

    pub fn joints_validate(&self, width_mm: f64, offset_mm: f64) -> Vec<String> {
        let mut issues = Vec::new();
        if width_mm <= 0.0 {
            issues.push("width_mm must be positive".to_string());
        }
        if offset_mm.abs() > 100.0 {
            issues.push("offset_mm magnitude is implausibly large (>100mm)".to_string());
        }
        issues
    }

    // ---- calibration.led_selection.* ----

    pub fn selection_get(&self, midi_note: u8) -> Option<Vec<u16>> {
        self.settings
            .read()
            .unwrap()
            .calibration
            .led_selection_overrides
            .get(&midi_note.to_string())
            .cloned()
    }

    pub fn selection_set(&self, midi_note: u8, leds: Vec<u16>) -> MappingResult<()> {
        self.settings
            .write()
            .unwrap()
            .calibration
            .led_selection_overrides
            .insert(midi_note.to_string(), leds);
        self.rebuild()
    }

    pub fn selection_clear(&self, midi_note: u8) -> MappingResult<()> {
        self.settings
            .write()
            .unwrap()
            .calibration
            .led_selection_overrides
            .remove(&midi_note.to_string());
        self.rebuild()
    }

    pub fn selection_toggle(&self, midi_note: u8, led_index: u16) -> MappingResult<()> {
        {
            let mut settings = self.settings.write().unwrap();
            let key = midi_note.to_string();
            let current = settings
                .calibration
                .led_selection_overrides
                .entry(key)
                .or_insert_with(|| {
                    self.mapping
                        .snapshot()
                        .leds_for_key((midi_note as i32 - self.piano_midi_start() as i32).max(0) as usize)
                        .map(|s| s.to_vec())
                        .unwrap_or_default()
                });
            match current.iter().position(|&l| l == led_index) {
                Some(pos) => {
                    current.remove(pos);
                }
                None => {
                    current.push(led_index);
                    current.sort_unstable();
                }
            }
        }
        self.rebuild()
    }

    pub fn selection_get_all(&self) -> BTreeMap<String, Vec<u16>> {
        self.settings.read().unwrap().calibration.led_selection_overrides.clone()
    }

    pub fn selection_clear_all(&self) -> MappingResult<()> {
        self.settings.write().unwrap().calibration.led_selection_overrides.clear();
        self.rebuild()
    }

    // ---- calibration.test_led ----

    /// Lights a single LED cyan for 3 seconds, bypassing the arbiter's
    /// precedence gate via a direct `Producer::EventProcessor` commit
    /// (test pulses behave like any keyboard-triggered write).
    pub fn test_led(&self, index: usize) -> Result<()> {
        let arbiter = self.arbiter.clone();
        arbiter.commit(Producer::EventProcessor, &[(index, 0, 255, 255)])?;
        let arbiter = self.arbiter.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(3));
            let _ = arbiter.commit(Producer::EventProcessor, &[(index, 0, 0, 0)]);
        });
        Ok(())
    }

    // ---- playback.* ----

    pub fn playback_load(&self, path: &Path) -> Result<()> {
        let parsed = playback::parse_file(path)?;
        self.learning.load(&parsed, self.settings.read().unwrap().learning_gate_config());
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.playback.load(parsed, filename);
        Ok(())
    }

    pub fn playback_play(&self) {
        self.arbiter.set_owner(Producer::Playback);
        self.playback.play();
    }

    pub fn playback_pause(&self) {
        self.playback.pause();
    }

    pub fn playback_stop(&self) {
        let events = self.playback.stop();
        for event in events {
            if let playback::PlaybackTickEvent::NoteOff { note, .. } = event {
                let _ = self
                    .event_processor
                    .commit_note(note, false, 0, Producer::Playback, &self.arbiter);
            }
        }
        self.arbiter.set_owner(Producer::AllOff);
    }

    pub fn playback_seek(&self, seconds: f64) {
        self.playback.seek_to(seconds);
    }

    pub fn playback_set_tempo(&self, multiplier: f64) {
        self.playback.set_tempo(multiplier);
    }

    pub fn playback_set_volume(&self, volume: f64) {
        self.playback.set_volume(volume);
    }

    pub fn playback_set_loop(&self, enabled: bool, start: f64, end: f64) {
        self.playback.set_loop(enabled, start, end);
    }

    pub fn playback_status(&self) -> Value {
        let status = self.playback.status();
        json!({
            "state": format!("{:?}", status.state),
            "current_time": status.current_time_s,
            "total": status.total_duration_s,
            "filename": status.filename,
            "progress": status.progress,
            "tempo": status.tempo,
            "volume": status.volume,
            "loop_enabled": status.loop_enabled,
            "loop_start": status.loop_start_s,
            "loop_end": status.loop_end_s,
        })
    }

    // ---- learning.* ----

    pub fn learning_get_options(&self) -> Value {
        let lm = &self.settings.read().unwrap().learning_mode;
        json!({
            "left": {
                "wait": lm.left_hand_wait_for_notes,
                "white_color": lm.left_hand_white_color,
                "black_color": lm.left_hand_black_color,
            },
            "right": {
                "wait": lm.right_hand_wait_for_notes,
                "white_color": lm.right_hand_white_color,
                "black_color": lm.right_hand_black_color,
            },
            "timing_window_ms": lm.timing_window_ms,
        })
    }

    pub fn learning_set_options(
        &self,
        left_wait: Option<bool>,
        right_wait: Option<bool>,
        timing_window_ms: Option<u16>,
    ) -> MappingResult<()> {
        if let Some(w) = timing_window_ms {
            if !(100..=2000).contains(&w) {
                return Err(MappingError::invalid_input(
                    "timing_window_ms",
                    "must be within [100, 2000]",
                ));
            }
        }
        let config = {
            let mut settings = self.settings.write().unwrap();
            if let Some(v) = left_wait {
                settings.learning_mode.left_hand_wait_for_notes = v;
            }
            if let Some(v) = right_wait {
                settings.learning_mode.right_hand_wait_for_notes = v;
            }
            if let Some(v) = timing_window_ms {
                settings.learning_mode.timing_window_ms = v;
            }
            let _ = settings.save();
            settings.learning_gate_config()
        };
        self.learning.set_config(config);
        Ok(())
    }

    // ---- midi_input.* ----

    pub fn midi_list_devices(&self) -> Result<Vec<String>> {
        crate::midi_input::list_ports()
    }

    pub fn midi_start(&self, device: Option<&str>) -> Result<()> {
        let result = self.midi.start(device);
        if result.is_ok() {
            let mut settings = self.settings.write().unwrap();
            if !settings.led.enabled {
                settings.led.enabled = true;
                let _ = settings.save();
            }
            if let Some(name) = device {
                settings.hardware.midi_device = name.to_string();
                let _ = settings.save();
            }
        }
        result
    }

    pub fn midi_stop(&self) {
        self.midi.stop();
    }

    pub fn midi_restart(&self, _reason: &str) -> Result<()> {
        self.midi.restart_with_saved_device()
    }

    pub fn midi_status(&self) -> Value {
        json!({ "state": format!("{:?}", self.midi.state()) })
    }

    pub fn is_midi_listening(&self) -> bool {
        self.midi.state() == AdapterState::Listening
    }

    // ---- midi_output.* (spec §4.8 echo) ----

    pub fn midi_output_list_devices(&self) -> Result<Vec<String>> {
        MidiOutputAdapter::list_ports()
    }

    pub fn midi_output_connect(&self, device: &str) -> Result<()> {
        self.midi_out.connect(device)?;
        let mut settings = self.settings.write().unwrap();
        settings.hardware.midi_output_device = device.to_string();
        let _ = settings.save();
        Ok(())
    }

    pub fn midi_output_disconnect(&self) {
        self.midi_out.disconnect();
        let mut settings = self.settings.write().unwrap();
        settings.hardware.midi_output_device = String::new();
        let _ = settings.save();
    }

    pub fn midi_output_status(&self) -> Value {
        json!({
            "connected": self.midi_out.is_connected(),
            "device": self.midi_out.device_name(),
        })
    }

    // ---- learning-mode hint colors, for the playback scheduler's overlay ----

    /// Parses the four persisted hex hint colors into `Rgb`, returned as
    /// `((left_white, left_black), (right_white, right_black))`.
    pub fn learning_hint_colors(&self) -> ((Rgb, Rgb), (Rgb, Rgb)) {
        let lm = &self.settings.read().unwrap().learning_mode;
        (
            (
                color::parse_hex(&lm.left_hand_white_color),
                color::parse_hex(&lm.left_hand_black_color),
            ),
            (
                color::parse_hex(&lm.right_hand_white_color),
                color::parse_hex(&lm.right_hand_black_color),
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::led_driver::SimulatedLedDriver;

    fn control() -> Arc<ControlSurface> {
        let settings = Settings::default();
        let arbiter = Arc::new(Arbiter::new(Box::new(SimulatedLedDriver::new(250))));
        ControlSurface::new(settings, arbiter).unwrap()
    }

    #[test]
    fn set_start_led_rejects_start_past_end() {
        let cs = control();
        let before = cs.settings_snapshot().calibration.start_led;
        assert!(cs.set_start_led(9999).is_err());
        assert_eq!(cs.settings_snapshot().calibration.start_led, before);
    }

    #[test]
    fn key_offset_round_trip_rebuilds_mapping() {
        let cs = control();
        let before = cs.get_canonical_mapping();
        cs.set_key_offset(30, -5).unwrap();
        let after = cs.get_canonical_mapping();
        assert_ne!(before["key_to_leds"], after["key_to_leds"]);
        cs.delete_key_offset(30).unwrap();
        let reset = cs.get_canonical_mapping();
        assert_eq!(reset["key_to_leds"], before["key_to_leds"]);
    }

    #[test]
    fn delete_missing_key_offset_is_not_found() {
        let cs = control();
        let err = cs.delete_key_offset(30).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn selection_toggle_adds_then_removes_led() {
        let cs = control();
        cs.selection_toggle(60, 5).unwrap();
        let overrides = cs.selection_get(60).unwrap();
        assert!(overrides.contains(&5));
        cs.selection_toggle(60, 5).unwrap();
        let overrides = cs.selection_get(60).unwrap();
        assert!(!overrides.contains(&5));
    }

    #[test]
    fn joints_convert_round_trips_mm_and_led() {
        let cs = control();
        let mm = cs.joints_convert(2.0, "led", "mm").unwrap();
        let back = cs.joints_convert(mm, "mm", "led").unwrap();
        assert!((back - 2.0).abs() < 1e-9);
    }

    #[test]
    fn learning_options_reject_out_of_bounds_window() {
        let cs = control();
        assert!(cs.learning_set_options(None, None, Some(50)).is_err());
        assert!(cs.learning_set_options(None, Some(true), Some(500)).is_ok());
        assert!(cs.settings_snapshot().learning_mode.right_hand_wait_for_notes);
    }
}
