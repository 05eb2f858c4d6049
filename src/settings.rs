// Settings bridge — spec §6 "Settings collaborator" and §9's typed
// settings categories.
//
// The source treats settings as untyped JSON; here each category
// (`calibration`, `led`, `piano`, `playback`, `learning_mode`,
// `hardware`) is a typed record, serialized with `serde`+`toml` and
// persisted with a hand-commented writer in the style of the teacher's
// `BandwidthConfig::save` in the original `config.rs`. `sanitize()`
// clamps numeric fields the same way the teacher's `sanitize()` does.
//
// No original_source counterpart for the persistence format itself;
// the category shape and key names follow spec.md §6's "Persisted
// state layout" table directly. Trim (`left_trim`/`right_trim`) has no
// control-surface operation in §6, so it is not a persisted settings
// key — `calibration::CalibrationParams::trims` stays empty in this
// crate; the overlay step itself is still implemented and tested.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationParams;
use crate::geometry::{PhysicalParams, PianoSize};
use crate::learning::GateConfig;
use crate::mapping::{AllocationMode, MappingSettings};
use crate::physics::PhysicsParams;

static CUSTOM_CONFIG_PATH: OnceLock<Option<String>> = OnceLock::new();

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DistributionMode {
    PianoOverlap,
    PianoNoOverlap,
    Physics,
    Custom,
}

impl DistributionMode {
    pub fn as_allocation_mode(&self) -> AllocationMode {
        match self {
            DistributionMode::PianoOverlap => AllocationMode::ProportionalSharing,
            DistributionMode::PianoNoOverlap => AllocationMode::ProportionalExclusive,
            // "custom" reuses the physics allocator as its base mapping;
            // the distinction from "physics" is in which calibration
            // overrides a client is expected to layer on top via the
            // selection-override control surface.
            DistributionMode::Physics | DistributionMode::Custom => AllocationMode::Physics,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolderJointSetting {
    pub width_mm: f64,
    pub offset_mm: f64,
    pub description: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub start_led: u16,
    pub end_led: u16,
    /// `midi_note` (as a string key, per §6) -> cascading LED-index offset.
    pub key_offsets: BTreeMap<String, i32>,
    /// `led_index` (as a string key) -> solder joint.
    pub led_soldering_joints: BTreeMap<String, SolderJointSetting>,
    /// `midi_note` (as a string key) -> explicit ordered LED list.
    pub led_selection_overrides: BTreeMap<String, Vec<u16>>,
    pub distribution_mode: DistributionMode,
    pub white_key_width: f32,
    pub black_key_width: f32,
    pub white_key_gap: f32,
    pub led_physical_width: f32,
    pub led_overhang_threshold: f32,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        CalibrationSettings {
            start_led: 0,
            end_led: 245,
            key_offsets: BTreeMap::new(),
            led_soldering_joints: BTreeMap::new(),
            led_selection_overrides: BTreeMap::new(),
            distribution_mode: DistributionMode::Physics,
            white_key_width: 23.5,
            black_key_width: 13.7,
            white_key_gap: 1.0,
            led_physical_width: 5.0,
            led_overhang_threshold: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedSettings {
    pub led_count: u16,
    pub leds_per_meter: u16,
    pub brightness: f32,
    pub enabled: bool,
}

impl Default for LedSettings {
    fn default() -> Self {
        LedSettings {
            led_count: 246,
            leds_per_meter: 144,
            brightness: 0.6,
            enabled: false,
        }
    }
}

const SUPPORTED_LED_DENSITIES: [u16; 8] = [60, 72, 100, 120, 144, 160, 180, 200];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PianoSettings {
    pub size: String,
}

impl Default for PianoSettings {
    fn default() -> Self {
        PianoSettings {
            size: "88-key".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    pub default_volume: f32,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        PlaybackSettings { default_volume: 1.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningModeSettings {
    pub left_hand_wait_for_notes: bool,
    pub right_hand_wait_for_notes: bool,
    pub timing_window_ms: u16,
    /// Hex color, e.g. "FFFFFF" -- bright hint for a correctly played note.
    pub left_hand_white_color: String,
    /// Hex color -- dim hint for a not-yet-played expected note.
    pub left_hand_black_color: String,
    pub right_hand_white_color: String,
    pub right_hand_black_color: String,
}

impl Default for LearningModeSettings {
    fn default() -> Self {
        LearningModeSettings {
            left_hand_wait_for_notes: false,
            right_hand_wait_for_notes: false,
            timing_window_ms: 200,
            left_hand_white_color: "FFFFFF".to_string(),
            left_hand_black_color: "202020".to_string(),
            right_hand_white_color: "FFFFFF".to_string(),
            right_hand_black_color: "202020".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareSettings {
    pub midi_device: String,
    /// DDP target IP; empty means run the simulated LED driver.
    pub strip_ip: String,
    /// MIDI echo output port (spec §4.8); empty means echo is disabled.
    pub midi_output_device: String,
}

impl Default for HardwareSettings {
    fn default() -> Self {
        HardwareSettings {
            midi_device: String::new(),
            strip_ip: String::new(),
            midi_output_device: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub calibration: CalibrationSettings,
    pub led: LedSettings,
    pub piano: PianoSettings,
    pub playback: PlaybackSettings,
    pub learning_mode: LearningModeSettings,
    pub hardware: HardwareSettings,
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Settings {
    pub fn set_config_path(cfg: Option<String>) {
        let _ = CUSTOM_CONFIG_PATH.set(cfg);
    }

    fn config_path_arg() -> Option<&'static str> {
        CUSTOM_CONFIG_PATH.get().and_then(|opt| opt.as_deref())
    }

    pub fn resolve_config_path(cfg_arg: Option<&str>) -> Result<PathBuf> {
        let cfg = cfg_arg.or_else(Self::config_path_arg);
        let home = std::env::var("HOME")?;
        let config_dir = PathBuf::from(home).join(".config").join("pianoled-mapper");
        std::fs::create_dir_all(&config_dir)?;

        match cfg {
            Some(cfg) => {
                let path = PathBuf::from(cfg);
                if path.is_absolute() || cfg.contains('/') || cfg.contains('\\') {
                    Ok(path)
                } else {
                    let filename = if cfg.ends_with(".toml") {
                        cfg.to_string()
                    } else {
                        format!("{}.toml", cfg)
                    };
                    Ok(config_dir.join(filename))
                }
            }
            None => Ok(config_dir.join("settings.toml")),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(cfg_arg: Option<&str>) -> Result<Self> {
        let path = Self::resolve_config_path(cfg_arg)?;
        if !path.exists() {
            let mut fresh = Settings::default();
            fresh.config_path = Some(path);
            fresh.sanitize();
            let _ = fresh.save();
            return Ok(fresh);
        }
        let contents = std::fs::read_to_string(&path)?;
        let mut parsed: Settings = toml::from_str(&contents)?;
        parsed.config_path = Some(path);
        parsed.sanitize();
        Ok(parsed)
    }

    /// Clamps every numeric field to the bounds spec.md §6 names,
    /// mirroring the teacher's `BandwidthConfig::sanitize`.
    pub fn sanitize(&mut self) {
        self.led.brightness = self.led.brightness.clamp(0.0, 1.0);
        if !SUPPORTED_LED_DENSITIES.contains(&self.led.leds_per_meter) {
            self.led.leds_per_meter = SUPPORTED_LED_DENSITIES
                .iter()
                .min_by_key(|&&d| (d as i32 - self.led.leds_per_meter as i32).abs())
                .copied()
                .unwrap_or(144);
        }
        self.led.led_count = self.led.led_count.max(1);
        self.calibration.end_led = self.calibration.end_led.max(self.calibration.start_led);
        self.calibration.white_key_width = self.calibration.white_key_width.max(0.1);
        self.calibration.black_key_width = self.calibration.black_key_width.max(0.1);
        self.calibration.white_key_gap = self.calibration.white_key_gap.max(0.0);
        self.calibration.led_physical_width = self.calibration.led_physical_width.max(0.1);
        self.calibration.led_overhang_threshold = self.calibration.led_overhang_threshold.max(0.0);
        self.playback.default_volume = self.playback.default_volume.clamp(0.0, 1.0);
        self.learning_mode.timing_window_ms = self.learning_mode.timing_window_ms.clamp(100, 2000);
        self.hardware.midi_device = self.hardware.midi_device.trim().to_string();
        self.hardware.strip_ip = self.hardware.strip_ip.trim().to_string();
        self.hardware.midi_output_device = self.hardware.midi_output_device.trim().to_string();
        self.piano.size = self.piano.size.trim().to_lowercase();
        if PianoSize::from_str_loose(&self.piano.size).is_none() {
            self.piano.size = "88-key".to_string();
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = self
            .config_path
            .clone()
            .unwrap_or(Self::resolve_config_path(None)?);
        let mut sanitized = self.clone();
        sanitized.sanitize();

        let key_offsets = toml::to_string(&sanitized.calibration.key_offsets)?;
        let joints = toml::to_string(&sanitized.calibration.led_soldering_joints)?;
        let overrides = toml::to_string(&sanitized.calibration.led_selection_overrides)?;

        let contents = format!(
            r#"# pianoled-mapper settings
# Edit while the program is running; the control surface hot-reloads
# calibration and led changes into the canonical mapping automatically.

[calibration]
start_led = {start_led}
end_led = {end_led}
distribution_mode = "{mode}"
white_key_width = {wkw}
black_key_width = {bkw}
white_key_gap = {wkg}
led_physical_width = {lpw}
led_overhang_threshold = {oht}

# midi_note (string) -> cascading LED-index offset
[calibration.key_offsets]
{key_offsets}
# led_index (string) -> {{width_mm, offset_mm, description, created_at, updated_at}}
[calibration.led_soldering_joints]
{joints}
# midi_note (string) -> explicit ordered LED index list
[calibration.led_selection_overrides]
{overrides}

[led]
led_count = {led_count}
leds_per_meter = {leds_per_meter}
brightness = {brightness}
enabled = {enabled}

[piano]
size = "{piano_size}"

[playback]
default_volume = {default_volume}

[learning_mode]
left_hand_wait_for_notes = {lwait}
right_hand_wait_for_notes = {rwait}
timing_window_ms = {window}
left_hand_white_color = "{lwhite}"
left_hand_black_color = "{lblack}"
right_hand_white_color = "{rwhite}"
right_hand_black_color = "{rblack}"

[hardware]
midi_device = "{midi_device}"
strip_ip = "{strip_ip}"
midi_output_device = "{midi_output_device}"
"#,
            start_led = sanitized.calibration.start_led,
            end_led = sanitized.calibration.end_led,
            mode = match sanitized.calibration.distribution_mode {
                DistributionMode::PianoOverlap => "piano_overlap",
                DistributionMode::PianoNoOverlap => "piano_no_overlap",
                DistributionMode::Physics => "physics",
                DistributionMode::Custom => "custom",
            },
            wkw = sanitized.calibration.white_key_width,
            bkw = sanitized.calibration.black_key_width,
            wkg = sanitized.calibration.white_key_gap,
            lpw = sanitized.calibration.led_physical_width,
            oht = sanitized.calibration.led_overhang_threshold,
            key_offsets = key_offsets,
            joints = joints,
            overrides = overrides,
            led_count = sanitized.led.led_count,
            leds_per_meter = sanitized.led.leds_per_meter,
            brightness = sanitized.led.brightness,
            enabled = sanitized.led.enabled,
            piano_size = sanitized.piano.size,
            default_volume = sanitized.playback.default_volume,
            lwait = sanitized.learning_mode.left_hand_wait_for_notes,
            rwait = sanitized.learning_mode.right_hand_wait_for_notes,
            window = sanitized.learning_mode.timing_window_ms,
            lwhite = sanitized.learning_mode.left_hand_white_color,
            lblack = sanitized.learning_mode.left_hand_black_color,
            rwhite = sanitized.learning_mode.right_hand_white_color,
            rblack = sanitized.learning_mode.right_hand_black_color,
            midi_device = sanitized.hardware.midi_device,
            strip_ip = sanitized.hardware.strip_ip,
            midi_output_device = sanitized.hardware.midi_output_device,
        );

        std::fs::write(&path, contents)?;
        Ok(())
    }

    pub fn piano_size(&self) -> PianoSize {
        PianoSize::from_str_loose(&self.piano.size).unwrap_or(PianoSize::Keys88)
    }

    /// Builds the mapping engine's settings from the typed, JSON-shaped
    /// persisted settings -- the "small validator" spec.md §9 calls for
    /// between the untyped transport layer and the core.
    pub fn to_mapping_settings(&self) -> MappingSettings {
        let size = self.piano_size();
        let (midi_start, _midi_end) = size.midi_range();

        let cascading_offsets = self
            .calibration
            .key_offsets
            .iter()
            .filter_map(|(note_str, &offset)| {
                let note: i32 = note_str.parse().ok()?;
                let key_index = note - midi_start as i32;
                if key_index < 0 {
                    None
                } else {
                    Some((key_index as usize, offset as i64))
                }
            })
            .collect();

        let solder_joints = self
            .calibration
            .led_soldering_joints
            .iter()
            .filter_map(|(idx_str, joint)| {
                let idx: u16 = idx_str.parse().ok()?;
                Some((idx, joint.offset_mm))
            })
            .collect();

        let selection_overrides = self
            .calibration
            .led_selection_overrides
            .iter()
            .filter_map(|(note_str, leds)| {
                let note: i32 = note_str.parse().ok()?;
                let key_index = note - midi_start as i32;
                if key_index < 0 {
                    None
                } else {
                    Some((key_index as usize, leds.clone()))
                }
            })
            .collect();

        MappingSettings {
            piano_size: size,
            physical: PhysicalParams {
                white_key_width_mm: self.calibration.white_key_width as f64,
                black_key_width_mm: self.calibration.black_key_width as f64,
                white_key_gap_mm: self.calibration.white_key_gap as f64,
            },
            leds_per_meter: self.led.leds_per_meter,
            led_physical_width_mm: self.calibration.led_physical_width as f64,
            strip_offset_mm: None,
            start_led: self.calibration.start_led,
            end_led: self.calibration.end_led,
            mode: self.calibration.distribution_mode.as_allocation_mode(),
            overhang_threshold_mm: self.calibration.led_overhang_threshold as f64,
            calibration: CalibrationParams {
                cascading_offsets,
                solder_joints,
                // the Open Question fix: derive the joint pitch from the
                // configured density instead of a fixed 3.5mm constant.
                joint_pitch_mm: 1000.0 / self.led.leds_per_meter as f64,
                trims: Default::default(),
                selection_overrides,
            },
        }
    }

    pub fn physics_params(&self) -> PhysicsParams {
        PhysicsParams {
            leds_per_meter: self.led.leds_per_meter,
            led_physical_width_mm: self.calibration.led_physical_width as f64,
            strip_offset_mm: None,
            overhang_threshold_mm: self.calibration.led_overhang_threshold as f64,
        }
    }

    pub fn learning_gate_config(&self) -> GateConfig {
        GateConfig {
            wait_left: self.learning_mode.left_hand_wait_for_notes,
            wait_right: self.learning_mode.right_hand_wait_for_notes,
            timing_window_ms: self.learning_mode.timing_window_ms as f64,
        }
    }

    pub fn new_solder_joint(width_mm: f64, offset_mm: f64, description: Option<String>) -> SolderJointSetting {
        let now = now_unix();
        SolderJointSetting {
            width_mm,
            offset_mm,
            description,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_sanitize_cleanly() {
        let mut settings = Settings::default();
        settings.sanitize();
        assert_eq!(settings.piano.size, "88-key");
        assert!(SUPPORTED_LED_DENSITIES.contains(&settings.led.leds_per_meter));
    }

    #[test]
    fn unsupported_density_snaps_to_nearest() {
        let mut settings = Settings::default();
        settings.led.leds_per_meter = 150;
        settings.sanitize();
        assert_eq!(settings.led.leds_per_meter, 144);
    }

    #[test]
    fn invalid_piano_size_falls_back_to_88_key() {
        let mut settings = Settings::default();
        settings.piano.size = "nonsense".to_string();
        settings.sanitize();
        assert_eq!(settings.piano.size, "88-key");
    }

    #[test]
    fn to_mapping_settings_converts_midi_note_offsets_to_key_index() {
        let mut settings = Settings::default();
        // MIDI note 30 on an 88-key piano (start 21) is key index 9.
        settings.calibration.key_offsets.insert("30".to_string(), -57);
        let mapping = settings.to_mapping_settings();
        assert_eq!(mapping.calibration.cascading_offsets.get(&9), Some(&-57));
    }

    #[test]
    fn joint_pitch_derives_from_leds_per_meter_not_a_fixed_constant() {
        let mut settings = Settings::default();
        settings.led.leds_per_meter = 200;
        settings.sanitize();
        let mapping = settings.to_mapping_settings();
        assert!((mapping.calibration.joint_pitch_mm - 5.0).abs() < 1e-9);
    }

    #[test]
    fn learning_gate_config_clamps_timing_window() {
        let mut settings = Settings::default();
        settings.learning_mode.timing_window_ms = 5000;
        settings.sanitize();
        assert_eq!(settings.learning_gate_config().timing_window_ms, 2000.0);
    }
}
