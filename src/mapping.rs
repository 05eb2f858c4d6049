// Canonical Mapping Cache — spec §4.5.
//
// Runs the selected allocator, applies the calibration overlay, and
// publishes the result as an immutable snapshot behind a single
// `RwLock<Arc<CanonicalMap>>` swap — consumers either see the old
// snapshot or the new one, never a torn state. Mirrors the teacher's
// `Arc<tokio::sync::RwLock<Config>>` settings-snapshot pattern in
// `main.rs`, adapted to `std::sync` since this cache is read from
// plain OS threads (event processor, playback engine) as well as the
// async httpd.
//
// No original_source counterpart — built directly to spec.md §4.5's
// contract.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::calibration::{self, CalibrationParams};
use crate::error::{MappingError, MappingResult, Warnings};
use crate::geometry::{self, LedStripParams, PhysicalParams, PianoSize};
use crate::physics::{self, PhysicsParams, PitchCalibration};
use crate::proportional::{self, BaseMapping};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMode {
    ProportionalSharing,
    ProportionalExclusive,
    Physics,
}

#[derive(Debug, Clone)]
pub struct MappingSettings {
    pub piano_size: PianoSize,
    pub physical: PhysicalParams,
    pub leds_per_meter: u16,
    pub led_physical_width_mm: f64,
    pub strip_offset_mm: Option<f64>,
    pub start_led: u16,
    pub end_led: u16,
    pub mode: AllocationMode,
    pub overhang_threshold_mm: f64,
    pub calibration: CalibrationParams,
}

impl Default for MappingSettings {
    fn default() -> Self {
        MappingSettings {
            piano_size: PianoSize::Keys88,
            physical: PhysicalParams::default(),
            leds_per_meter: 144,
            led_physical_width_mm: 5.0,
            strip_offset_mm: None,
            start_led: 0,
            end_led: 245,
            mode: AllocationMode::Physics,
            overhang_threshold_mm: 1.0,
            calibration: CalibrationParams::default(),
        }
    }
}

/// The materialized, immutable output of `{allocator + overlay}` —
/// the single source of truth for the event processor, the playback
/// engine, and any visualization surface.
#[derive(Debug, Clone)]
pub struct CanonicalMap {
    pub midi_start: u8,
    pub midi_end: u8,
    key_to_leds: Vec<Vec<u16>>,
    pub pitch_calibration: Option<PitchCalibration>,
    pub clamp_count: usize,
    pub warnings: Warnings,
}

impl CanonicalMap {
    pub fn key_count(&self) -> usize {
        self.key_to_leds.len()
    }

    pub fn leds_for_key(&self, key_index: usize) -> MappingResult<&[u16]> {
        self.key_to_leds
            .get(key_index)
            .map(|v| v.as_slice())
            .ok_or_else(|| MappingError::not_found(format!("key index {} out of range", key_index)))
    }

    /// `midi_note -> key_index = midi_note - piano.midi_start`.
    pub fn leds_for_note(&self, note: u8) -> MappingResult<&[u16]> {
        if note < self.midi_start || note > self.midi_end {
            return Err(MappingError::not_found(format!(
                "midi note {} outside [{}, {}]",
                note, self.midi_start, self.midi_end
            )));
        }
        let key_index = (note - self.midi_start) as usize;
        self.leds_for_key(key_index)
    }
}

fn build_led_centers(start_led: u16, end_led: u16, pitch_mm: f64, params: &MappingSettings) -> BTreeMap<u16, f64> {
    let strip = LedStripParams {
        leds_per_meter: (1000.0 / pitch_mm).round().max(1.0) as u16,
        led_physical_width_mm: params.led_physical_width_mm,
        strip_offset_mm: params.strip_offset_mm,
        strip_start_mm: 0.0,
    };
    // `compute_led_placements` derives spacing from `leds_per_meter`, which
    // is a lossy round-trip from `pitch_mm` for non-integral pitches (the
    // physics allocator's calibrated pitch rarely divides 1000.0 evenly).
    // Rebuild centers directly from `pitch_mm` instead.
    let offset = strip.offset_mm();
    (start_led..=end_led)
        .map(|idx| (idx, idx as f64 * pitch_mm + offset))
        .collect()
}

/// Runs the selected allocator, then the calibration overlay, and
/// assembles the canonical map.
pub fn build(settings: &MappingSettings) -> MappingResult<CanonicalMap> {
    let geometries = geometry::compute_key_geometries(settings.piano_size, settings.physical)?;
    let (midi_start, midi_end) = settings.piano_size.midi_range();

    let mut warnings = Warnings::default();
    let (base_mapping, pitch_calibration, base_pitch_mm): (BaseMapping, Option<PitchCalibration>, f64) =
        match settings.mode {
            AllocationMode::ProportionalSharing | AllocationMode::ProportionalExclusive => {
                let allow_sharing = matches!(settings.mode, AllocationMode::ProportionalSharing);
                let result = proportional::allocate(
                    settings.piano_size,
                    settings.leds_per_meter,
                    settings.start_led,
                    settings.end_led,
                    allow_sharing,
                    settings.physical,
                )?;
                warnings.0.extend(result.warnings.0);
                (
                    result.mapping,
                    None,
                    1000.0 / settings.leds_per_meter as f64,
                )
            }
            AllocationMode::Physics => {
                let result = physics::allocate(
                    settings.piano_size,
                    settings.physical,
                    PhysicsParams {
                        leds_per_meter: settings.leds_per_meter,
                        led_physical_width_mm: settings.led_physical_width_mm,
                        strip_offset_mm: settings.strip_offset_mm,
                        overhang_threshold_mm: settings.overhang_threshold_mm,
                    },
                    settings.start_led,
                    settings.end_led,
                )?;
                warnings.0.extend(result.warnings.0);
                let pitch = result.pitch_calibration.calibrated_pitch_mm;
                (result.mapping, Some(result.pitch_calibration), pitch)
            }
        };

    let led_centers = build_led_centers(settings.start_led, settings.end_led, base_pitch_mm, settings);
    let joint_pitch_mm = if settings.calibration.joint_pitch_mm > 0.0 {
        settings.calibration.joint_pitch_mm
    } else {
        1000.0 / settings.leds_per_meter as f64
    };
    let mut calibration_params = settings.calibration.clone();
    calibration_params.joint_pitch_mm = joint_pitch_mm;

    let overlay_result = calibration::apply(
        &base_mapping,
        &geometries,
        &led_centers,
        settings.start_led,
        settings.end_led,
        &calibration_params,
    )?;
    warnings.0.extend(overlay_result.warnings.0);

    Ok(CanonicalMap {
        midi_start,
        midi_end,
        key_to_leds: overlay_result.mapping,
        pitch_calibration,
        clamp_count: overlay_result.clamp_count,
        warnings,
    })
}

/// Process-wide read-mostly cache of the canonical mapping. A rebuild
/// swaps in a brand-new `Arc<CanonicalMap>`; any reader holding an
/// older snapshot keeps seeing a complete, consistent mapping.
pub struct MappingCache {
    current: RwLock<Arc<CanonicalMap>>,
}

impl MappingCache {
    pub fn new(settings: &MappingSettings) -> MappingResult<Self> {
        let map = build(settings)?;
        Ok(MappingCache {
            current: RwLock::new(Arc::new(map)),
        })
    }

    /// Atomically observes the current canonical map.
    pub fn snapshot(&self) -> Arc<CanonicalMap> {
        self.current
            .read()
            .expect("mapping cache lock poisoned")
            .clone()
    }

    /// Rebuilds from `settings` and publishes the result. Consumers
    /// already holding a snapshot are unaffected until their next
    /// `snapshot()` call.
    pub fn rebuild(&self, settings: &MappingSettings) -> MappingResult<()> {
        let map = build(settings)?;
        *self.current.write().expect("mapping cache lock poisoned") = Arc::new(map);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_produces_full_88_key_coverage() {
        let settings = MappingSettings::default();
        let map = build(&settings).unwrap();
        assert_eq!(map.key_count(), 88);
        for k in 0..88 {
            assert!(!map.leds_for_key(k).unwrap().is_empty());
        }
    }

    #[test]
    fn note_lookup_rejects_out_of_range() {
        let settings = MappingSettings::default();
        let map = build(&settings).unwrap();
        assert!(map.leds_for_note(20).is_err());
        assert!(map.leds_for_note(109).is_err());
        assert!(map.leds_for_note(21).is_ok());
        assert!(map.leds_for_note(108).is_ok());
    }

    #[test]
    fn cache_rebuild_swaps_snapshot_atomically() {
        let mut settings = MappingSettings::default();
        let cache = MappingCache::new(&settings).unwrap();
        let before = cache.snapshot();

        settings.leds_per_meter = 200;
        cache.rebuild(&settings).unwrap();
        let after = cache.snapshot();

        assert!(!Arc::ptr_eq(&before, &after));
        // The snapshot a reader already held stays intact and usable.
        assert_eq!(before.key_count(), 88);
    }

    #[test]
    fn proportional_exclusive_mode_builds_without_error() {
        let settings = MappingSettings {
            mode: AllocationMode::ProportionalExclusive,
            leds_per_meter: 200,
            start_led: 0,
            end_led: 245,
            ..MappingSettings::default()
        };
        let map = build(&settings).unwrap();
        assert_eq!(map.key_count(), 88);
    }
}
