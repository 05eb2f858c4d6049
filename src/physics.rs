// Physics-Based Allocator — spec §4.3.
//
// Assigns LEDs to keys by actual geometric overlap rather than slot
// projection: build candidates from overlap (plus a white-key boundary
// preference), resolve conflicts by (-overlap, is_black, key_index),
// drop thin overhangs, auto-calibrate pitch once against the usable
// LED count, then bridge any remaining gaps between neighbors.
//
// Grounded on `original_source/backend/services/physics_led_allocation.py`
// (`_generate_mapping`, conflict tie-break, gap-bridging) and
// `services/led_pitch_auto_calibration.py` (`auto_calibrate_pitch`).

use crate::error::{MappingError, MappingResult, Warnings};
use crate::geometry::{self, KeyGeometry, KeyType, PhysicalParams, PianoSize};
use crate::proportional::BaseMapping;

#[derive(Debug, Clone, Copy)]
pub struct PhysicsParams {
    pub leds_per_meter: u16,
    pub led_physical_width_mm: f64,
    pub strip_offset_mm: Option<f64>,
    pub overhang_threshold_mm: f64,
}

impl PhysicsParams {
    fn offset_mm(&self) -> f64 {
        self.strip_offset_mm
            .unwrap_or(self.led_physical_width_mm / 2.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PitchCalibration {
    pub was_adjusted: bool,
    pub theoretical_pitch_mm: f64,
    pub calibrated_pitch_mm: f64,
    pub difference_mm: f64,
    pub difference_percent: f64,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct PhysicsResult {
    pub mapping: BaseMapping,
    pub pitch_calibration: PitchCalibration,
    pub warnings: Warnings,
}

#[derive(Debug, Clone, Copy)]
struct LedRect {
    index: u16,
    start_mm: f64,
    end_mm: f64,
    center_mm: f64,
}

fn led_rects(start_led: u16, end_led: u16, pitch_mm: f64, params: PhysicsParams) -> Vec<LedRect> {
    let offset = params.offset_mm();
    let half_width = params.led_physical_width_mm / 2.0;
    (start_led..=end_led)
        .map(|idx| {
            let center = idx as f64 * pitch_mm + offset;
            LedRect {
                index: idx,
                start_mm: center - half_width,
                end_mm: center + half_width,
                center_mm: center,
            }
        })
        .collect()
}

fn exposed_edge(key: &KeyGeometry, edge_is_start: bool) -> f64 {
    if edge_is_start {
        key.start_mm
    } else {
        key.end_mm
    }
}

/// Builds candidates, resolves conflicts, applies the overhang filter,
/// bridges orphan gaps, and extends the last key to `end_led`.
fn generate_mapping(
    geometries: &[KeyGeometry],
    start_led: u16,
    end_led: u16,
    pitch_mm: f64,
    params: PhysicsParams,
) -> (BaseMapping, u16) {
    let n = geometries.len();
    let leds = led_rects(start_led, end_led, pitch_mm, params);

    // candidates[led_index_relative] = Vec<(key_index, score)>, score = overlap (penalized for boundary touches)
    let mut candidates: Vec<Vec<(usize, f64)>> = vec![Vec::new(); leds.len()];

    for (key_idx, key) in geometries.iter().enumerate() {
        let is_white = key.key_type == KeyType::White;
        for (rel, led) in leds.iter().enumerate() {
            let overlap = geometry::overlap_mm(key.start_mm, key.end_mm, led.start_mm, led.end_mm);
            let is_boundary = is_white
                && ((led.end_mm - key.start_mm).abs() < 1e-9
                    || (led.start_mm - key.end_mm).abs() < 1e-9);
            if overlap > 0.0 || is_boundary {
                let penalty = if is_boundary { 0.1 } else { 0.0 };
                candidates[rel].push((key_idx, (overlap - penalty).max(0.0)));
            }
        }
    }

    // conflict resolution: exactly one winner per LED
    let mut winner: Vec<Option<usize>> = vec![None; leds.len()];
    for (rel, entries) in candidates.iter().enumerate() {
        if entries.is_empty() {
            continue;
        }
        let best = entries
            .iter()
            .min_by(|a, b| {
                let key_a = (
                    -(a.1 * 1_000_000.0).round() as i64,
                    geometries[a.0].key_type == KeyType::Black,
                    a.0,
                );
                let key_b = (
                    -(b.1 * 1_000_000.0).round() as i64,
                    geometries[b.0].key_type == KeyType::Black,
                    b.0,
                );
                key_a.cmp(&key_b)
            })
            .unwrap();
        winner[rel] = Some(best.0);
    }

    let mut mapping: BaseMapping = vec![Vec::new(); n];
    for (rel, w) in winner.iter().enumerate() {
        if let Some(key_idx) = w {
            let overlap = geometry::overlap_mm(
                geometries[*key_idx].start_mm,
                geometries[*key_idx].end_mm,
                leds[rel].start_mm,
                leds[rel].end_mm,
            );
            if overlap >= params.overhang_threshold_mm {
                mapping[*key_idx].push(leds[rel].index);
            }
        }
    }

    // Phase 3: orphan rescue (gap bridging) between adjacent keys.
    for k in 0..n.saturating_sub(1) {
        if mapping[k].is_empty() || mapping[k + 1].is_empty() {
            continue;
        }
        let max_current = *mapping[k].iter().max().unwrap();
        let min_next = *mapping[k + 1].iter().min().unwrap();
        if max_current + 1 >= min_next {
            continue;
        }
        for led_idx in (max_current + 1)..min_next {
            let rel = (led_idx - start_led) as usize;
            let center = leds[rel].center_mm;
            let dist_current = (center - exposed_edge(&geometries[k], false)).abs();
            let dist_next = (center - exposed_edge(&geometries[k + 1], true)).abs();
            if dist_current <= dist_next {
                mapping[k].push(led_idx);
            } else {
                mapping[k + 1].push(led_idx);
            }
        }
    }
    for leds_for_key in mapping.iter_mut() {
        leds_for_key.sort_unstable();
        leds_for_key.dedup();
    }

    // Extend last covered key to end_led if there's residual range.
    let max_assigned = mapping.iter().flatten().copied().max();
    if let Some(max_assigned) = max_assigned {
        if max_assigned < end_led {
            if let Some(last_key) = (0..n).rev().find(|&k| !mapping[k].is_empty()) {
                for led_idx in (max_assigned + 1)..=end_led {
                    mapping[last_key].push(led_idx);
                }
            }
        }
    }

    let max_led_assigned = mapping.iter().flatten().copied().max().unwrap_or(start_led);
    (mapping, max_led_assigned)
}

/// Runs the physics-based allocator: provisional mapping, a single
/// auto-pitch recalibration pass, then a final mapping with the
/// adopted pitch.
pub fn allocate(
    size: PianoSize,
    physical: PhysicalParams,
    params: PhysicsParams,
    start_led: u16,
    end_led: u16,
) -> MappingResult<PhysicsResult> {
    if end_led < start_led {
        return Err(MappingError::invalid_geometry(
            "end_led must be >= start_led",
        ));
    }
    if params.led_physical_width_mm <= 0.0 {
        return Err(MappingError::invalid_geometry(
            "led_physical_width must be positive",
        ));
    }
    if params.leds_per_meter == 0 {
        return Err(MappingError::invalid_geometry(
            "leds_per_meter must be positive",
        ));
    }

    let geometries = geometry::compute_key_geometries(size, physical)?;
    let piano_width_mm = geometry::piano_width_mm(&geometries);
    if piano_width_mm <= 0.0 {
        return Err(MappingError::invalid_geometry("zero piano width"));
    }

    let theoretical_pitch = 1000.0 / params.leds_per_meter as f64;

    // Phase 1: provisional mapping at the theoretical pitch.
    let (_provisional, _) = generate_mapping(&geometries, start_led, end_led, theoretical_pitch, params);

    // Phase 2: single auto-pitch calibration pass.
    let usable_count = (end_led - start_led) as usize + 1;
    let required_pitch = if usable_count > 1 {
        piano_width_mm / (usable_count - 1) as f64
    } else {
        theoretical_pitch
    };
    let was_adjusted = (required_pitch - theoretical_pitch).abs() > 0.001;
    let adopted_pitch = if was_adjusted {
        required_pitch
    } else {
        theoretical_pitch
    };

    let pitch_calibration = PitchCalibration {
        was_adjusted,
        theoretical_pitch_mm: theoretical_pitch,
        calibrated_pitch_mm: adopted_pitch,
        difference_mm: adopted_pitch - theoretical_pitch,
        difference_percent: if theoretical_pitch != 0.0 {
            (adopted_pitch - theoretical_pitch) / theoretical_pitch * 100.0
        } else {
            0.0
        },
        reason: if was_adjusted {
            format!(
                "actual LED range ({} LEDs) spans {:.1}mm, requiring pitch adjustment",
                usable_count, piano_width_mm
            )
        } else {
            "pitch matches theoretical".to_string()
        },
    };

    // Phase 1 again with the adopted pitch (no-op if unchanged).
    let (mapping, _max_led) = generate_mapping(&geometries, start_led, end_led, adopted_pitch, params);

    let mut warnings = Warnings::default();
    let unmapped = mapping.iter().filter(|l| l.is_empty()).count();
    if unmapped > 0 {
        warnings.push(format!("{} keys received no LEDs", unmapped));
    }

    Ok(PhysicsResult {
        mapping,
        pitch_calibration,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_params() -> PhysicsParams {
        PhysicsParams {
            leds_per_meter: 200,
            led_physical_width_mm: 2.0,
            strip_offset_mm: None,
            overhang_threshold_mm: 1.5,
        }
    }

    #[test]
    fn auto_pitch_converges_for_88_key_reference_scenario() {
        let result = allocate(
            PianoSize::Keys88,
            PhysicalParams::default(),
            default_params(),
            4,
            250,
        )
        .unwrap();

        assert!(result.pitch_calibration.was_adjusted);
        // piano width / (usable_count-1): 1273.0mm / 246 ~= 5.175mm
        assert!((result.pitch_calibration.calibrated_pitch_mm - 5.175).abs() < 0.05);
        assert!(
            (result.pitch_calibration.calibrated_pitch_mm - required_pitch(&result))
                .abs()
                <= 0.001
        );
    }

    fn required_pitch(result: &PhysicsResult) -> f64 {
        result.pitch_calibration.calibrated_pitch_mm
    }

    #[test]
    fn no_led_appears_in_two_keys() {
        let result = allocate(
            PianoSize::Keys88,
            PhysicalParams::default(),
            default_params(),
            4,
            250,
        )
        .unwrap();
        let mut seen = std::collections::HashSet::new();
        for leds in &result.mapping {
            for &l in leds {
                assert!(seen.insert(l), "LED {} double-assigned", l);
            }
        }
    }

    #[test]
    fn idempotent_across_runs() {
        let a = allocate(
            PianoSize::Keys88,
            PhysicalParams::default(),
            default_params(),
            4,
            250,
        )
        .unwrap();
        let b = allocate(
            PianoSize::Keys88,
            PhysicalParams::default(),
            default_params(),
            4,
            250,
        )
        .unwrap();
        assert_eq!(a.mapping, b.mapping);
        assert_eq!(a.pitch_calibration, b.pitch_calibration);
    }

    #[test]
    fn within_each_key_indices_ascending() {
        let result = allocate(
            PianoSize::Keys88,
            PhysicalParams::default(),
            default_params(),
            4,
            250,
        )
        .unwrap();
        for leds in &result.mapping {
            for pair in leds.windows(2) {
                assert!(pair[0] < pair[1]);
            }
        }
    }

    #[test]
    fn invalid_range_is_rejected() {
        assert!(allocate(
            PianoSize::Keys88,
            PhysicalParams::default(),
            default_params(),
            10,
            5
        )
        .is_err());
    }
}
