// Calibration Overlay — spec §3 (the four overlay steps) and §4.4.
//
// A pure function over `(base_mapping, overlay_params, [start_led,
// end_led])`: cascading per-key offsets, solder-joint compensation,
// per-key trim+redistribution, then LED selection overrides. Applied
// in that fixed order to produce the canonical mapping.
//
// Grounded on spec.md §3/§4.4 directly; the solder-joint mm↔LED pitch
// follows `original_source/backend/utils/soldering_joint_converter.py`'s
// `get_physical_spacing_mm` (`1000.0 / leds_per_meter`), the dynamic-
// pitch fix recorded as an Open Question decision in DESIGN.md rather
// than spec.md's fallback fixed 3.5mm constant.

use std::collections::BTreeMap;

use crate::error::{MappingResult, Warnings};
use crate::geometry::{KeyGeometry, KeyType};
use crate::proportional::BaseMapping;

/// `key_index -> integer LED-index offset`, cascading: the sum of all
/// offsets at indices `<= key_index` applies to that key's LEDs.
pub type CascadingOffsets = BTreeMap<usize, i64>;

/// `led_index -> mm offset` of a physical solder joint on the strip.
pub type SolderJoints = BTreeMap<u16, f64>;

/// `key_index -> (left_trim, right_trim)` LED counts to remove.
pub type Trims = BTreeMap<usize, (usize, usize)>;

/// `key_index -> explicit ordered LED list`, replacing the key's
/// allocator-derived list outright.
pub type SelectionOverrides = BTreeMap<usize, Vec<u16>>;

#[derive(Debug, Clone, Default)]
pub struct CalibrationParams {
    pub cascading_offsets: CascadingOffsets,
    pub solder_joints: SolderJoints,
    pub joint_pitch_mm: f64,
    pub trims: Trims,
    pub selection_overrides: SelectionOverrides,
}

#[derive(Debug, Clone)]
pub struct CalibrationResult {
    pub mapping: BaseMapping,
    pub clamp_count: usize,
    pub warnings: Warnings,
}

fn round_half_away_from_zero(x: f64) -> i64 {
    if x >= 0.0 {
        (x + 0.5).floor() as i64
    } else {
        (x - 0.5).ceil() as i64
    }
}

fn clamp_led(v: i64, start_led: u16, end_led: u16, clamp_count: &mut usize) -> u16 {
    let lo = start_led as i64;
    let hi = end_led as i64;
    if v < lo {
        *clamp_count += 1;
        start_led
    } else if v > hi {
        *clamp_count += 1;
        end_led
    } else {
        v as u16
    }
}

/// Step 1: cascading per-key LED-index offsets.
fn apply_cascading_offsets(
    mapping: &mut BaseMapping,
    offsets: &CascadingOffsets,
    start_led: u16,
    end_led: u16,
    clamp_count: &mut usize,
) {
    let mut running = 0i64;
    for (key_idx, leds) in mapping.iter_mut().enumerate() {
        if let Some(delta) = offsets.get(&key_idx) {
            running += delta;
        }
        if running == 0 {
            continue;
        }
        for led in leds.iter_mut() {
            let shifted = *led as i64 + running;
            *led = clamp_led(shifted, start_led, end_led, clamp_count);
        }
        leds.sort_unstable();
        leds.dedup();
    }
}

/// Step 2: solder-joint mm compensation, converted to whole LEDs at
/// `joint_pitch_mm`.
fn apply_solder_joints(
    mapping: &mut BaseMapping,
    joints: &SolderJoints,
    pitch_mm: f64,
    start_led: u16,
    end_led: u16,
    clamp_count: &mut usize,
) {
    if joints.is_empty() || pitch_mm <= 0.0 {
        return;
    }
    // Prefix sum of rounded per-joint LED deltas, sorted by led_index.
    let sorted: Vec<(u16, i64)> = joints
        .iter()
        .map(|(&idx, &mm)| (idx, round_half_away_from_zero(mm / pitch_mm)))
        .collect();
    let mut prefix: Vec<(u16, i64)> = Vec::with_capacity(sorted.len());
    let mut running = 0i64;
    for (idx, delta) in &sorted {
        running += delta;
        prefix.push((*idx, running));
    }

    let compensation_for = |led_index: u16| -> i64 {
        // cumulative sum for all joints strictly less than led_index
        match prefix.iter().rposition(|(idx, _)| *idx < led_index) {
            Some(pos) => prefix[pos].1,
            None => 0,
        }
    };

    for leds in mapping.iter_mut() {
        for led in leds.iter_mut() {
            let delta = compensation_for(*led);
            if delta != 0 {
                *led = clamp_led(*led as i64 + delta, start_led, end_led, clamp_count);
            }
        }
        leds.sort_unstable();
        leds.dedup();
    }
}

/// Step 3: per-key trim with two-pass redistribution to the nearest
/// present predecessor/successor.
fn apply_trims(mapping: &mut BaseMapping, trims: &Trims, warnings: &mut Warnings) {
    let n = mapping.len();
    let mut pending_left: BTreeMap<usize, Vec<u16>> = BTreeMap::new();
    let mut pending_right: BTreeMap<usize, Vec<u16>> = BTreeMap::new();

    // Pass 1: shrink in place, stash what was trimmed.
    for (&key_idx, &(left_trim, right_trim)) in trims.iter() {
        if key_idx >= n {
            continue;
        }
        let leds = &mut mapping[key_idx];
        if left_trim == 0 && right_trim == 0 {
            continue;
        }
        if left_trim + right_trim >= leds.len() {
            warnings.push(format!(
                "key {} trim would empty its LED list; skipped",
                key_idx
            ));
            continue;
        }
        let left_part: Vec<u16> = leds.drain(0..left_trim).collect();
        let right_start = leds.len() - right_trim;
        let right_part: Vec<u16> = leds.drain(right_start..).collect();
        if !left_part.is_empty() {
            pending_left.insert(key_idx, left_part);
        }
        if !right_part.is_empty() {
            pending_right.insert(key_idx, right_part);
        }
    }

    // Pass 2: redistribute to the nearest present neighbor.
    for (&key_idx, leds) in pending_left.iter() {
        if let Some(target) = (0..key_idx).rev().find(|&k| !mapping[k].is_empty()) {
            mapping[target].extend(leds.iter().copied());
            mapping[target].sort_unstable();
            mapping[target].dedup();
        } else {
            warnings.push(format!(
                "key {} left-trim LEDs had no earlier key to redistribute to",
                key_idx
            ));
        }
    }
    for (&key_idx, leds) in pending_right.iter() {
        if let Some(target) = (key_idx + 1..n).find(|&k| !mapping[k].is_empty()) {
            mapping[target].extend(leds.iter().copied());
            mapping[target].sort_unstable();
            mapping[target].dedup();
        } else {
            warnings.push(format!(
                "key {} right-trim LEDs had no later key to redistribute to",
                key_idx
            ));
        }
    }
}

/// Step 4: explicit LED-list overrides, re-homing displaced LEDs to
/// whichever immediate neighbor key's exposed edge sits physically
/// closer. Ties resolve by the override key's own center (closer to
/// the left half goes left, the right half goes right), with an
/// ultimate tie going right — LEDs progress left-to-right by
/// convention.
fn apply_selection_overrides(
    mapping: &mut BaseMapping,
    geometries: &[KeyGeometry],
    led_centers: &BTreeMap<u16, f64>,
    overrides: &SelectionOverrides,
    start_led: u16,
    end_led: u16,
    clamp_count: &mut usize,
    warnings: &mut Warnings,
) {
    let n = mapping.len();
    for (&key_idx, new_list) in overrides.iter() {
        if key_idx >= n {
            continue;
        }
        let clamped: Vec<u16> = new_list
            .iter()
            .map(|&v| clamp_led(v as i64, start_led, end_led, clamp_count))
            .collect();
        let mut clamped_sorted = clamped.clone();
        clamped_sorted.sort_unstable();
        clamped_sorted.dedup();

        let old_set: Vec<u16> = mapping[key_idx].clone();
        let new_set: std::collections::HashSet<u16> = clamped_sorted.iter().copied().collect();
        let removed: Vec<u16> = old_set
            .into_iter()
            .filter(|led| !new_set.contains(led))
            .collect();

        mapping[key_idx] = clamped_sorted;

        if removed.is_empty() {
            continue;
        }

        let left_neighbor = if key_idx > 0 { Some(key_idx - 1) } else { None };
        let right_neighbor = if key_idx + 1 < n { Some(key_idx + 1) } else { None };
        let key_center = geometries[key_idx].center_mm;

        for led in removed {
            let led_center = match led_centers.get(&led) {
                Some(c) => *c,
                None => continue,
            };
            let target = match (left_neighbor, right_neighbor) {
                (Some(l), Some(r)) => {
                    let dist_left = (led_center - geometries[l].end_mm).abs();
                    let dist_right = (led_center - geometries[r].start_mm).abs();
                    if dist_left < dist_right {
                        l
                    } else if dist_right < dist_left {
                        r
                    } else if led_center < key_center {
                        l
                    } else {
                        r
                    }
                }
                (Some(l), None) => l,
                (None, Some(r)) => r,
                (None, None) => {
                    warnings.push(format!(
                        "override on key {} displaced LED {} with no neighbor to re-home to",
                        key_idx, led
                    ));
                    continue;
                }
            };
            mapping[target].push(led);
            mapping[target].sort_unstable();
            mapping[target].dedup();
        }
    }
}

/// Applies the four calibration overlay steps, in order, to `base`.
pub fn apply(
    base: &BaseMapping,
    geometries: &[KeyGeometry],
    led_centers: &BTreeMap<u16, f64>,
    start_led: u16,
    end_led: u16,
    params: &CalibrationParams,
) -> MappingResult<CalibrationResult> {
    let mut mapping = base.clone();
    let mut clamp_count = 0usize;
    let mut warnings = Warnings::default();

    apply_cascading_offsets(
        &mut mapping,
        &params.cascading_offsets,
        start_led,
        end_led,
        &mut clamp_count,
    );
    apply_solder_joints(
        &mut mapping,
        &params.solder_joints,
        params.joint_pitch_mm,
        start_led,
        end_led,
        &mut clamp_count,
    );
    apply_trims(&mut mapping, &params.trims, &mut warnings);
    apply_selection_overrides(
        &mut mapping,
        geometries,
        led_centers,
        &params.selection_overrides,
        start_led,
        end_led,
        &mut clamp_count,
        &mut warnings,
    );

    Ok(CalibrationResult {
        mapping,
        clamp_count,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{compute_key_geometries, PhysicalParams, PianoSize};

    fn geoms() -> Vec<KeyGeometry> {
        compute_key_geometries(PianoSize::Keys88, PhysicalParams::default()).unwrap()
    }

    fn centers(start: u16, end: u16, spacing: f64) -> BTreeMap<u16, f64> {
        (start..=end).map(|i| (i, i as f64 * spacing)).collect()
    }

    fn identity(n: usize) -> BaseMapping {
        (0..n).map(|k| vec![(k * 3) as u16, (k * 3 + 1) as u16]).collect()
    }

    #[test]
    fn cascading_offset_shifts_current_and_later_keys_only() {
        let base = identity(88);
        let mut offsets = CascadingOffsets::new();
        offsets.insert(10, 2);
        let params = CalibrationParams {
            cascading_offsets: offsets,
            ..Default::default()
        };
        let result = apply(&base, &geoms(), &centers(0, 300, 5.0), 0, 300, &params).unwrap();
        assert_eq!(result.mapping[9], base[9]);
        assert_eq!(result.mapping[10][0], base[10][0] + 2);
        assert_eq!(result.mapping[50][0], base[50][0] + 2);
    }

    #[test]
    fn solder_joint_compensation_only_counts_earlier_joints() {
        let base: BaseMapping = vec![vec![10], vec![20]];
        let mut joints = SolderJoints::new();
        joints.insert(5, 5.0); // pitch 5mm -> +1 LED, applies to both (5 < 10, 5 < 20)
        joints.insert(15, 5.0); // applies only to the second key's LED (15 < 20)
        let params = CalibrationParams {
            solder_joints: joints,
            joint_pitch_mm: 5.0,
            ..Default::default()
        };
        let geometries = compute_key_geometries(PianoSize::Keys25, PhysicalParams::default()).unwrap();
        let result = apply(&base, &geometries, &centers(0, 50, 5.0), 0, 50, &params).unwrap();
        assert_eq!(result.mapping[0], vec![11]);
        assert_eq!(result.mapping[1], vec![22]);
    }

    #[test]
    fn trim_redistributes_to_nearest_present_neighbor() {
        let base: BaseMapping = vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8]];
        let mut trims = Trims::new();
        trims.insert(1, (1, 1)); // key 1 loses LED 3 (left) and LED 5 (right)
        let params = CalibrationParams {
            trims,
            ..Default::default()
        };
        let geometries = compute_key_geometries(PianoSize::Keys25, PhysicalParams::default()).unwrap();
        let result = apply(&base, &geometries, &centers(0, 10, 5.0), 0, 10, &params).unwrap();
        assert_eq!(result.mapping[0], vec![0, 1, 2, 3]);
        assert_eq!(result.mapping[1], vec![4]);
        assert_eq!(result.mapping[2], vec![5, 6, 7, 8]);
    }

    #[test]
    fn trim_that_would_empty_key_is_rejected() {
        let base: BaseMapping = vec![vec![0, 1, 2], vec![3, 4], vec![5, 6, 7]];
        let mut trims = Trims::new();
        trims.insert(1, (1, 1)); // would remove both of key 1's LEDs
        let params = CalibrationParams {
            trims,
            ..Default::default()
        };
        let geometries = compute_key_geometries(PianoSize::Keys25, PhysicalParams::default()).unwrap();
        let result = apply(&base, &geometries, &centers(0, 10, 5.0), 0, 10, &params).unwrap();
        assert_eq!(result.mapping[1], vec![3, 4]);
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn selection_override_rehomes_displaced_leds_to_closer_neighbor() {
        let base: BaseMapping = vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8]];
        let mut overrides = SelectionOverrides::new();
        overrides.insert(1, vec![4]); // drops LED 3 and LED 5
        let params = CalibrationParams {
            selection_overrides: overrides,
            ..Default::default()
        };
        let geometries = compute_key_geometries(PianoSize::Keys25, PhysicalParams::default()).unwrap();
        // LED centers chosen so LED 3 sits closer to key 0's edge, LED 5 closer to key 2's edge.
        let mut led_centers = centers(0, 10, 5.0);
        led_centers.insert(3, geometries[0].end_mm + 0.1);
        led_centers.insert(5, geometries[2].start_mm - 0.1);
        let result = apply(&base, &geometries, &led_centers, 0, 10, &params).unwrap();
        assert_eq!(result.mapping[1], vec![4]);
        assert!(result.mapping[0].contains(&3));
        assert!(result.mapping[2].contains(&5));
    }
}
