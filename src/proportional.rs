// Proportional Allocator (Piano-Based) — spec §4.2.
//
// Projects each key's physical slot into LED-index space by a single
// linear scale factor, then either expands slightly and lets adjacent
// keys share boundary LEDs, or partitions the strip with first-writer-
// wins semantics. Grounded on spec.md §4.2 directly (the original
// Python backend has no physics-free proportional allocator of its
// own — see DESIGN.md).

use crate::error::{MappingError, MappingResult, Warnings};
use crate::geometry::{self, PhysicalParams, PianoSize};

/// `key_index -> ascending, deduplicated LED indices`. Shared shape
/// produced by both allocators in this crate and consumed by the
/// calibration overlay.
pub type BaseMapping = Vec<Vec<u16>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct ProportionalStats {
    pub total_distinct_leds: usize,
    pub mapped_key_count: usize,
    pub unmapped_key_count: usize,
    pub avg_leds_per_key: f64,
    pub min_leds_per_key: usize,
    pub max_leds_per_key: usize,
}

#[derive(Debug, Clone)]
pub struct ProportionalResult {
    pub mapping: BaseMapping,
    pub stats: ProportionalStats,
    pub warnings: Warnings,
}

fn compute_stats(mapping: &BaseMapping) -> ProportionalStats {
    let mut distinct = std::collections::HashSet::new();
    let mut counts = Vec::new();
    for leds in mapping {
        for &l in leds {
            distinct.insert(l);
        }
        if !leds.is_empty() {
            counts.push(leds.len());
        }
    }
    let mapped = counts.len();
    ProportionalStats {
        total_distinct_leds: distinct.len(),
        mapped_key_count: mapped,
        unmapped_key_count: mapping.len() - mapped,
        avg_leds_per_key: if mapped > 0 {
            counts.iter().sum::<usize>() as f64 / mapped as f64
        } else {
            0.0
        },
        min_leds_per_key: counts.iter().copied().min().unwrap_or(0),
        max_leds_per_key: counts.iter().copied().max().unwrap_or(0),
    }
}

/// Allocates LEDs to every key of `size` by projecting each key's
/// physical slot into LED-index space.
pub fn allocate(
    size: PianoSize,
    leds_per_meter: u16,
    start_led: u16,
    end_led: u16,
    allow_led_sharing: bool,
    physical: PhysicalParams,
) -> MappingResult<ProportionalResult> {
    if end_led < start_led {
        return Err(MappingError::invalid_geometry(
            "end_led must be >= start_led",
        ));
    }
    if leds_per_meter == 0 {
        return Err(MappingError::invalid_geometry(
            "leds_per_meter must be positive",
        ));
    }

    let geometries = geometry::compute_key_geometries(size, physical)?;
    let piano_width_mm = geometry::piano_width_mm(&geometries);
    if piano_width_mm <= 0.0 {
        return Err(MappingError::invalid_geometry("zero piano width"));
    }

    let spacing_mm = 1000.0 / leds_per_meter as f64;
    let usable_count = (end_led - start_led) as usize + 1;
    let led_coverage_mm = (usable_count.saturating_sub(1)) as f64 * spacing_mm;

    let mut warnings = Warnings::default();
    if led_coverage_mm <= 0.0 {
        return Err(MappingError::insufficient_coverage(
            "usable LED range has zero coverage",
        ));
    }

    let scale = led_coverage_mm / piano_width_mm;
    let n = size.key_count();
    let mut mapping: BaseMapping = vec![Vec::new(); n];

    // per-key led-offset range (relative to start_led), inclusive
    let mut slots = Vec::with_capacity(n);
    for g in &geometries {
        let first_off = (g.start_mm * scale).round() as i64;
        let last_off = (g.end_mm * scale).round() as i64;
        slots.push((first_off, last_off));
    }

    if allow_led_sharing {
        for (k, &(first, last)) in slots.iter().enumerate() {
            let lo = (first - 1).max(0);
            let hi = last + 1;
            let mut leds: Vec<u16> = Vec::new();
            for off in lo..=hi {
                let abs = start_led as i64 + off;
                if abs >= start_led as i64 && abs <= end_led as i64 {
                    leds.push(abs as u16);
                }
            }
            leds.sort_unstable();
            leds.dedup();
            mapping[k] = leds;
        }
    } else {
        let mut claimed = vec![false; usable_count];
        for (k, &(first, last)) in slots.iter().enumerate() {
            let lo = first.max(0);
            let hi = last.max(lo);
            let mut leds: Vec<u16> = Vec::new();
            for off in lo..=hi {
                if off < 0 || off as usize >= usable_count {
                    continue;
                }
                let idx = off as usize;
                if !claimed[idx] {
                    claimed[idx] = true;
                    leds.push(start_led + idx as u16);
                }
            }
            mapping[k] = leds;
        }
    }

    let unmapped: usize = mapping.iter().filter(|l| l.is_empty()).count();
    if unmapped > 0 {
        warnings.push(format!("{} keys received no LEDs", unmapped));
    }

    let stats = compute_stats(&mapping);
    Ok(ProportionalResult {
        mapping,
        stats,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_sharing_covers_full_usable_range_88_key() {
        let result = allocate(
            PianoSize::Keys88,
            200,
            4,
            249,
            true,
            PhysicalParams::default(),
        )
        .unwrap();

        let mut distinct = std::collections::HashSet::new();
        for leds in &result.mapping {
            assert!(!leds.is_empty());
            assert!(leds.len() >= 3 && leds.len() <= 6, "{:?}", leds.len());
            for pair in leds.windows(2) {
                assert!(pair[0] < pair[1]);
            }
            for &l in leds {
                assert!((4..=249).contains(&l));
                distinct.insert(l);
            }
        }
        // Adjacent keys should share at least one boundary LED.
        let mut shared_any = false;
        for pair in result.mapping.windows(2) {
            if pair[0].iter().any(|l| pair[1].contains(l)) {
                shared_any = true;
                break;
            }
        }
        assert!(shared_any);
    }

    #[test]
    fn without_sharing_is_a_strict_partition() {
        let result = allocate(
            PianoSize::Keys88,
            200,
            4,
            249,
            false,
            PhysicalParams::default(),
        )
        .unwrap();

        let mut seen = std::collections::HashSet::new();
        for leds in &result.mapping {
            for &l in leds {
                assert!(seen.insert(l), "LED {} assigned twice", l);
            }
        }
    }

    #[test]
    fn zero_coverage_is_insufficient() {
        let err = allocate(PianoSize::Keys88, 200, 5, 5, true, PhysicalParams::default())
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InsufficientCoverage);
    }

    #[test]
    fn keys_are_strictly_ascending() {
        let result = allocate(
            PianoSize::Keys88,
            200,
            4,
            249,
            true,
            PhysicalParams::default(),
        )
        .unwrap();
        for leds in &result.mapping {
            for pair in leds.windows(2) {
                assert!(pair[0] < pair[1]);
            }
        }
    }
}
