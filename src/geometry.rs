// Geometry & Physical Placement — key rectangles, LED rectangles, overlap math.
//
// All downstream allocators operate on the rectangles produced here.
// Ported from the physical constants in config_led_mapping_physical.py:
// white keys 23.5mm, black keys 13.7mm, 1.0mm white-key gap, black keys
// centered on the white-key boundary they sit on.

use crate::error::{MappingError, MappingResult};

/// The full 88-key black-key index set (0-based, A0 = key 0). Repeats
/// every 12 keys starting at index 1; no black key at the very first or
/// last position of an octave block, matching a real keyboard.
pub const BLACK_KEY_INDICES_88: [usize; 36] = [
    1, 4, 6, 9, 11, 13, 16, 18, 21, 23, 25, 28, 30, 33, 35, 37, 40, 42, 45, 47, 49, 52, 54, 57, 59,
    61, 64, 66, 69, 71, 73, 76, 78, 81, 83, 85,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PianoSize {
    Keys25,
    Keys37,
    Keys49,
    Keys61,
    Keys76,
    Keys88,
}

impl PianoSize {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim() {
            "25" | "25-key" | "25key" => Some(PianoSize::Keys25),
            "37" | "37-key" | "37key" => Some(PianoSize::Keys37),
            "49" | "49-key" | "49key" => Some(PianoSize::Keys49),
            "61" | "61-key" | "61key" => Some(PianoSize::Keys61),
            "76" | "76-key" | "76key" => Some(PianoSize::Keys76),
            "88" | "88-key" | "88key" => Some(PianoSize::Keys88),
            _ => None,
        }
    }

    /// Key count for this size.
    pub fn key_count(&self) -> usize {
        match self {
            PianoSize::Keys25 => 25,
            PianoSize::Keys37 => 37,
            PianoSize::Keys49 => 49,
            PianoSize::Keys61 => 61,
            PianoSize::Keys76 => 76,
            PianoSize::Keys88 => 88,
        }
    }

    /// MIDI note range `[start, end]` inclusive. All non-88 sizes are
    /// centered subsets of the 88-key range (A0=21 .. C8=108), matching
    /// how real smaller keyboards are laid out relative to a full piano.
    pub fn midi_range(&self) -> (u8, u8) {
        let count = self.key_count();
        let full_start = 21u8;
        let full_end = 108u8;
        if count == 88 {
            return (full_start, full_end);
        }
        let total = (full_end - full_start + 1) as usize;
        let slack = total - count;
        let left = slack / 2;
        let start = full_start + left as u8;
        let end = start + count as u8 - 1;
        (start, end)
    }

    /// Index (0-based, within the 88-key pattern) of this size's first
    /// key — a smaller keyboard is a contiguous slice of the 88-key
    /// index space.
    fn key_index_offset_in_88(&self) -> usize {
        let (start, _) = self.midi_range();
        (start - 21) as usize
    }

    /// Derives `count_white_keys(size)` by slicing the 88-key black-key
    /// pattern instead of hardcoding it — the Open Question fix noted
    /// in DESIGN.md: the proportional allocator no longer rejects
    /// non-88-key pianos.
    pub fn count_white_keys(&self) -> usize {
        let offset = self.key_index_offset_in_88();
        let n = self.key_count();
        (0..n)
            .filter(|i| !BLACK_KEY_INDICES_88.contains(&(offset + i)))
            .count()
    }

    /// Whether the key at local index `idx` (0-based within this size)
    /// is a black key.
    pub fn is_black_key(&self, idx: usize) -> bool {
        let offset = self.key_index_offset_in_88();
        BLACK_KEY_INDICES_88.contains(&(offset + idx))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    White,
    Black,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyGeometry {
    pub key_index: usize,
    pub key_type: KeyType,
    pub start_mm: f64,
    pub end_mm: f64,
    pub center_mm: f64,
    pub width_mm: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PhysicalParams {
    pub white_key_width_mm: f64,
    pub black_key_width_mm: f64,
    pub white_key_gap_mm: f64,
}

impl Default for PhysicalParams {
    fn default() -> Self {
        PhysicalParams {
            white_key_width_mm: 23.5,
            black_key_width_mm: 13.7,
            white_key_gap_mm: 1.0,
        }
    }
}

/// Computes key rectangles for the given piano size. White keys tile
/// left-to-right at `white_key_width + gap` pitch; each black key is
/// centered on the boundary between its two adjacent white keys.
pub fn compute_key_geometries(
    size: PianoSize,
    params: PhysicalParams,
) -> MappingResult<Vec<KeyGeometry>> {
    if params.white_key_width_mm <= 0.0 || params.black_key_width_mm <= 0.0 {
        return Err(MappingError::invalid_geometry(
            "key widths must be positive",
        ));
    }

    let n = size.key_count();
    let mut geometries = Vec::with_capacity(n);
    let mut white_key_count: usize = 0;

    for idx in 0..n {
        if size.is_black_key(idx) {
            let left_white_start =
                white_key_count as f64 * (params.white_key_width_mm + params.white_key_gap_mm);
            let left_white_end = left_white_start + params.white_key_width_mm;
            let right_white_start = (white_key_count + 1) as f64
                * (params.white_key_width_mm + params.white_key_gap_mm);

            let center = (left_white_end + right_white_start) / 2.0;
            let start = center - params.black_key_width_mm / 2.0;
            let end = center + params.black_key_width_mm / 2.0;

            geometries.push(KeyGeometry {
                key_index: idx,
                key_type: KeyType::Black,
                start_mm: start,
                end_mm: end,
                center_mm: center,
                width_mm: params.black_key_width_mm,
            });
        } else {
            let start =
                white_key_count as f64 * (params.white_key_width_mm + params.white_key_gap_mm);
            let end = start + params.white_key_width_mm;
            let center = (start + end) / 2.0;

            geometries.push(KeyGeometry {
                key_index: idx,
                key_type: KeyType::White,
                start_mm: start,
                end_mm: end,
                center_mm: center,
                width_mm: params.white_key_width_mm,
            });
            white_key_count += 1;
        }
    }

    Ok(geometries)
}

/// Total physical span of the piano in mm, from the start of the first
/// key to the end of the last.
pub fn piano_width_mm(geometries: &[KeyGeometry]) -> f64 {
    match (geometries.first(), geometries.last()) {
        (Some(first), Some(last)) => last.end_mm.max(first.end_mm) - first.start_mm,
        _ => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedPlacement {
    pub led_index: usize,
    pub start_mm: f64,
    pub end_mm: f64,
    pub center_mm: f64,
    pub width_mm: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct LedStripParams {
    pub leds_per_meter: u16,
    pub led_physical_width_mm: f64,
    /// Physical offset of the strip's first LED center from its
    /// nominal start. Defaults to half the LED width when absent.
    pub strip_offset_mm: Option<f64>,
    pub strip_start_mm: f64,
}

impl LedStripParams {
    pub fn spacing_mm(&self) -> f64 {
        1000.0 / self.leds_per_meter as f64
    }

    pub fn offset_mm(&self) -> f64 {
        self.strip_offset_mm
            .unwrap_or(self.led_physical_width_mm / 2.0)
    }
}

/// Computes LED rectangles for the usable range `[start_led, end_led]`
/// inclusive. Indices returned are the absolute strip indices.
pub fn compute_led_placements(
    start_led: u16,
    end_led: u16,
    params: LedStripParams,
) -> MappingResult<Vec<LedPlacement>> {
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

    let spacing = params.spacing_mm();
    let offset = params.offset_mm();

    let mut placements = Vec::with_capacity((end_led - start_led + 1) as usize);
    for idx in start_led..=end_led {
        let center = params.strip_start_mm + idx as f64 * spacing + offset;
        placements.push(LedPlacement {
            led_index: idx as usize,
            start_mm: center - params.led_physical_width_mm / 2.0,
            end_mm: center + params.led_physical_width_mm / 2.0,
            center_mm: center,
            width_mm: params.led_physical_width_mm,
        });
    }
    Ok(placements)
}

/// Overlap in mm between two `[start, end]` intervals; zero if disjoint.
pub fn overlap_mm(a_start: f64, a_end: f64, b_start: f64, b_end: f64) -> f64 {
    (a_end.min(b_end) - a_start.max(b_start)).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn white_key_count_88_matches_real_piano() {
        assert_eq!(PianoSize::Keys88.count_white_keys(), 52);
        assert_eq!(
            PianoSize::Keys88.key_count() - PianoSize::Keys88.count_white_keys(),
            36
        );
    }

    #[test]
    fn midi_range_88_key_is_a0_to_c8() {
        assert_eq!(PianoSize::Keys88.midi_range(), (21, 108));
    }

    #[test]
    fn midi_range_61_key_is_centered_subset() {
        let (start, end) = PianoSize::Keys61.midi_range();
        assert_eq!(end - start + 1, 61);
        assert!(start >= 21 && end <= 108);
    }

    #[test]
    fn key_geometries_are_contiguous_and_ascending() {
        let geoms = compute_key_geometries(PianoSize::Keys88, PhysicalParams::default()).unwrap();
        assert_eq!(geoms.len(), 88);
        for pair in geoms.windows(2) {
            assert!(pair[1].start_mm >= pair[0].start_mm);
        }
        assert_eq!(geoms[0].key_type, KeyType::White);
        assert_eq!(geoms[87].key_type, KeyType::White);
    }

    #[test]
    fn black_key_centered_on_white_boundary() {
        let geoms = compute_key_geometries(PianoSize::Keys88, PhysicalParams::default()).unwrap();
        let black = &geoms[1];
        assert_eq!(black.key_type, KeyType::Black);
        let white0 = &geoms[0];
        let white1 = &geoms[2];
        assert!((black.center_mm - (white0.end_mm + white1.start_mm) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn zero_width_is_invalid_geometry() {
        let params = PhysicalParams {
            white_key_width_mm: 0.0,
            ..Default::default()
        };
        assert!(compute_key_geometries(PianoSize::Keys88, params).is_err());
    }

    #[test]
    fn led_placements_respect_spacing_and_offset() {
        let params = LedStripParams {
            leds_per_meter: 200,
            led_physical_width_mm: 3.5,
            strip_offset_mm: None,
            strip_start_mm: 0.0,
        };
        let placements = compute_led_placements(0, 9, params).unwrap();
        assert_eq!(placements.len(), 10);
        assert_eq!(placements[1].center_mm - placements[0].center_mm, 5.0);
        assert_eq!(placements[0].center_mm, 1.75);
    }

    #[test]
    fn overlap_mm_disjoint_is_zero() {
        assert_eq!(overlap_mm(0.0, 5.0, 10.0, 15.0), 0.0);
        assert_eq!(overlap_mm(0.0, 5.0, 4.0, 8.0), 1.0);
    }

    #[test]
    fn invalid_range_is_rejected() {
        let params = LedStripParams {
            leds_per_meter: 200,
            led_physical_width_mm: 3.5,
            strip_offset_mm: None,
            strip_start_mm: 0.0,
        };
        assert!(compute_led_placements(10, 5, params).is_err());
    }
}
