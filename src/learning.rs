// Learning-Mode Gate — spec §4.9.
//
// Holds playback at the current position until the expected notes in
// the acceptance window have all been played, or flags a wrong note
// with a debounced red flash. Bucketed expected-note index and the
// step function's seven rules are grounded on
// `original_source/backend/playback_service.py::_check_learning_mode_pause`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use crate::playback::{NoteEvent, ParsedMidi};

const MAX_QUEUE_LEN: usize = 5000;
const PLAYED_NOTE_RETENTION_S: f64 = 5.0;
const EVICTION_INTERVAL_S: f64 = 1.0;
const ACCEPTANCE_LOOKBACK_S: f64 = 1.0;
const FLASH_DURATION_S: f64 = 0.3;

/// Purely a pitch split (`note < 60` is left-hand expected), distinct
/// from `playback::Hand`'s track-based detection — spec.md §4.9 fixes
/// this boundary explicitly for gating purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GateHand {
    Left,
    Right,
}

fn hand_for_note(note: u8) -> GateHand {
    if note < 60 {
        GateHand::Left
    } else {
        GateHand::Right
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    pub wait_left: bool,
    pub wait_right: bool,
    pub timing_window_ms: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        GateConfig {
            wait_left: false,
            wait_right: false,
            timing_window_ms: 200.0,
        }
    }
}

impl GateConfig {
    fn window_s(&self) -> f64 {
        (self.timing_window_ms / 1000.0).max(0.001)
    }
}

type ExpectedIndex = BTreeMap<(i64, GateHand), BTreeSet<u8>>;

fn build_expected_index(events: &[NoteEvent], window_s: f64) -> ExpectedIndex {
    let mut index: ExpectedIndex = BTreeMap::new();
    for event in events {
        let bin = (event.start_ms / 1000.0 / window_s).floor() as i64;
        let hand = hand_for_note(event.note);
        index.entry((bin, hand)).or_default().insert(event.note);
    }
    index
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateResult {
    Continue,
    Pause,
}

#[derive(Debug, Clone)]
pub struct NoteHint {
    pub note: u8,
    pub hand: GateHand,
    pub played: bool,
}

#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub result: GateResult,
    pub wrong_notes: Vec<u8>,
    pub hints: Vec<NoteHint>,
    pub suppress_hints: bool,
}

struct State {
    config: GateConfig,
    expected_index: ExpectedIndex,
    played_left: VecDeque<(u8, f64)>,
    played_right: VecDeque<(u8, f64)>,
    flash_expiry: Option<f64>,
    window_identity: Option<BTreeSet<u8>>,
    last_eviction_s: f64,
}

/// Stateful gate: one instance per active playback session. `load`
/// rebuilds the bucketed expected-note index and clears all
/// transient state (played queues, flash arm, window identity) for
/// the new file.
pub struct LearningGate {
    state: Mutex<State>,
}

impl LearningGate {
    pub fn new(config: GateConfig) -> Self {
        LearningGate {
            state: Mutex::new(State {
                config,
                expected_index: BTreeMap::new(),
                played_left: VecDeque::new(),
                played_right: VecDeque::new(),
                flash_expiry: None,
                window_identity: None,
                last_eviction_s: 0.0,
            }),
        }
    }

    pub fn load(&self, parsed: &ParsedMidi, config: GateConfig) {
        let mut state = self.state.lock().unwrap();
        state.expected_index = build_expected_index(&parsed.events, config.window_s());
        state.config = config;
        state.played_left.clear();
        state.played_right.clear();
        state.flash_expiry = None;
        state.window_identity = None;
        state.last_eviction_s = 0.0;
    }

    pub fn set_config(&self, config: GateConfig) {
        self.state.lock().unwrap().config = config;
    }

    /// Records a key press at playback time `time_s`, bucketed by
    /// pitch into the left/right played-note queue.
    pub fn note_played(&self, note: u8, time_s: f64) {
        let mut state = self.state.lock().unwrap();
        let deque = match hand_for_note(note) {
            GateHand::Left => &mut state.played_left,
            GateHand::Right => &mut state.played_right,
        };
        deque.push_back((note, time_s));
        if deque.len() > MAX_QUEUE_LEN {
            deque.pop_front();
        }
    }

    fn evict_stale(state: &mut State, t: f64) {
        if t - state.last_eviction_s < EVICTION_INTERVAL_S {
            return;
        }
        state.last_eviction_s = t;
        let cutoff = t - PLAYED_NOTE_RETENTION_S;
        state.played_left.retain(|&(_, time)| time >= cutoff);
        state.played_right.retain(|&(_, time)| time >= cutoff);
    }

    fn expected_for_hand(state: &State, hand: GateHand, t: f64, window_s: f64) -> BTreeSet<u8> {
        let lo_bin = ((t - ACCEPTANCE_LOOKBACK_S) / window_s).floor() as i64;
        let hi_bin = ((t + window_s) / window_s).floor() as i64;
        let mut out = BTreeSet::new();
        for bin in lo_bin..=hi_bin {
            if let Some(set) = state.expected_index.get(&(bin, hand)) {
                out.extend(set.iter().copied());
            }
        }
        out
    }

    fn played_in_window(deque: &VecDeque<(u8, f64)>, lo: f64, hi: f64) -> Vec<u8> {
        deque
            .iter()
            .filter(|&&(_, time)| time >= lo && time <= hi)
            .map(|&(note, _)| note)
            .collect()
    }

    /// Runs one evaluation of the gate at playback time `t` (seconds).
    /// Intended to be called once per scheduler tick while playback is
    /// active.
    pub fn step(&self, t: f64) -> GateOutcome {
        let mut state = self.state.lock().unwrap();
        Self::evict_stale(&mut state, t);

        let config = state.config;
        if !config.wait_left && !config.wait_right {
            return GateOutcome {
                result: GateResult::Continue,
                wrong_notes: Vec::new(),
                hints: Vec::new(),
                suppress_hints: false,
            };
        }

        let window_s = config.window_s();
        let lo = t - ACCEPTANCE_LOOKBACK_S;
        let hi = t + window_s;

        let expected_l = if config.wait_left {
            Self::expected_for_hand(&state, GateHand::Left, t, window_s)
        } else {
            BTreeSet::new()
        };
        let expected_r = if config.wait_right {
            Self::expected_for_hand(&state, GateHand::Right, t, window_s)
        } else {
            BTreeSet::new()
        };

        if expected_l.is_empty() && expected_r.is_empty() {
            return GateOutcome {
                result: GateResult::Continue,
                wrong_notes: Vec::new(),
                hints: Vec::new(),
                suppress_hints: false,
            };
        }

        let played_l = Self::played_in_window(&state.played_left, lo, hi);
        let played_r = Self::played_in_window(&state.played_right, lo, hi);
        let played_l_set: BTreeSet<u8> = played_l.iter().copied().collect();
        let played_r_set: BTreeSet<u8> = played_r.iter().copied().collect();

        let identity: BTreeSet<u8> = expected_l.union(&expected_r).copied().collect();
        let identity_changed = state.window_identity.as_ref() != Some(&identity);
        if identity_changed {
            state.flash_expiry = None;
            state.window_identity = Some(identity.clone());
        }

        let mut wrong: Vec<u8> = played_l_set.difference(&expected_l).copied().collect();
        wrong.extend(played_r_set.difference(&expected_r).copied());
        wrong.sort_unstable();
        wrong.dedup();

        if !wrong.is_empty() {
            if state.flash_expiry.is_none() {
                state.flash_expiry = Some(t + FLASH_DURATION_S);
            }
            let suppress = state.flash_expiry.map_or(false, |exp| t < exp);
            return GateOutcome {
                result: GateResult::Pause,
                wrong_notes: wrong,
                hints: Self::build_hints(&expected_l, &expected_r, &played_l_set, &played_r_set),
                suppress_hints: suppress,
            };
        }

        if expected_l.is_subset(&played_l_set) && expected_r.is_subset(&played_r_set) {
            state.played_left.retain(|&(n, _)| !expected_l.contains(&n));
            state.played_right.retain(|&(n, _)| !expected_r.contains(&n));
            return GateOutcome {
                result: GateResult::Continue,
                wrong_notes: Vec::new(),
                hints: Vec::new(),
                suppress_hints: false,
            };
        }

        let suppress = state.flash_expiry.map_or(false, |exp| t < exp);
        GateOutcome {
            result: GateResult::Pause,
            wrong_notes: Vec::new(),
            hints: if suppress {
                Vec::new()
            } else {
                Self::build_hints(&expected_l, &expected_r, &played_l_set, &played_r_set)
            },
            suppress_hints: suppress,
        }
    }

    fn build_hints(
        expected_l: &BTreeSet<u8>,
        expected_r: &BTreeSet<u8>,
        played_l: &BTreeSet<u8>,
        played_r: &BTreeSet<u8>,
    ) -> Vec<NoteHint> {
        let mut hints: Vec<NoteHint> = expected_l
            .iter()
            .map(|&note| NoteHint {
                note,
                hand: GateHand::Left,
                played: played_l.contains(&note),
            })
            .collect();
        hints.extend(expected_r.iter().map(|&note| NoteHint {
            note,
            hand: GateHand::Right,
            played: played_r.contains(&note),
        }));
        hints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_parsed() -> ParsedMidi {
        ParsedMidi {
            events: vec![
                NoteEvent {
                    start_ms: 2000.0,
                    duration_ms: 300.0,
                    note: 60,
                    velocity: 90,
                    channel: 0,
                    track: 0,
                    hand: crate::playback::Hand::Right,
                },
                NoteEvent {
                    start_ms: 2000.0,
                    duration_ms: 300.0,
                    note: 64,
                    velocity: 90,
                    channel: 0,
                    track: 0,
                    hand: crate::playback::Hand::Right,
                },
                NoteEvent {
                    start_ms: 2000.0,
                    duration_ms: 300.0,
                    note: 67,
                    velocity: 90,
                    channel: 0,
                    track: 0,
                    hand: crate::playback::Hand::Right,
                },
            ],
            tempo_default_bpm: 120.0,
            total_duration_ms: 2300.0,
            track_info: vec![],
        }
    }

    fn right_hand_wait_config() -> GateConfig {
        GateConfig {
            wait_left: false,
            wait_right: true,
            timing_window_ms: 200.0,
        }
    }

    #[test]
    fn continue_when_no_hand_waiting() {
        let gate = LearningGate::new(GateConfig::default());
        gate.load(&sample_parsed(), GateConfig::default());
        let outcome = gate.step(2.0);
        assert_eq!(outcome.result, GateResult::Continue);
    }

    #[test]
    fn continue_when_expected_notes_all_played() {
        let gate = LearningGate::new(right_hand_wait_config());
        gate.load(&sample_parsed(), right_hand_wait_config());
        gate.note_played(60, 1.8);
        gate.note_played(64, 1.9);
        gate.note_played(67, 2.1);
        let outcome = gate.step(2.1);
        assert_eq!(outcome.result, GateResult::Continue);
    }

    #[test]
    fn pause_with_red_flash_on_wrong_note() {
        let gate = LearningGate::new(right_hand_wait_config());
        gate.load(&sample_parsed(), right_hand_wait_config());
        gate.note_played(61, 2.0);
        let outcome = gate.step(2.0);
        assert_eq!(outcome.result, GateResult::Pause);
        assert_eq!(outcome.wrong_notes, vec![61]);
        assert!(outcome.suppress_hints);
    }

    #[test]
    fn flash_does_not_rearm_within_same_window_identity() {
        let gate = LearningGate::new(right_hand_wait_config());
        gate.load(&sample_parsed(), right_hand_wait_config());
        gate.note_played(61, 2.0);
        let first = gate.step(2.0);
        let first_expiry_suppressed = first.suppress_hints;
        gate.note_played(62, 2.05);
        let second = gate.step(2.05);
        // Same window identity as the first call: flash already armed,
        // still within its 0.3s window, so hints stay suppressed.
        assert!(first_expiry_suppressed);
        assert!(second.suppress_hints);
    }

    #[test]
    fn pause_with_hints_when_partially_played() {
        let gate = LearningGate::new(right_hand_wait_config());
        gate.load(&sample_parsed(), right_hand_wait_config());
        gate.note_played(60, 1.9);
        let outcome = gate.step(2.0);
        assert_eq!(outcome.result, GateResult::Pause);
        assert!(outcome.wrong_notes.is_empty());
        assert!(!outcome.hints.is_empty());
        let hint_60 = outcome.hints.iter().find(|h| h.note == 60).unwrap();
        assert!(hint_60.played);
        let hint_64 = outcome.hints.iter().find(|h| h.note == 64).unwrap();
        assert!(!hint_64.played);
    }
}
