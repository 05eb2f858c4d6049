// LED Writer Arbiter — spec §4.11.
//
// At most one logical producer drives the strip at a time. Precedence
// is fixed (boot > playback > event processor > all-off fallback);
// producers below the active owner may still update their own state,
// but their frame writes are dropped here before they reach the
// driver. No original_source counterpart — the Python backend
// serializes through a single `led_controller` object instead of an
// explicit arbiter; this module is built to spec.md §4.11's
// producer-precedence contract.

use std::sync::Mutex;

use anyhow::Result;

use crate::led_driver::LedDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Producer {
    /// Lowest precedence: nobody else wants the strip.
    AllOff,
    EventProcessor,
    Playback,
    /// Highest precedence: exclusive until the boot sequence completes.
    Boot,
}

struct State {
    owner: Producer,
}

/// Serializes frame commits from whichever producer currently owns
/// the strip. A single `Mutex<LedDriver>` is the commit point; no two
/// frames are ever in flight at once.
pub struct Arbiter {
    state: Mutex<State>,
    driver: Mutex<Box<dyn LedDriver>>,
}

impl Arbiter {
    pub fn new(driver: Box<dyn LedDriver>) -> Self {
        Arbiter {
            state: Mutex::new(State {
                owner: Producer::AllOff,
            }),
            driver: Mutex::new(driver),
        }
    }

    /// Requests ownership for `producer`. Ownership transitions are
    /// explicit (boot completion, playback start/stop) rather than
    /// implied by write attempts, so callers set this once per
    /// transition rather than on every frame.
    pub fn set_owner(&self, producer: Producer) {
        self.state.lock().unwrap().owner = producer;
    }

    pub fn current_owner(&self) -> Producer {
        self.state.lock().unwrap().owner
    }

    /// Whether `producer` is currently allowed to commit frames.
    pub fn may_write(&self, producer: Producer) -> bool {
        producer >= self.current_owner()
    }

    /// Commits `pixels` (`(index, r, g, b)` tuples) as a single frame
    /// if `producer` currently owns the strip; silently dropped
    /// otherwise (the producer's internal state update already
    /// happened upstream of this call).
    pub fn commit(&self, producer: Producer, pixels: &[(usize, u8, u8, u8)]) -> Result<bool> {
        if !self.may_write(producer) {
            return Ok(false);
        }
        let mut driver = self.driver.lock().unwrap();
        for &(index, r, g, b) in pixels {
            driver.set_pixel(index, r, g, b)?;
        }
        driver.commit_frame()?;
        Ok(true)
    }

    pub fn set_brightness(&self, producer: Producer, brightness: u8) -> Result<bool> {
        if !self.may_write(producer) {
            return Ok(false);
        }
        self.driver.lock().unwrap().set_brightness(brightness)?;
        Ok(true)
    }

    pub fn pixel_count(&self) -> usize {
        self.driver.lock().unwrap().pixel_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::led_driver::SimulatedLedDriver;

    #[test]
    fn precedence_order_is_boot_then_playback_then_event_then_off() {
        assert!(Producer::Boot > Producer::Playback);
        assert!(Producer::Playback > Producer::EventProcessor);
        assert!(Producer::EventProcessor > Producer::AllOff);
    }

    #[test]
    fn lower_precedence_write_is_dropped_while_boot_owns() {
        let arbiter = Arbiter::new(Box::new(SimulatedLedDriver::new(10)));
        arbiter.set_owner(Producer::Boot);
        let committed = arbiter
            .commit(Producer::EventProcessor, &[(0, 255, 0, 0)])
            .unwrap();
        assert!(!committed);
    }

    #[test]
    fn owner_write_succeeds() {
        let arbiter = Arbiter::new(Box::new(SimulatedLedDriver::new(10)));
        arbiter.set_owner(Producer::Playback);
        let committed = arbiter
            .commit(Producer::Playback, &[(0, 255, 0, 0)])
            .unwrap();
        assert!(committed);
    }

    #[test]
    fn higher_precedence_than_owner_can_still_write() {
        // A producer above the current owner (e.g. boot interrupting
        // playback mid-transition) is always allowed through.
        let arbiter = Arbiter::new(Box::new(SimulatedLedDriver::new(10)));
        arbiter.set_owner(Producer::EventProcessor);
        let committed = arbiter.commit(Producer::Boot, &[(0, 1, 2, 3)]).unwrap();
        assert!(committed);
    }

    #[test]
    fn default_owner_is_all_off() {
        let arbiter = Arbiter::new(Box::new(SimulatedLedDriver::new(10)));
        assert_eq!(arbiter.current_owner(), Producer::AllOff);
    }
}
