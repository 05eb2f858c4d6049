// Boot Animation — spec §4.12.
//
// Purely decorative, runs once at startup with exclusive arbiter
// ownership. The cascade sweep and gradient-wheel math follow
// `gradients.rs`'s piecewise RGB interpolation style; the sparkle
// finale's randomness follows `sand.rs`/`tron.rs`'s `rand::thread_rng()`
// idiom.

use std::f64::consts::PI;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;

use crate::arbiter::{Arbiter, Producer};

const CASCADE_DURATION: Duration = Duration::from_millis(900);
const GRADIENT_DURATION: Duration = Duration::from_millis(900);
const SPARKLE_DURATION: Duration = Duration::from_millis(400);
const FADE_DURATION: Duration = Duration::from_millis(100);
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

fn lerp(a: u8, b: u8, t: f64) -> u8 {
    (a as f64 + (b as f64 - a as f64) * t.clamp(0.0, 1.0)).round() as u8
}

/// Cyan -> blue sweep that advances across the strip over the phase
/// duration; LEDs behind the sweep front hold blue, ahead hold black.
fn cascade_frame(pixel_count: usize, progress: f64) -> Vec<(u8, u8, u8)> {
    let front = progress.clamp(0.0, 1.0) * pixel_count as f64;
    (0..pixel_count)
        .map(|i| {
            let distance = front - i as f64;
            if distance < 0.0 {
                (0, 0, 0)
            } else if distance < 1.0 {
                // Leading edge: cyan fading toward blue.
                (0, lerp(255, 0, distance), 255)
            } else {
                (0, 0, 255)
            }
        })
        .collect()
}

/// Three interleaved sine waves (120 degrees apart) sweeping along the
/// strip, the same piecewise-sine-wheel shape `gradients.rs` uses for
/// its spectrum gradients.
fn gradient_frame(pixel_count: usize, progress: f64) -> Vec<(u8, u8, u8)> {
    let phase = progress * 2.0 * PI;
    (0..pixel_count)
        .map(|i| {
            let pos = i as f64 / pixel_count.max(1) as f64;
            let angle = pos * 2.0 * PI + phase;
            let r = ((angle.sin() + 1.0) / 2.0 * 255.0).round() as u8;
            let g = (((angle + 2.0 * PI / 3.0).sin() + 1.0) / 2.0 * 255.0).round() as u8;
            let b = (((angle + 4.0 * PI / 3.0).sin() + 1.0) / 2.0 * 255.0).round() as u8;
            (r, g, b)
        })
        .collect()
}

fn sparkle_frame(pixel_count: usize, progress: f64, rng: &mut impl Rng) -> Vec<(u8, u8, u8)> {
    let fade = 1.0 - progress.clamp(0.0, 1.0);
    (0..pixel_count)
        .map(|_| {
            if rng.gen_bool(0.08) {
                let brightness = (rng.gen_range(180..=255) as f64 * fade) as u8;
                (brightness, brightness, brightness)
            } else {
                (0, 0, 0)
            }
        })
        .collect()
}

fn run_phase(
    arbiter: &Arbiter,
    pixel_count: usize,
    duration: Duration,
    mut frame_fn: impl FnMut(usize, f64) -> Vec<(u8, u8, u8)>,
) -> Result<()> {
    let start = std::time::Instant::now();
    loop {
        let elapsed = start.elapsed();
        let progress = if duration.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f64() / duration.as_secs_f64()).min(1.0)
        };
        let frame = frame_fn(pixel_count, progress);
        let pixels: Vec<(usize, u8, u8, u8)> = frame
            .into_iter()
            .enumerate()
            .map(|(i, (r, g, b))| (i, r, g, b))
            .collect();
        arbiter.commit(Producer::Boot, &pixels)?;
        if progress >= 1.0 {
            break;
        }
        std::thread::sleep(FRAME_INTERVAL);
    }
    Ok(())
}

/// Runs the full boot sequence synchronously: cascade, gradient sweep,
/// sparkle finale, linear fade to black. Sets `Producer::Boot` as the
/// arbiter's owner for the duration and releases it to `AllOff` on
/// completion so the event processor or playback engine can take over.
pub fn run(arbiter: &Arbiter) -> Result<()> {
    arbiter.set_owner(Producer::Boot);
    let pixel_count = arbiter.pixel_count();
    let mut rng = rand::thread_rng();

    run_phase(arbiter, pixel_count, CASCADE_DURATION, |n, p| cascade_frame(n, p))?;
    run_phase(arbiter, pixel_count, GRADIENT_DURATION, |n, p| gradient_frame(n, p))?;
    run_phase(arbiter, pixel_count, SPARKLE_DURATION, |n, p| {
        sparkle_frame(n, p, &mut rng)
    })?;

    let last_frame = gradient_frame(pixel_count, 1.0);
    run_phase(arbiter, pixel_count, FADE_DURATION, |n, p| {
        let fade = 1.0 - p;
        (0..n)
            .map(|i| {
                let (r, g, b) = last_frame.get(i).copied().unwrap_or((0, 0, 0));
                (
                    (r as f64 * fade) as u8,
                    (g as f64 * fade) as u8,
                    (b as f64 * fade) as u8,
                )
            })
            .collect()
    })?;

    arbiter.set_owner(Producer::AllOff);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::led_driver::SimulatedLedDriver;

    #[test]
    fn cascade_frame_leading_edge_is_cyan() {
        let frame = cascade_frame(10, 0.5);
        assert_eq!(frame[4], (0, 255, 255));
        assert_eq!(frame[9], (0, 0, 0));
    }

    #[test]
    fn gradient_frame_stays_in_byte_range() {
        let frame = gradient_frame(20, 0.25);
        for (r, g, b) in frame {
            assert!(r <= 255 && g <= 255 && b <= 255);
        }
    }

    #[test]
    fn run_releases_ownership_to_all_off() {
        let arbiter = Arbiter::new(Box::new(SimulatedLedDriver::new(5)));
        run(&arbiter).unwrap();
        assert_eq!(arbiter.current_owner(), Producer::AllOff);
    }
}
