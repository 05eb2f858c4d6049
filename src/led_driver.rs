// LED driver backends — spec §6 "LED driver (consumed)".
//
// `LedDriver` is the trait every producer writes through; `DdpLedDriver`
// sends real frames over UDP/DDP to a WLED-class receiver, grounded on
// `multi_device.rs`'s `DeviceConnection` (socket setup, keepalive
// interval, brightness-scaled frame send). `SimulatedLedDriver` is the
// mandatory no-op fallback spec §6 requires when hardware is
// unavailable.

use std::net::UdpSocket;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use ddp_rs::connection::DDPConnection;
use ddp_rs::protocol::{PixelConfig, ID};

/// WLED's DDP timeout is roughly 1s; send a keepalive at half that so
/// an idle (all-black) strip never drops its session.
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

pub trait LedDriver: Send {
    fn set_pixel(&mut self, index: usize, r: u8, g: u8, b: u8) -> Result<()>;
    fn commit_frame(&mut self) -> Result<()>;
    fn set_brightness(&mut self, brightness: u8) -> Result<()>;
    fn pixel_count(&self) -> usize;
}

/// Sends one DDP frame per `commit_frame()` call over UDP to a single
/// WLED-class receiver.
pub struct DdpLedDriver {
    connection: Mutex<DDPConnection>,
    frame: Vec<u8>,
    brightness: u8,
    last_send: Instant,
}

impl DdpLedDriver {
    pub fn connect(ip: &str, pixel_count: usize) -> Result<Self> {
        let dest_addr = format!("{}:4048", ip);
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let connection = DDPConnection::try_new(&dest_addr, PixelConfig::default(), ID::Default, socket)
            .map_err(|e| anyhow!("failed to connect to {}: {}", ip, e))?;
        Ok(DdpLedDriver {
            connection: Mutex::new(connection),
            frame: vec![0u8; pixel_count * 3],
            brightness: 255,
            last_send: Instant::now(),
        })
    }
}

impl LedDriver for DdpLedDriver {
    fn set_pixel(&mut self, index: usize, r: u8, g: u8, b: u8) -> Result<()> {
        let offset = index
            .checked_mul(3)
            .filter(|&o| o + 2 < self.frame.len())
            .ok_or_else(|| anyhow!("pixel index {} out of range", index))?;
        self.frame[offset] = r;
        self.frame[offset + 1] = g;
        self.frame[offset + 2] = b;
        Ok(())
    }

    fn commit_frame(&mut self) -> Result<()> {
        let brightness = self.brightness as f64 / 255.0;
        let scaled: Vec<u8> = if self.brightness == 255 {
            self.frame.clone()
        } else {
            self.frame
                .iter()
                .map(|&v| (v as f64 * brightness).round() as u8)
                .collect()
        };

        let needs_keepalive = self.last_send.elapsed() >= KEEPALIVE_INTERVAL;
        let all_zero = scaled.iter().all(|&b| b == 0);
        if all_zero && !needs_keepalive {
            return Ok(());
        }

        let mut conn = self.connection.lock().unwrap();
        conn.write(&scaled)
            .map_err(|e| anyhow!("failed to send DDP frame: {}", e))?;
        self.last_send = Instant::now();
        Ok(())
    }

    fn set_brightness(&mut self, brightness: u8) -> Result<()> {
        self.brightness = brightness;
        Ok(())
    }

    fn pixel_count(&self) -> usize {
        self.frame.len() / 3
    }
}

/// No-op fallback: every operation succeeds, nothing is sent. Used
/// whenever no real strip is configured or reachable.
pub struct SimulatedLedDriver {
    pixel_count: usize,
    logged_disabled: bool,
}

impl SimulatedLedDriver {
    pub fn new(pixel_count: usize) -> Self {
        SimulatedLedDriver {
            pixel_count,
            logged_disabled: false,
        }
    }
}

impl LedDriver for SimulatedLedDriver {
    fn set_pixel(&mut self, _index: usize, _r: u8, _g: u8, _b: u8) -> Result<()> {
        Ok(())
    }

    fn commit_frame(&mut self) -> Result<()> {
        if !self.logged_disabled {
            eprintln!("LED driver disabled (enabled=false); running in simulation mode");
            self.logged_disabled = true;
        }
        Ok(())
    }

    fn set_brightness(&mut self, _brightness: u8) -> Result<()> {
        Ok(())
    }

    fn pixel_count(&self) -> usize {
        self.pixel_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_driver_never_errors() {
        let mut driver = SimulatedLedDriver::new(100);
        assert_eq!(driver.pixel_count(), 100);
        assert!(driver.set_pixel(50, 255, 0, 0).is_ok());
        assert!(driver.set_brightness(128).is_ok());
        assert!(driver.commit_frame().is_ok());
    }

    #[test]
    fn simulated_driver_accepts_out_of_range_pixel() {
        // Unlike the DDP driver, the simulated fallback never fails --
        // diagnostics surface `enabled=false` instead of bounds errors.
        let mut driver = SimulatedLedDriver::new(10);
        assert!(driver.set_pixel(9999, 1, 2, 3).is_ok());
    }
}
