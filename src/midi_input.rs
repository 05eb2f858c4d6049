// USB MIDI Input Adapter — spec §4.6.
//
// Owns at most one open `midir` input connection, decodes nothing
// itself (raw bytes + a capture timestamp go straight to a bounded
// FIFO), and survives transient disconnects via a cooldown-gated
// restart. Port discovery/connect lifecycle grounded on the teacher's
// `midi.rs` (`list_midi_ports`, `find_midi_port`, `connect_midi`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};

/// Bounded FIFO capacity; oldest messages are dropped once full rather
/// than blocking the driver's callback thread.
pub const QUEUE_CAPACITY: usize = 4096;
const RESTART_COOLDOWN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Idle,
    Listening,
    Error,
}

#[derive(Debug, Clone)]
pub struct CapturedMessage {
    pub bytes: Vec<u8>,
    pub captured_at: Instant,
}

struct Queue {
    items: Mutex<VecDeque<CapturedMessage>>,
}

impl Queue {
    fn push(&self, bytes: &[u8]) {
        let mut items = self.items.lock().unwrap();
        if items.len() >= QUEUE_CAPACITY {
            items.pop_front();
        }
        items.push_back(CapturedMessage {
            bytes: bytes.to_vec(),
            captured_at: Instant::now(),
        });
    }

    fn drain(&self) -> Vec<CapturedMessage> {
        let mut items = self.items.lock().unwrap();
        items.drain(..).collect()
    }
}

/// Names containing these substrings are skipped during auto-select —
/// software pass-through/loopback ports aren't real instruments.
const AUTOSELECT_SKIP_SUBSTRINGS: [&str; 3] = ["through", "loopback", "midi thru"];

fn is_autoselect_candidate(name: &str) -> bool {
    let lower = name.to_lowercase();
    !AUTOSELECT_SKIP_SUBSTRINGS
        .iter()
        .any(|skip| lower.contains(skip))
}

/// Lists all available MIDI input port names.
pub fn list_ports() -> Result<Vec<String>> {
    let midi_in = MidiInput::new("pianoled-mapper")?;
    let ports = midi_in.ports();
    let mut names = Vec::new();
    for port in ports.iter() {
        if let Ok(name) = midi_in.port_name(port) {
            names.push(name);
        }
    }
    Ok(names)
}

fn find_port_index(midi_in: &MidiInput, name: &str) -> Option<usize> {
    let ports = midi_in.ports();
    ports
        .iter()
        .position(|p| matches!(midi_in.port_name(p), Ok(n) if n.to_lowercase().contains(&name.to_lowercase())))
}

fn autoselect_port_index(midi_in: &MidiInput) -> Option<usize> {
    let ports = midi_in.ports();
    ports
        .iter()
        .position(|p| matches!(midi_in.port_name(p), Ok(n) if is_autoselect_candidate(&n)))
        .or(if ports.is_empty() { None } else { Some(0) })
}

/// Owns the live connection and the at-most-one-writer FIFO. Callers
/// drain messages from a single consumer thread and feed the event
/// processor.
pub struct MidiInputAdapter {
    queue: Arc<Queue>,
    connection: Mutex<Option<MidiInputConnection<()>>>,
    state: Mutex<AdapterState>,
    last_device: Mutex<Option<String>>,
    last_restart_attempt: Mutex<Option<Instant>>,
    ever_connected: AtomicBool,
    on_first_connect: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

impl MidiInputAdapter {
    pub fn new() -> Self {
        MidiInputAdapter {
            queue: Arc::new(Queue {
                items: Mutex::new(VecDeque::new()),
            }),
            connection: Mutex::new(None),
            state: Mutex::new(AdapterState::Idle),
            last_device: Mutex::new(None),
            last_restart_attempt: Mutex::new(None),
            ever_connected: AtomicBool::new(false),
            on_first_connect: Mutex::new(None),
        }
    }

    pub fn state(&self) -> AdapterState {
        *self.state.lock().unwrap()
    }

    /// Registers a callback invoked exactly once, on the first
    /// successful connect, so the caller can opportunistically enable
    /// the LED subsystem if it was disabled.
    pub fn set_on_first_connect(&self, callback: impl FnMut() + Send + 'static) {
        *self.on_first_connect.lock().unwrap() = Some(Box::new(callback));
    }

    /// `Idle -> Listening(device)`. `device_name = None` auto-selects
    /// the first non-pass-through, non-loopback port.
    pub fn start(&self, device_name: Option<&str>) -> Result<()> {
        let midi_in = MidiInput::new("pianoled-mapper")?;
        let ports = midi_in.ports();
        if ports.is_empty() {
            *self.state.lock().unwrap() = AdapterState::Error;
            return Err(anyhow!("no MIDI input ports available"));
        }

        let port_index = match device_name {
            Some(name) => find_port_index(&midi_in, name).or_else(|| autoselect_port_index(&midi_in)),
            None => autoselect_port_index(&midi_in),
        };
        let port_index = match port_index {
            Some(idx) => idx,
            None => {
                *self.state.lock().unwrap() = AdapterState::Error;
                return Err(anyhow!("no suitable MIDI input port found"));
            }
        };

        let resolved_name = midi_in
            .port_name(&ports[port_index])
            .unwrap_or_default();

        let queue = self.queue.clone();
        let connection = midi_in
            .connect(
                &ports[port_index],
                "pianoled-mapper-input",
                move |_stamp, message, _| {
                    queue.push(message);
                },
                (),
            )
            .map_err(|e| anyhow!("failed to connect to MIDI port: {}", e));

        let connection = match connection {
            Ok(c) => c,
            Err(e) => {
                *self.state.lock().unwrap() = AdapterState::Error;
                return Err(e);
            }
        };

        *self.connection.lock().unwrap() = Some(connection);
        *self.state.lock().unwrap() = AdapterState::Listening;
        *self.last_device.lock().unwrap() = Some(resolved_name);

        if !self.ever_connected.swap(true, Ordering::SeqCst) {
            if let Some(callback) = self.on_first_connect.lock().unwrap().as_mut() {
                callback();
            }
        }

        Ok(())
    }

    /// `Listening -> Idle`.
    pub fn stop(&self) {
        *self.connection.lock().unwrap() = None;
        *self.state.lock().unwrap() = AdapterState::Idle;
    }

    /// Retries the last device, then auto-select, subject to a 500ms
    /// cooldown between attempts.
    pub fn restart_with_saved_device(&self) -> Result<()> {
        let now = Instant::now();
        {
            let mut last_attempt = self.last_restart_attempt.lock().unwrap();
            if let Some(prev) = *last_attempt {
                if now.duration_since(prev) < RESTART_COOLDOWN {
                    return Err(anyhow!("restart attempted within cooldown window"));
                }
            }
            *last_attempt = Some(now);
        }

        let saved = self.last_device.lock().unwrap().clone();
        match saved {
            Some(name) => self.start(Some(&name)).or_else(|_| self.start(None)),
            None => self.start(None),
        }
    }

    /// Drains all queued messages captured since the last call.
    pub fn drain(&self) -> Vec<CapturedMessage> {
        self.queue.drain()
    }
}

impl Default for MidiInputAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// MIDI echo output (spec §4.8): forwards scaled playback note on/off
/// bytes to a user-selected output port. Absence of a connection is
/// non-fatal — `send` is simply a no-op.
pub struct MidiOutputAdapter {
    connection: Mutex<Option<MidiOutputConnection>>,
    device_name: Mutex<Option<String>>,
}

impl MidiOutputAdapter {
    pub fn new() -> Self {
        MidiOutputAdapter {
            connection: Mutex::new(None),
            device_name: Mutex::new(None),
        }
    }

    /// Lists all available MIDI output port names.
    pub fn list_ports() -> Result<Vec<String>> {
        let midi_out = MidiOutput::new("pianoled-mapper")?;
        let ports = midi_out.ports();
        let mut names = Vec::new();
        for port in ports.iter() {
            if let Ok(name) = midi_out.port_name(port) {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Opens a connection to the named port, replacing any existing one.
    pub fn connect(&self, device_name: &str) -> Result<()> {
        let midi_out = MidiOutput::new("pianoled-mapper")?;
        let ports = midi_out.ports();
        let port_index = ports
            .iter()
            .position(|p| matches!(midi_out.port_name(p), Ok(n) if n.to_lowercase().contains(&device_name.to_lowercase())))
            .ok_or_else(|| anyhow!("no MIDI output port matching '{}'", device_name))?;

        let connection = midi_out
            .connect(&ports[port_index], "pianoled-mapper-output")
            .map_err(|e| anyhow!("failed to connect to MIDI output port: {}", e))?;

        *self.connection.lock().unwrap() = Some(connection);
        *self.device_name.lock().unwrap() = Some(device_name.to_string());
        Ok(())
    }

    pub fn disconnect(&self) {
        *self.connection.lock().unwrap() = None;
        *self.device_name.lock().unwrap() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().unwrap().is_some()
    }

    pub fn device_name(&self) -> Option<String> {
        self.device_name.lock().unwrap().clone()
    }

    /// Sends raw bytes if connected; silently drops them otherwise.
    pub fn send(&self, bytes: &[u8]) {
        if let Some(conn) = self.connection.lock().unwrap().as_mut() {
            let _ = conn.send(bytes);
        }
    }
}

impl Default for MidiOutputAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autoselect_skips_pass_through_ports() {
        assert!(!is_autoselect_candidate("Midi Through Port-0"));
        assert!(!is_autoselect_candidate("LoopBe Internal MIDI"));
        assert!(is_autoselect_candidate("Arturia KeyLab 61"));
    }

    #[test]
    fn queue_drops_oldest_when_full() {
        let queue = Queue {
            items: Mutex::new(VecDeque::new()),
        };
        for i in 0..QUEUE_CAPACITY + 10 {
            queue.push(&[0x90, (i % 128) as u8, 100]);
        }
        let drained = queue.drain();
        assert_eq!(drained.len(), QUEUE_CAPACITY);
    }

    #[test]
    fn new_adapter_starts_idle() {
        let adapter = MidiInputAdapter::new();
        assert_eq!(adapter.state(), AdapterState::Idle);
    }

    #[test]
    fn restart_without_prior_attempt_is_not_cooldown_blocked() {
        let adapter = MidiInputAdapter::new();
        // No ports available in a headless test environment: the call
        // fails on port discovery, not on the cooldown gate.
        let result = adapter.restart_with_saved_device();
        assert!(result.is_err());
    }

    #[test]
    fn new_output_adapter_is_disconnected() {
        let adapter = MidiOutputAdapter::new();
        assert!(!adapter.is_connected());
        assert!(adapter.device_name().is_none());
    }

    #[test]
    fn output_adapter_send_without_connection_is_a_no_op() {
        let adapter = MidiOutputAdapter::new();
        adapter.send(&[0x90, 60, 100]);
    }
}
