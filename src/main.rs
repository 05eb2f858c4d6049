// pianoled-mapper — MIDI-to-LED mapping engine for a piano-mounted
// addressable LED strip. Listens for MIDI note events, maps each note
// to its physical LED(s), and drives the strip over DDP (or simulated,
// with no hardware attached). Calibration, playback, and learning-mode
// settings are exposed over an HTTP control surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use arbiter::{Arbiter, Producer};
use config::Args;
use control::ControlSurface;
use led_driver::{DdpLedDriver, LedDriver, SimulatedLedDriver};
use settings::Settings;

mod arbiter;
mod boot;
mod calibration;
mod color;
mod config;
mod control;
mod error;
mod event_processor;
mod geometry;
mod httpd;
mod learning;
mod led_driver;
mod mapping;
mod midi_input;
mod physics;
mod playback;
mod proportional;
mod settings;

/// Poll interval for the MIDI consumer thread when its queue is empty.
const MIDI_IDLE_SLEEP: Duration = Duration::from_millis(2);
/// Playback scheduler tick rate.
const PLAYBACK_TICK_INTERVAL: Duration = Duration::from_millis(10);

fn build_arbiter(settings: &Settings, force_simulate: bool) -> Arc<Arbiter> {
    let pixel_count = settings.led.led_count as usize;
    let driver: Box<dyn LedDriver> = if force_simulate || settings.hardware.strip_ip.is_empty() {
        Box::new(SimulatedLedDriver::new(pixel_count))
    } else {
        match DdpLedDriver::connect(&settings.hardware.strip_ip, pixel_count) {
            Ok(driver) => Box::new(driver),
            Err(e) => {
                eprintln!(
                    "failed to connect to LED strip at {}: {} (falling back to simulation)",
                    settings.hardware.strip_ip, e
                );
                Box::new(SimulatedLedDriver::new(pixel_count))
            }
        }
    };
    let arbiter = Arbiter::new(driver);
    let brightness = (settings.led.brightness.clamp(0.0, 1.0) * 255.0).round() as u8;
    let _ = arbiter.set_brightness(Producer::Boot, brightness);
    Arc::new(arbiter)
}

/// Drains the MIDI adapter's queue, resolves each message through the
/// event processor, and commits the resulting frame under
/// `Producer::EventProcessor`. Runs for the life of the process on its
/// own thread, parked briefly whenever the queue is empty.
fn spawn_midi_consumer(control: Arc<ControlSurface>, shutdown: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !shutdown.load(Ordering::Relaxed) {
            let messages = control.midi.drain();
            if messages.is_empty() {
                thread::sleep(MIDI_IDLE_SLEEP);
                continue;
            }
            for captured in messages {
                if let Some(event) = control.event_processor.process(&captured.bytes, captured.captured_at) {
                    if let Err(e) = control.event_processor.render_and_commit(&event, &control.arbiter) {
                        eprintln!("failed to commit MIDI-triggered frame: {}", e);
                    }
                }
            }
        }
    })
}

/// Renders the learning gate's expected-note hints and wrong-note
/// flashes to the strip under `Producer::Playback` (spec §4.11
/// precedence rule #2: learning overlay rides on top of playback, never
/// below it). Hints are committed first, then wrong notes in red, so
/// red wins on any LED the two sets share.
fn render_learning_overlay(control: &ControlSurface, outcome: &learning::GateOutcome) {
    let snapshot = control.mapping_snapshot();
    let ((left_white, left_black), (right_white, right_black)) = control.learning_hint_colors();

    let mut pixels: Vec<(usize, u8, u8, u8)> = Vec::new();
    for hint in &outcome.hints {
        let color = match (hint.hand, hint.played) {
            (learning::GateHand::Left, true) => left_white,
            (learning::GateHand::Left, false) => left_black,
            (learning::GateHand::Right, true) => right_white,
            (learning::GateHand::Right, false) => right_black,
        };
        if let Ok(leds) = snapshot.leds_for_note(hint.note) {
            pixels.extend(leds.iter().map(|&l| (l as usize, color.r, color.g, color.b)));
        }
    }
    for &note in &outcome.wrong_notes {
        if let Ok(leds) = snapshot.leds_for_note(note) {
            pixels.extend(leds.iter().map(|&l| (l as usize, 255, 0, 0)));
        }
    }
    if !pixels.is_empty() {
        let _ = control.arbiter.commit(Producer::Playback, &pixels);
    }
}

/// Ticks the playback engine and learning gate at a fixed rate,
/// forwarding any resulting note on/off events to the strip under
/// `Producer::Playback`. While the gate holds (`GateResult::Pause`),
/// the engine's clock is explicitly paused rather than merely skipping
/// `tick()` -- `current_time_s()` is wall-clock-derived and would keep
/// advancing otherwise -- and the gate's hints/wrong-note flashes are
/// rendered in its place.
fn spawn_playback_scheduler(control: Arc<ControlSurface>, shutdown: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut held_by_gate = false;
        while !shutdown.load(Ordering::Relaxed) {
            if control.playback.state() == playback::PlaybackState::Playing {
                let outcome = control.learning.step(control.playback.current_time_s());
                if outcome.result == learning::GateResult::Pause {
                    if !held_by_gate {
                        control.playback.pause();
                        held_by_gate = true;
                    }
                    render_learning_overlay(&control, &outcome);
                    thread::sleep(PLAYBACK_TICK_INTERVAL);
                    continue;
                }
            } else if held_by_gate && control.playback.state() == playback::PlaybackState::Paused {
                let outcome = control.learning.step(control.playback.current_time_s());
                if outcome.result == learning::GateResult::Continue {
                    control.playback.resume();
                    held_by_gate = false;
                } else {
                    render_learning_overlay(&control, &outcome);
                    thread::sleep(PLAYBACK_TICK_INTERVAL);
                    continue;
                }
            } else {
                held_by_gate = false;
            }

            let events = control.playback.tick();
            for event in events {
                let (note, on, velocity) = match event {
                    playback::PlaybackTickEvent::NoteOn { note, velocity, .. } => (note, true, velocity),
                    playback::PlaybackTickEvent::NoteOff { note, .. } => (note, false, 0),
                };
                if on {
                    control.learning.note_played(note, control.playback.current_time_s());
                }
                if let Err(e) = control.event_processor.commit_note_with_volume(
                    note,
                    on,
                    velocity,
                    control.playback.volume_multiplier(),
                    Producer::Playback,
                    &control.arbiter,
                ) {
                    eprintln!("failed to commit playback frame: {}", e);
                }
            }
            thread::sleep(PLAYBACK_TICK_INTERVAL);
        }
    })
}

fn main() -> Result<()> {
    let args = Args::parse();
    Settings::set_config_path(args.config.clone());
    let mut settings = Settings::load_with_path(args.config.as_deref())?;

    if let Some(device) = args.midi_device.clone() {
        settings.hardware.midi_device = device;
    }
    if let Some(ip) = args.strip_ip.clone() {
        settings.hardware.strip_ip = ip;
    }
    settings.sanitize();

    let arbiter = build_arbiter(&settings, args.simulate);
    let control = ControlSurface::new(settings, arbiter.clone())?;

    if !args.no_boot_animation {
        arbiter.set_owner(Producer::Boot);
        if let Err(e) = boot::run(&arbiter) {
            eprintln!("boot animation failed: {}", e);
        }
    }
    arbiter.set_owner(Producer::AllOff);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            eprintln!("shutting down");
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    let midi_device = {
        let snapshot = control.settings_snapshot();
        if snapshot.hardware.midi_device.is_empty() {
            None
        } else {
            Some(snapshot.hardware.midi_device)
        }
    };
    if let Err(e) = control.midi_start(midi_device.as_deref()) {
        if !args.quiet {
            eprintln!("MIDI input not started: {}", e);
        }
    }

    if let Some(path) = args.file.as_ref() {
        if let Err(e) = control.playback_load(std::path::Path::new(path)) {
            eprintln!("failed to load '{}': {}", path, e);
        }
    }

    let midi_thread = spawn_midi_consumer(control.clone(), shutdown.clone());
    let playback_thread = spawn_playback_scheduler(control.clone(), shutdown.clone());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let bind_addr = args.bind.clone();
    let http_control = control.clone();
    let http_shutdown = shutdown.clone();
    runtime.block_on(async move {
        let server = tokio::spawn(async move {
            if let Err(e) = httpd::run_http_server(&bind_addr, http_control).await {
                eprintln!("HTTP control surface exited: {}", e);
            }
        });

        while !http_shutdown.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        server.abort();
    });

    shutdown.store(true, Ordering::SeqCst);
    let _ = midi_thread.join();
    let _ = playback_thread.join();
    control.midi_stop();
    arbiter.set_owner(Producer::AllOff);
    let off_frame: Vec<(usize, u8, u8, u8)> = (0..arbiter.pixel_count()).map(|i| (i, 0, 0, 0)).collect();
    let _ = arbiter.commit(Producer::AllOff, &off_frame);

    Ok(())
}
