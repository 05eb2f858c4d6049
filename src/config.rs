// Config Module - command-line argument parsing.
//
// Persisted settings live in `settings.rs`; this module only covers
// the process's command-line surface, in the style of the teacher's
// original `clap::Parser` `Args` struct (same derive, same short/long
// flag conventions) trimmed to what this program actually takes.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "LED-to-key mapping engine and MIDI event pipeline for a piano-mounted addressable LED strip",
    long_about = "Listens for MIDI note events on a USB keyboard controller, maps each note to its \
                  physical LED(s) on a strip mounted along the keybed, and drives the strip over DDP.\n\
                  Calibration, playback, and learning-mode settings persist to a TOML file and can be \
                  adjusted at runtime through the HTTP control surface."
)]
pub struct Args {
    /// Path to a settings file, or a bare name resolved under
    /// ~/.config/pianoled-mapper/ (default: settings.toml)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Address the HTTP control surface binds to
    #[arg(short, long, default_value = "127.0.0.1:7373")]
    pub bind: String,

    /// MIDI input device name (substring match); auto-selects the
    /// first non-loopback port when omitted
    #[arg(short, long)]
    pub midi_device: Option<String>,

    /// DDP target IP for the LED strip; runs the simulated driver
    /// when omitted
    #[arg(short = 'i', long)]
    pub strip_ip: Option<String>,

    /// Run with the simulated LED driver even if hardware.strip_ip is
    /// configured (useful for developing without a strip attached)
    #[arg(long)]
    pub simulate: bool,

    /// MIDI file to load into the playback engine at startup
    #[arg(short = 'f', long)]
    pub file: Option<String>,

    /// Skip the boot animation
    #[arg(long)]
    pub no_boot_animation: bool,

    /// Quiet mode: suppress non-error stdout output
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bind_address_override() {
        let args = Args::parse_from(["pianoled-mapper", "--bind", "0.0.0.0:9000"]);
        assert_eq!(args.bind, "0.0.0.0:9000");
    }

    #[test]
    fn default_bind_address_is_localhost() {
        let args = Args::parse_from(["pianoled-mapper"]);
        assert_eq!(args.bind, "127.0.0.1:7373");
    }

    #[test]
    fn simulate_flag_defaults_false() {
        let args = Args::parse_from(["pianoled-mapper"]);
        assert!(!args.simulate);
    }
}
