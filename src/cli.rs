//! Command-line arguments (C12).

use std::path::PathBuf;

use clap::Parser;

use crate::error::XtalkError;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "xtalk",
    about = "Real-time MIDI cross-talk cancellation filter with a plugin chain"
)]
pub struct Args {
    /// Input port, by number or name substring. Defaults to a virtual port.
    #[arg(short = 'I', long)]
    pub input: Option<String>,

    /// Output port, by number or name substring. Defaults to a virtual port.
    #[arg(short = 'O', long)]
    pub output: Option<String>,

    /// Look-ahead delay in milliseconds before dispatching a message.
    #[arg(short, long, default_value_t = 5)]
    pub delay: i64,

    /// Lifetime of history entries in milliseconds.
    #[arg(short = 'H', long, default_value_t = 150)]
    pub history: i64,

    /// Default cross-talk threshold percentage (0..=100) for rules that don't set one.
    #[arg(short, long, default_value_t = 30)]
    pub threshold: i64,

    /// Default minimum velocity (0..=127) for rules that don't set one.
    #[arg(short, long, default_value_t = 0)]
    pub minimum: i64,

    /// Cache non-note messages until the next note-on instead of forwarding immediately.
    #[arg(short, long, default_value_t = false)]
    pub before: bool,

    /// MIDI client name used for virtual ports and plugin ports.
    #[arg(short, long, default_value = "xtalk")]
    pub client: String,

    /// MIDI API backend: jack, alsa, or default.
    #[arg(short, long, default_value = "default")]
    pub api: String,

    /// File or directory of JSON cross-talk policies.
    #[arg(short = 'P', long)]
    pub policy: Option<PathBuf>,

    /// Which non-note-on events count as "disable" events: none, note_off, aftertouch, any.
    #[arg(long, default_value = "aftertouch")]
    pub dtypes: String,

    /// Comma-separated plugin names, applied in order.
    #[arg(long)]
    pub plugins: Option<String>,

    /// Plugin config JSON file.
    #[arg(long, default_value = "plugins/config.json")]
    pub plugins_config: PathBuf,

    /// Sets threshold/delay/history/minimum to 0, leaving filtering entirely to plugins.
    #[arg(long, default_value_t = false)]
    pub plugins_only: bool,

    /// Enumerate MIDI APIs and ports, then exit.
    #[arg(long, default_value_t = false)]
    pub list: bool,

    /// Force debug-level tracing for this crate regardless of RUST_LOG.
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

/// Which "disable" event kinds the ingress records into the `DISABLED` history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableKind {
    None,
    NoteOff,
    Aftertouch,
    Any,
}

impl Args {
    /// Parses and range-checks a concrete `Args`, mutating `delay`/`history`/
    /// `threshold`/`minimum` to 0 when `plugins_only` is set.
    pub fn parse_validated() -> Result<Self, XtalkError> {
        let mut args = Self::parse();
        args.validate()?;
        if args.plugins_only {
            args.threshold = 0;
            args.delay = 0;
            args.history = 0;
            args.minimum = 0;
        }
        Ok(args)
    }

    fn validate(&self) -> Result<(), XtalkError> {
        if self.delay < 0 {
            return Err(XtalkError::Config(format!(
                "--delay must be >= 0, got {}",
                self.delay
            )));
        }
        if self.history < 0 {
            return Err(XtalkError::Config(format!(
                "--history must be >= 0, got {}",
                self.history
            )));
        }
        if !(0..=100).contains(&self.threshold) {
            return Err(XtalkError::Config(format!(
                "--threshold must be in 0..=100, got {}",
                self.threshold
            )));
        }
        if !(0..=128).contains(&self.minimum) {
            return Err(XtalkError::Config(format!(
                "--minimum must be in 0..=128, got {}",
                self.minimum
            )));
        }
        Ok(())
    }

    pub fn dtypes(&self) -> DisableKind {
        match self.dtypes.as_str() {
            "none" => DisableKind::None,
            "note_off" => DisableKind::NoteOff,
            "any" => DisableKind::Any,
            _ => DisableKind::Aftertouch,
        }
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins
            .as_deref()
            .map(|s| s.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        let mut full = vec!["xtalk"];
        full.extend_from_slice(args);
        Args::try_parse_from(full)
    }

    #[test]
    fn defaults_parse_successfully() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.delay, 5);
        assert_eq!(args.history, 150);
        assert_eq!(args.threshold, 30);
        assert_eq!(args.dtypes(), DisableKind::Aftertouch);
    }

    #[test]
    fn negative_delay_is_rejected_at_validation() {
        let args = parse(&["--delay", "-1"]).unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let args = parse(&["--threshold", "150"]).unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn plugin_names_splits_and_trims_comma_list() {
        let args = parse(&["--plugins", "choke, replay ,map"]).unwrap();
        assert_eq!(args.plugin_names(), vec!["choke", "replay", "map"]);
    }

    #[test]
    fn no_plugins_yields_empty_list() {
        let args = parse(&[]).unwrap();
        assert!(args.plugin_names().is_empty());
    }
}
