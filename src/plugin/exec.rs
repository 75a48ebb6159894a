//! Runs an external command on a configured set of MIDI notes, with a
//! per-note suppression window. Grounded in `exec.py`.

use std::collections::HashMap;
use std::process::Command;
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{PluginError, XtalkError};
use crate::message::{is_note, is_note_on, MidiMessage};

use super::{Plugin, PluginEnv};

#[derive(Debug, Deserialize, Clone)]
struct ExecEntry {
    command: Vec<String>,
    #[serde(default)]
    min_velocity: u8,
}

#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    exec: HashMap<String, Vec<ExecEntry>>,
    #[serde(default = "default_true")]
    pass: bool,
    /// Milliseconds; negative means no suppression.
    #[serde(default = "default_suppress")]
    suppress: i64,
    #[serde(default)]
    all_notes: bool,
}

fn default_true() -> bool {
    true
}

fn default_suppress() -> i64 {
    -1
}

pub struct ExecPlugin {
    table: HashMap<u8, Vec<ExecEntry>>,
    pass: bool,
    suppress_ms: i64,
    all_notes: bool,
    last_run: HashMap<u8, Instant>,
}

impl ExecPlugin {
    fn run(&self, command: &[String]) {
        if command.is_empty() {
            return;
        }
        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..]);
        // Fire-and-forget, matching the original's detached background task;
        // spawn errors are logged by the caller via env.warn.
        let _ = cmd.spawn();
    }
}

impl Plugin for ExecPlugin {
    fn process(&mut self, env: &PluginEnv, msg: MidiMessage) -> Result<Vec<MidiMessage>, PluginError> {
        let mut pass_msg = true;

        if is_note(&msg) {
            let note = msg.data1;
            let velocity = if is_note_on(&msg) { msg.data2 } else { 0 };

            if let Some(entries) = self.table.get(&note).cloned() {
                if self.all_notes || is_note_on(&msg) {
                    let now = Instant::now();
                    let suppressed = self.suppress_ms >= 0
                        && self
                            .last_run
                            .get(&note)
                            .is_some_and(|last| now.duration_since(*last).as_millis() as i64 <= self.suppress_ms);

                    if suppressed {
                        env.debug(&format!("execution for note {note} suppressed"));
                    } else {
                        self.last_run.insert(note, now);
                        for entry in &entries {
                            if velocity >= entry.min_velocity {
                                env.debug(&format!("executing: {:?}", entry.command));
                                self.run(&entry.command);
                                break;
                            }
                        }
                    }
                }

                // Even if nothing was executed, pass-suppression applies.
                pass_msg = self.pass;
            }
        }

        if pass_msg {
            Ok(vec![msg])
        } else {
            env.debug("suppressed message");
            Ok(vec![])
        }
    }
}

pub fn build(config: &Value) -> Result<Box<dyn Plugin>, XtalkError> {
    let cfg: Config = serde_json::from_value(config.clone())
        .map_err(|e| XtalkError::Config(format!("exec plugin config: {e}")))?;

    let mut table = HashMap::new();
    for (k, v) in cfg.exec {
        let note: u8 = k
            .parse()
            .map_err(|_| XtalkError::Config(format!("exec plugin: invalid note key '{k}'")))?;
        table.insert(note, v);
    }

    Ok(Box::new(ExecPlugin {
        table,
        pass: cfg.pass,
        suppress_ms: cfg.suppress,
        all_notes: cfg.all_notes,
        last_run: HashMap::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn env() -> PluginEnv {
        let sink: Arc<Mutex<dyn FnMut(MidiMessage) + Send>> = Arc::new(Mutex::new(|_: MidiMessage| {}));
        PluginEnv::new("exec", sink)
    }

    #[test]
    fn passes_through_when_pass_is_true() {
        let mut plugin = ExecPlugin {
            table: HashMap::from([(
                38,
                vec![ExecEntry {
                    command: vec!["true".into()],
                    min_velocity: 0,
                }],
            )]),
            pass: true,
            suppress_ms: -1,
            all_notes: false,
            last_run: HashMap::new(),
        };
        let out = plugin
            .process(&env(), MidiMessage::new(0x90, 38, 100))
            .unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn blocks_when_pass_is_false_even_without_a_matching_min_velocity() {
        let mut plugin = ExecPlugin {
            table: HashMap::from([(
                38,
                vec![ExecEntry {
                    command: vec!["true".into()],
                    min_velocity: 200,
                }],
            )]),
            pass: false,
            suppress_ms: -1,
            all_notes: false,
            last_run: HashMap::new(),
        };
        let out = plugin
            .process(&env(), MidiMessage::new(0x90, 38, 10))
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn unconfigured_note_passes_untouched() {
        let mut plugin = ExecPlugin {
            table: HashMap::new(),
            pass: false,
            suppress_ms: -1,
            all_notes: false,
            last_run: HashMap::new(),
        };
        let out = plugin
            .process(&env(), MidiMessage::new(0x90, 99, 10))
            .unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn suppression_window_prevents_rapid_reexecution() {
        let mut plugin = ExecPlugin {
            table: HashMap::from([(
                38,
                vec![ExecEntry {
                    command: vec!["true".into()],
                    min_velocity: 0,
                }],
            )]),
            pass: true,
            suppress_ms: 10_000,
            all_notes: false,
            last_run: HashMap::new(),
        };
        let msg = MidiMessage::new(0x90, 38, 100);
        plugin.process(&env(), msg).unwrap();
        assert!(plugin.last_run.contains_key(&38));
        let before = plugin.last_run[&38];
        plugin.process(&env(), msg).unwrap();
        // second call within the suppression window does not update last_run
        assert_eq!(plugin.last_run[&38], before);
    }
}
