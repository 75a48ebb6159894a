//! Logs the key combination a note-on/note-off pair would emulate. No OS
//! key-injection dependency is added here: real key injection is a
//! platform-gated concern, the same split the teacher makes between its
//! generic `InputEngine` trait and its `windows`-only implementation.
//! Grounded in `keyboard.py`'s mapping table shape.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{PluginError, XtalkError};
use crate::message::{is_note, is_note_off, is_note_on, MidiMessage};

use super::{Plugin, PluginEnv};

#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    pass: bool,
    #[serde(default)]
    mapping: HashMap<String, Vec<Vec<String>>>,
}

pub struct KeyboardPlugin {
    pass: bool,
    /// `note -> sequence of key combinations`, one per successive strike.
    mapping: HashMap<u8, Vec<Vec<String>>>,
}

impl Plugin for KeyboardPlugin {
    fn process(&mut self, env: &PluginEnv, msg: MidiMessage) -> Result<Vec<MidiMessage>, PluginError> {
        let mut pass_msg = true;

        if is_note(&msg) {
            if let Some(combos) = self.mapping.get(&msg.data1) {
                pass_msg = self.pass;
                let keys = combos.first();

                if is_note_on(&msg) {
                    env.debug(&format!(
                        "note {} down -> press {:?}",
                        msg.data1,
                        keys.unwrap_or(&Vec::new())
                    ));
                } else if is_note_off(&msg) {
                    env.debug(&format!(
                        "note {} up -> release {:?}",
                        msg.data1,
                        keys.unwrap_or(&Vec::new())
                    ));
                }
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
        .map_err(|e| XtalkError::Config(format!("keyboard plugin config: {e}")))?;

    let mut mapping = HashMap::new();
    for (k, v) in cfg.mapping {
        let note: u8 = k
            .parse()
            .map_err(|_| XtalkError::Config(format!("keyboard plugin: invalid note key '{k}'")))?;
        mapping.insert(note, v);
    }

    Ok(Box::new(KeyboardPlugin {
        pass: cfg.pass,
        mapping,
    }))
}
