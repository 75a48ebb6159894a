//! Linear velocity scaling per note (C10). Grounded in `amplify.py`.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{PluginError, XtalkError};
use crate::message::{is_note_on, MidiMessage};

use super::{Plugin, PluginEnv};

#[derive(Debug, Deserialize, Clone, Copy)]
struct Factor {
    #[serde(default = "default_multiply")]
    multiply: i64,
    #[serde(default)]
    add: i64,
}

fn default_multiply() -> i64 {
    100
}

#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    amplify: HashMap<String, Factor>,
}

pub struct AmplifyPlugin {
    table: HashMap<u8, Factor>,
}

impl Plugin for AmplifyPlugin {
    fn process(&mut self, env: &PluginEnv, mut msg: MidiMessage) -> Result<Vec<MidiMessage>, PluginError> {
        if is_note_on(&msg) {
            if let Some(factor) = self.table.get(&msg.data1) {
                let mul = factor.multiply as f64 / 100.0;
                let raw = msg.data2 as f64 * mul + factor.add as f64;
                let new_velocity = raw.round().clamp(0.0, 127.0) as u8;
                env.debug(&format!(
                    "note {}: mul {mul}, add {} -> new velocity {new_velocity}",
                    msg.data1, factor.add
                ));
                msg.data2 = new_velocity;
            }
        }
        Ok(vec![msg])
    }
}

pub fn build(config: &Value) -> Result<Box<dyn Plugin>, XtalkError> {
    let cfg: Config = serde_json::from_value(config.clone())
        .map_err(|e| XtalkError::Config(format!("amplify plugin config: {e}")))?;

    let mut table = HashMap::new();
    for (k, v) in cfg.amplify {
        let note: u8 = k
            .parse()
            .map_err(|_| XtalkError::Config(format!("amplify plugin: invalid note key '{k}'")))?;
        table.insert(note, v);
    }

    Ok(Box::new(AmplifyPlugin { table }))
}
