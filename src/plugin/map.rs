//! Static note substitution, independent of the `replace` plugin's dynamic
//! triggers. Grounded in `example.py`'s note-rewrite idiom.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{PluginError, XtalkError};
use crate::message::{is_note_on, MidiMessage};

use super::{Plugin, PluginEnv};

#[derive(Debug, Deserialize, Default)]
struct Config {
    /// `from_note -> to_note`, keyed by string since JSON object keys are strings.
    #[serde(default)]
    map: HashMap<String, u8>,
}

pub struct MapPlugin {
    table: HashMap<u8, u8>,
}

impl Plugin for MapPlugin {
    fn process(&mut self, _env: &PluginEnv, mut msg: MidiMessage) -> Result<Vec<MidiMessage>, PluginError> {
        if is_note_on(&msg) {
            if let Some(&to) = self.table.get(&msg.data1) {
                msg.data1 = to;
            }
        }
        Ok(vec![msg])
    }
}

pub fn build(config: &Value) -> Result<Box<dyn Plugin>, XtalkError> {
    let cfg: Config = serde_json::from_value(config.clone())
        .map_err(|e| XtalkError::Config(format!("map plugin config: {e}")))?;

    let mut table = HashMap::new();
    for (k, v) in cfg.map {
        let from: u8 = k
            .parse()
            .map_err(|_| XtalkError::Config(format!("map plugin: invalid note key '{k}'")))?;
        table.insert(from, v);
    }

    Ok(Box::new(MapPlugin { table }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn env() -> PluginEnv {
        let sink: Arc<Mutex<dyn FnMut(MidiMessage) + Send>> = Arc::new(Mutex::new(|_: MidiMessage| {}));
        PluginEnv::new("map", sink)
    }

    #[test]
    fn rewrites_mapped_note_on() {
        let mut plugin = MapPlugin {
            table: HashMap::from([(59, 53)]),
        };
        let out = plugin
            .process(&env(), MidiMessage::new(0x90, 59, 80))
            .unwrap();
        assert_eq!(out[0].data1, 53);
    }

    #[test]
    fn leaves_unmapped_note_untouched() {
        let mut plugin = MapPlugin {
            table: HashMap::from([(59, 53)]),
        };
        let out = plugin
            .process(&env(), MidiMessage::new(0x90, 60, 80))
            .unwrap();
        assert_eq!(out[0].data1, 60);
    }

    #[test]
    fn does_not_rewrite_note_off() {
        let mut plugin = MapPlugin {
            table: HashMap::from([(59, 53)]),
        };
        let out = plugin
            .process(&env(), MidiMessage::new(0x80, 59, 0))
            .unwrap();
        assert_eq!(out[0].data1, 59);
    }
}
