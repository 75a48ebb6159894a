//! Stateful, synchronous plugin chain (C5).

pub mod amplify;
pub mod choke;
pub mod exec;
pub mod keyboard;
pub mod map;
pub mod replace;
pub mod replay;
pub mod timing;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde_json::Value;

use crate::error::{PluginError, XtalkError};
use crate::message::MidiMessage;

/// Everything a plugin needs from the host that isn't its own config: a way
/// to inject a message directly at the MIDI output, bypassing the rest of
/// the chain, and logging helpers tagged with the plugin's own name.
#[derive(Clone)]
pub struct PluginEnv {
    name: &'static str,
    output: Arc<Mutex<dyn FnMut(MidiMessage) + Send>>,
}

impl PluginEnv {
    pub fn new(name: &'static str, output: Arc<Mutex<dyn FnMut(MidiMessage) + Send>>) -> Self {
        Self { name, output }
    }

    /// Injects `msg` directly to the MIDI output, bypassing downstream plugins.
    pub fn send(&self, msg: MidiMessage) {
        let mut out = self.output.lock().unwrap();
        out(msg);
    }

    pub fn debug(&self, msg: &str) {
        debug!(target: "xtalk::plugin", "[{}] {}", self.name, msg);
    }

    pub fn warn(&self, msg: &str) {
        warn!(target: "xtalk::plugin", "[{}] {}", self.name, msg);
    }
}

/// A single stage in the pipeline's plugin chain.
pub trait Plugin: Send {
    /// Processes one input message, returning 0..N output messages that
    /// become the input batch for the next plugin.
    fn process(&mut self, env: &PluginEnv, msg: MidiMessage) -> Result<Vec<MidiMessage>, PluginError>;

    /// Called once after construction, before any `process` call.
    fn start(&mut self, _env: &PluginEnv) {}

    /// Called once when the pipeline shuts down.
    fn stop(&mut self, _env: &PluginEnv) {}
}

pub type PluginFactory = fn(&Value) -> Result<Box<dyn Plugin>, XtalkError>;

/// Builds the static `name -> factory` registry. No dynamic loading: every
/// plugin the crate knows about is listed here at build time.
pub fn registry() -> HashMap<&'static str, PluginFactory> {
    let mut reg: HashMap<&'static str, PluginFactory> = HashMap::new();
    reg.insert("map", map::build);
    reg.insert("amplify", amplify::build);
    reg.insert("exec", exec::build);
    reg.insert("keyboard", keyboard::build);
    reg.insert("replay", replay::build);
    reg.insert("timing", timing::build);
    reg.insert("replace", replace::build);
    reg.insert("choke", choke::build);
    reg
}

/// One entry in the configured chain: a concrete plugin instance paired with
/// the name it was registered under (for logging and config lookup).
pub struct ChainEntry {
    pub name: &'static str,
    pub plugin: Box<dyn Plugin>,
    pub env: PluginEnv,
}

/// Loads the plugin config file (if it exists) and resolves, for each
/// declared plugin instance, its config value: first by declaration index
/// (as a string key), falling back to the plugin name.
pub fn load_plugin_config(path: &std::path::Path) -> Result<Value, XtalkError> {
    if !path.exists() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    let text = std::fs::read_to_string(path).map_err(|source| XtalkError::PluginConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| XtalkError::PluginConfigJson {
        path: path.display().to_string(),
        source,
    })
}

pub fn config_for(full_config: &Value, index: usize, name: &str) -> Value {
    let by_index = full_config.get(index.to_string());
    let by_name = full_config.get(name);
    by_index
        .or(by_name)
        .cloned()
        .unwrap_or(Value::Object(serde_json::Map::new()))
}

/// Reserved config key the timing plugin reads `pipeline_delay` from, merged
/// in here rather than threaded through `PluginFactory`'s signature since the
/// registry only has room for a plugin's own config value.
const PIPELINE_DELAY_KEY: &str = "_pipeline_delay_ms";

/// Builds the configured chain of plugin instances, in declared order.
/// `pipeline_delay_ms` is `--delay`'s resolved value, merged into every
/// plugin's config under [`PIPELINE_DELAY_KEY`] (currently only consumed by
/// the timing plugin's reference-click offset calculation).
pub fn build_chain(
    names: &[String],
    full_config: &Value,
    pipeline_delay_ms: i64,
    output: Arc<Mutex<dyn FnMut(MidiMessage) + Send>>,
) -> Result<Vec<ChainEntry>, XtalkError> {
    let reg = registry();
    let mut chain = Vec::with_capacity(names.len());

    for (index, raw_name) in names.iter().enumerate() {
        let (&name, &factory) = reg
            .get_key_value(raw_name.as_str())
            .ok_or_else(|| XtalkError::UnknownPlugin(raw_name.clone()))?;

        let mut cfg = config_for(full_config, index, raw_name);
        if let Value::Object(map) = &mut cfg {
            map.insert(PIPELINE_DELAY_KEY.to_string(), Value::from(pipeline_delay_ms));
        }
        let mut plugin = factory(&cfg)?;
        let env = PluginEnv::new(name, Arc::clone(&output));
        plugin.start(&env);

        chain.push(ChainEntry { name, plugin, env });
    }

    Ok(chain)
}

/// Runs `msg` through `chain` in order. An [`PluginError::Abort`] from any
/// plugin propagates immediately; any other error is logged and that
/// plugin's output for this message is treated as empty.
pub fn run_chain(chain: &mut [ChainEntry], msg: MidiMessage) -> Result<Vec<MidiMessage>, PluginError> {
    let mut batch = vec![msg];

    for entry in chain.iter_mut() {
        let mut next_batch = Vec::new();
        for m in batch {
            match entry.plugin.process(&entry.env, m) {
                Ok(out) => next_batch.extend(out),
                Err(PluginError::Abort(reason)) => return Err(PluginError::Abort(reason)),
                Err(other) => {
                    entry.env.warn(&format!("process failed: {other}"));
                }
            }
        }
        batch = next_batch;
    }

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;
    impl Plugin for Echo {
        fn process(&mut self, _env: &PluginEnv, msg: MidiMessage) -> Result<Vec<MidiMessage>, PluginError> {
            Ok(vec![msg])
        }
    }

    struct Aborting;
    impl Plugin for Aborting {
        fn process(&mut self, _env: &PluginEnv, _msg: MidiMessage) -> Result<Vec<MidiMessage>, PluginError> {
            Err(PluginError::Abort("shutdown requested".into()))
        }
    }

    struct Failing;
    impl Plugin for Failing {
        fn process(&mut self, _env: &PluginEnv, _msg: MidiMessage) -> Result<Vec<MidiMessage>, PluginError> {
            Err(PluginError::Failed(anyhow::anyhow!("boom")))
        }
    }

    fn env() -> PluginEnv {
        let sink: Arc<Mutex<dyn FnMut(MidiMessage) + Send>> = Arc::new(Mutex::new(|_: MidiMessage| {}));
        PluginEnv::new("test", sink)
    }

    #[test]
    fn run_chain_passes_message_through_echo() {
        let msg = MidiMessage::new(0x90, 60, 100);
        let mut chain = vec![ChainEntry {
            name: "echo",
            plugin: Box::new(Echo),
            env: env(),
        }];
        let out = run_chain(&mut chain, msg).unwrap();
        assert_eq!(out, vec![msg]);
    }

    #[test]
    fn abort_propagates_as_error() {
        let msg = MidiMessage::new(0x90, 60, 100);
        let mut chain = vec![ChainEntry {
            name: "aborting",
            plugin: Box::new(Aborting),
            env: env(),
        }];
        let result = run_chain(&mut chain, msg);
        assert!(matches!(result, Err(PluginError::Abort(_))));
    }

    #[test]
    fn recoverable_failure_yields_empty_output_and_continues() {
        let msg = MidiMessage::new(0x90, 60, 100);
        let mut chain = vec![
            ChainEntry {
                name: "failing",
                plugin: Box::new(Failing),
                env: env(),
            },
            ChainEntry {
                name: "echo",
                plugin: Box::new(Echo),
                env: env(),
            },
        ];
        let out = run_chain(&mut chain, msg).unwrap();
        assert!(out.is_empty());
    }
}
