//! Detects a low-volume "choke" note following a loud cymbal hit and emits
//! a synthetic aftertouch pair in its place, suppressing the choke note
//! itself. Grounded in `choke.py`.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{PluginError, XtalkError};
use crate::message::{is_note_on, MidiMessage, STATUS_AFTERTOUCH};

use super::{Plugin, PluginEnv};

#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    choke: HashMap<String, HashSet<u8>>,
    #[serde(default = "default_choke_min")]
    choke_min: HashMap<String, u8>,
    #[serde(default = "default_choke_max")]
    choke_max: HashMap<String, u8>,
    #[serde(default = "default_choke_cnt")]
    choke_cnt: HashMap<String, u32>,
    #[serde(default = "default_cymbal_min")]
    cymbal_min: HashMap<String, u8>,
    #[serde(default = "default_timeout")]
    timeout_ms: i64,
}

fn default_choke_min() -> HashMap<String, u8> {
    HashMap::from([("default".to_string(), 0)])
}
fn default_choke_max() -> HashMap<String, u8> {
    HashMap::from([("default".to_string(), 20)])
}
fn default_choke_cnt() -> HashMap<String, u32> {
    HashMap::from([("default".to_string(), 1)])
}
fn default_cymbal_min() -> HashMap<String, u8> {
    HashMap::from([("default".to_string(), 50)])
}
fn default_timeout() -> i64 {
    3000
}

/// Looks `note` up by its string form, falling back to a `"default"` entry.
fn resolve<'a, V>(map: &'a HashMap<String, V>, note: u8) -> Option<&'a V> {
    map.get(note.to_string().as_str()).or_else(|| map.get("default"))
}

pub struct ChokePlugin {
    choke: HashMap<String, HashSet<u8>>,
    choke_min: HashMap<String, u8>,
    choke_max: HashMap<String, u8>,
    choke_cnt_threshold: HashMap<String, u32>,
    cymbal_min: HashMap<String, u8>,
    timeout_ms: i64,
    notes: HashSet<u8>,

    last: Option<MidiMessage>,
    last_ts: Option<Instant>,
    last_choked: bool,
    choke_cnt: u32,
}

impl ChokePlugin {
    fn clear(&mut self) {
        self.last = None;
        self.last_ts = None;
        self.choke_cnt = 0;
        self.last_choked = false;
    }

    /// Preserves the sign of the original comparison (`last_ts - now >
    /// timeout`), which can never be true once `now` is monotonically
    /// non-decreasing relative to `last_ts`. Isolated here so a corrected
    /// `now.duration_since(last_ts) > timeout` can be swapped in later.
    fn timeout_elapsed(&self, now: Instant) -> bool {
        match self.last_ts {
            None => false,
            Some(last_ts) => {
                let diff_ms = if now >= last_ts {
                    -(now.duration_since(last_ts).as_millis() as i64)
                } else {
                    last_ts.duration_since(now).as_millis() as i64
                };
                diff_ms > self.timeout_ms
            }
        }
    }
}

impl Plugin for ChokePlugin {
    fn process(&mut self, env: &PluginEnv, msg: MidiMessage) -> Result<Vec<MidiMessage>, PluginError> {
        if !is_note_on(&msg) {
            return Ok(vec![msg]);
        }

        let note = msg.data1;
        let velocity = msg.data2;
        let now = Instant::now();

        if self.timeout_elapsed(now) {
            env.debug("choke timeout reached");
            self.clear();
        }

        let choke_min = resolve(&self.choke_min, note).copied().unwrap_or(0);
        let choke_max = resolve(&self.choke_max, note).copied().unwrap_or(20);

        let is_choke_indicator = self.last.is_some()
            && velocity >= choke_min
            && velocity <= choke_max
            && resolve(&self.choke, note).is_some_and(|set| set.contains(&self.last.unwrap().data1));

        if is_choke_indicator {
            env.debug(&format!("choke note: {msg:?}"));
            self.choke_cnt += 1;
            let choke_cnt_threshold = resolve(&self.choke_cnt_threshold, note).copied().unwrap_or(1);
            let mut out = Vec::new();
            if self.choke_cnt >= choke_cnt_threshold && !self.last_choked {
                let last = self.last.unwrap();
                let channel = last.status & 0x0F;
                out.push(MidiMessage::new(STATUS_AFTERTOUCH | channel, last.data1, 127));
                out.push(MidiMessage::new(STATUS_AFTERTOUCH | channel, last.data1, 0));
                self.last_choked = true;
            }
            return Ok(out);
        }

        if self.notes.contains(&note) {
            self.clear();
            let cymbal_min = resolve(&self.cymbal_min, note).copied().unwrap_or(50);
            if velocity >= cymbal_min {
                env.debug(&format!("regular cymbal hit: {msg:?}"));
                self.last = Some(msg);
                self.last_ts = Some(now);
                self.last_choked = false;
            }
        }

        Ok(vec![msg])
    }
}

pub fn build(config: &Value) -> Result<Box<dyn Plugin>, XtalkError> {
    let cfg: Config = serde_json::from_value(config.clone())
        .map_err(|e| XtalkError::Config(format!("choke plugin config: {e}")))?;

    let mut notes = HashSet::new();
    for set in cfg.choke.values() {
        notes.extend(set.iter().copied());
    }

    Ok(Box::new(ChokePlugin {
        choke: cfg.choke,
        choke_min: cfg.choke_min,
        choke_max: cfg.choke_max,
        choke_cnt_threshold: cfg.choke_cnt,
        cymbal_min: cfg.cymbal_min,
        timeout_ms: cfg.timeout_ms,
        notes,
        last: None,
        last_ts: None,
        last_choked: false,
        choke_cnt: 0,
    }))
}
