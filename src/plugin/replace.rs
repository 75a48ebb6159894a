//! Replaces incoming MIDI notes with other notes, either statically or
//! toggled at runtime by trigger notes or a TCP control socket. Grounded in
//! `replace.py`.
//!
//! Commands close the connection on any read or decode error rather than
//! retrying, unlike the original's `while line:` loop that swallows read
//! errors and keeps looping on a socket that will never produce more data.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{PluginError, XtalkError};
use crate::message::{is_note, is_note_on, MidiMessage};

use super::{Plugin, PluginEnv};

#[derive(Debug, Deserialize, Clone)]
struct ReplacementConfig {
    id: Option<String>,
    #[serde(default)]
    from: HashSet<u8>,
    to: u8,
    #[serde(default)]
    enable: HashSet<u8>,
    #[serde(default)]
    disable: HashSet<u8>,
    #[serde(default)]
    enabled: bool,
}

#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    server: bool,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_address")]
    address: String,
    #[serde(default)]
    replace: Vec<ReplacementConfig>,
}

fn default_port() -> u16 {
    1560
}
fn default_address() -> String {
    "localhost".to_string()
}

struct State {
    replace: Vec<ReplacementConfig>,
    active: HashMap<u8, u8>,
    triggers: HashMap<u8, HashSet<usize>>,
    cmd_index: usize,
}

impl State {
    fn enable(&mut self, idx: usize, force: bool) {
        if force || !self.replace[idx].enabled {
            let to = self.replace[idx].to;
            for note in self.replace[idx].from.clone() {
                self.active.insert(note, to);
            }
            self.replace[idx].enabled = true;
        }
    }

    fn disable(&mut self, idx: usize) {
        if self.replace[idx].enabled {
            for note in self.replace[idx].from.clone() {
                self.active.remove(&note);
            }
            self.replace[idx].enabled = false;
        }
    }

    fn disable_all(&mut self) {
        for idx in 0..self.replace.len() {
            self.disable(idx);
        }
    }

    fn toggle(&mut self, idx: usize) {
        if self.replace[idx].enabled {
            self.disable(idx);
        } else {
            self.enable(idx, false);
        }
    }

    /// Resolves a command's id argument to replacement indices, supporting
    /// `next`/`previous` cursor movement in addition to literal ids.
    fn find_indices(&mut self, id_str: &str) -> Vec<usize> {
        if self.replace.is_empty() {
            return Vec::new();
        }
        match id_str {
            "next" => {
                self.cmd_index = (self.cmd_index + 1) % self.replace.len();
                vec![self.cmd_index]
            }
            "previous" => {
                self.cmd_index = (self.cmd_index + self.replace.len() - 1) % self.replace.len();
                vec![self.cmd_index]
            }
            _ => self
                .replace
                .iter()
                .enumerate()
                .filter(|(_, r)| r.id.as_deref() == Some(id_str))
                .map(|(i, _)| i)
                .collect(),
        }
    }
}

pub struct ReplacePlugin {
    state: Arc<Mutex<State>>,
    server: bool,
    address: String,
    port: u16,
    started: bool,
}

impl ReplacePlugin {
    fn spawn_server(state: Arc<Mutex<State>>, address: String, port: u16, env: PluginEnv) {
        thread::spawn(move || {
            let listener = match TcpListener::bind((address.as_str(), port)) {
                Ok(listener) => listener,
                Err(e) => {
                    env.warn(&format!("failed to bind TCP control socket {address}:{port}: {e}"));
                    return;
                }
            };
            env.debug(&format!("listening for TCP control commands on {address}:{port}"));

            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let state = Arc::clone(&state);
                        let env = env.clone();
                        thread::spawn(move || Self::handle_client(stream, state, env));
                    }
                    Err(e) => env.warn(&format!("accept failed: {e}")),
                }
            }
        });
    }

    fn handle_client(stream: TcpStream, state: Arc<Mutex<State>>, env: PluginEnv) {
        env.debug("client connected");
        let reader = BufReader::new(stream);

        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };

            let mut parts = line.trim().splitn(2, ' ');
            let cmd = parts.next().unwrap_or("");
            let id_str = parts.next().unwrap_or("").trim();
            if cmd.is_empty() {
                continue;
            }

            let mut state = state.lock().unwrap();
            let indices = state.find_indices(id_str);
            if indices.is_empty() {
                env.debug(&format!("unexpected id: {line}"));
                continue;
            }

            match cmd {
                "enable" => {
                    for idx in &indices {
                        state.enable(*idx, false);
                    }
                }
                "disable" => {
                    for idx in &indices {
                        state.disable(*idx);
                    }
                }
                "toggle" => {
                    for idx in &indices {
                        state.toggle(*idx);
                    }
                }
                "unique" => {
                    state.disable_all();
                    for idx in &indices {
                        state.enable(*idx, true);
                    }
                }
                other => env.debug(&format!("unexpected command: {other}")),
            }
        }

        env.debug("client disconnected");
    }
}

impl Plugin for ReplacePlugin {
    fn start(&mut self, env: &PluginEnv) {
        if self.server && !self.started {
            self.started = true;
            Self::spawn_server(Arc::clone(&self.state), self.address.clone(), self.port, env.clone());
        }
    }

    fn process(&mut self, env: &PluginEnv, mut msg: MidiMessage) -> Result<Vec<MidiMessage>, PluginError> {
        if is_note(&msg) {
            let note = msg.data1;
            let mut state = self.state.lock().unwrap();

            if is_note_on(&msg) {
                if let Some(indices) = state.triggers.get(&note).cloned() {
                    for idx in indices {
                        let (is_enable_trigger, is_disable_trigger) = {
                            let repl = &state.replace[idx];
                            (repl.enable.contains(&note), repl.disable.contains(&note))
                        };
                        if is_enable_trigger && is_disable_trigger {
                            state.toggle(idx);
                        } else if is_enable_trigger {
                            state.enable(idx, false);
                        } else {
                            state.disable(idx);
                        }
                    }
                }
            }

            let note_to = state.active.get(&note).copied().unwrap_or(note);
            if note_to != note {
                env.debug(&format!("replaced {note} -> {note_to}"));
            }
            msg.data1 = note_to;
        }

        Ok(vec![msg])
    }
}

pub fn build(config: &Value) -> Result<Box<dyn Plugin>, XtalkError> {
    let cfg: Config = serde_json::from_value(config.clone())
        .map_err(|e| XtalkError::Config(format!("replace plugin config: {e}")))?;

    let mut triggers: HashMap<u8, HashSet<usize>> = HashMap::new();
    let mut active = HashMap::new();
    for (idx, repl) in cfg.replace.iter().enumerate() {
        if repl.enabled {
            for &note in &repl.from {
                active.insert(note, repl.to);
            }
        }
        for &note in repl.enable.iter().chain(repl.disable.iter()) {
            triggers.entry(note).or_default().insert(idx);
        }
    }

    let state = Arc::new(Mutex::new(State {
        replace: cfg.replace,
        active,
        triggers,
        cmd_index: 0,
    }));

    Ok(Box::new(ReplacePlugin {
        state,
        server: cfg.server,
        address: cfg.address,
        port: cfg.port,
        started: false,
    }))
}
