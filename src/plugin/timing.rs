//! Checks incoming MIDI notes against a reference click on its own virtual
//! MIDI port pair, reporting early/late hits and auto-calibrating. Grounded
//! in `time.py`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;

use crate::error::{PluginError, XtalkError};
use crate::message::{is_note_on, MidiMessage};
use crate::scheduler::Scheduler;
use crate::transport;

use super::{Plugin, PluginEnv};

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    control: HashSet<u8>,
    #[serde(default = "default_client")]
    client: String,
    #[serde(default = "default_delay")]
    delay: i64,
    #[serde(default = "default_play_interval")]
    play_interval: i64,
    #[serde(default = "default_accept_range")]
    accept_range: i64,
    #[serde(default = "default_max_diff")]
    max_diff: i64,
    #[serde(default = "default_error_early")]
    error_early: u8,
    #[serde(default = "default_error_late")]
    error_late: u8,
    #[serde(default = "default_error_velocity")]
    error_velocity: i64,
    #[serde(default)]
    drop: bool,
    #[serde(default)]
    calibration: i64,
    #[serde(default = "default_true")]
    auto_calibration: bool,
    #[serde(rename = "_pipeline_delay_ms", default)]
    pipeline_delay_ms: i64,
}

fn default_client() -> String {
    "time".to_string()
}
fn default_delay() -> i64 {
    3000
}
fn default_play_interval() -> i64 {
    1
}
fn default_accept_range() -> i64 {
    30
}
fn default_max_diff() -> i64 {
    100
}
fn default_error_early() -> u8 {
    1
}
fn default_error_late() -> u8 {
    2
}
fn default_error_velocity() -> i64 {
    127
}
fn default_true() -> bool {
    true
}

/// One entry in the reference click's search buffer: arrival timestamp plus
/// the original click message (kept for `PLAY_INTERVAL` thinning decisions).
struct BufferEntry {
    at: Instant,
    #[allow(dead_code)]
    msg: MidiMessage,
}

struct Shared {
    buffer: Mutex<Vec<BufferEntry>>,
    index: Mutex<i64>,
}

pub struct TimingPlugin {
    control: HashSet<u8>,
    delay_ms: i64,
    play_interval: i64,
    accept_range: i64,
    max_diff_ms: i64,
    error_early: u8,
    error_late: u8,
    error_velocity: i64,
    drop_on_error: bool,
    calibration_ms: i64,
    auto_calibration: bool,
    pipeline_delay_ms: i64,

    enabled: bool,
    calib_ns: Mutex<i64>,
    calib_update_cnt: Mutex<u32>,

    shared: Arc<Shared>,
    scheduler: Arc<Scheduler>,
    output: Arc<Mutex<midir::MidiOutputConnection>>,
    #[allow(dead_code)]
    input: Option<midir::MidiInputConnection<()>>,
}

impl TimingPlugin {
    /// Index of the buffer entry closest in time to `reference`, and that
    /// entry's nearest neighbour's timestamp, mirroring `get_closest`/
    /// `get_neighbour_time`.
    fn closest_with_neighbour(buffer: &[BufferEntry], reference: Instant) -> Option<(usize, Instant)> {
        if buffer.is_empty() {
            return None;
        }

        let mut closest_idx = 0;
        let mut min_diff: Option<Duration> = None;
        for (i, entry) in buffer.iter().enumerate() {
            let diff = if entry.at >= reference {
                entry.at - reference
            } else {
                reference - entry.at
            };
            if min_diff.is_none_or(|m| diff < m) {
                min_diff = Some(diff);
                closest_idx = i;
            }
        }

        let prv = if closest_idx > 0 {
            Some(buffer[closest_idx - 1].at)
        } else {
            None
        };
        let nxt = buffer.get(closest_idx + 1).map(|e| e.at);

        let neighbour = match (prv, nxt) {
            (None, None) => return None,
            (Some(p), None) => p,
            (None, Some(n)) => n,
            (Some(p), Some(n)) => {
                let item = buffer[closest_idx].at;
                let pdiff = if p >= item { p - item } else { item - p };
                let ndiff = if n >= item { n - item } else { item - n };
                if pdiff < ndiff {
                    p
                } else {
                    n
                }
            }
        };

        Some((closest_idx, neighbour))
    }

    /// Returns `(in_time, diff_ms)` where `diff_ms` is signed: positive means
    /// the input arrived after the reference click (late).
    fn check_time(&self, now: Instant, env: &PluginEnv) -> (bool, i64) {
        let total_offset_ms = self.delay_ms + self.pipeline_delay_ms + self.calibration_ms;
        let auto_calib_ns = *self.calib_ns.lock().unwrap();
        // auto_calib_ns is a signed cumulative mean (see below) and can be
        // negative when the player is consistently early, so the shift is
        // computed signed instead of clamped before subtracting from `now`.
        let shift_ns = total_offset_ms.max(0) * 1_000_000 + auto_calib_ns;
        let c_now = shift_instant(now, shift_ns);

        let buffer = self.shared.buffer.lock().unwrap();
        let Some((closest_idx, neighbour)) = Self::closest_with_neighbour(&buffer, c_now) else {
            env.warn("could not find a neighbour in the reference click; consider increasing delay");
            return (true, 0);
        };

        let closest_at = buffer[closest_idx].at;
        let diff_ns = signed_diff_ns(c_now, closest_at);
        let neighbour_gap_ns = signed_diff_ns(closest_at, neighbour).unsigned_abs() as i64;

        let mut acceptable_ns = neighbour_gap_ns * self.accept_range / 100;
        let max_diff_ns = self.max_diff_ms * 1_000_000;
        if self.max_diff_ms >= 0 && acceptable_ns > max_diff_ns {
            acceptable_ns = max_diff_ns;
        }

        let ok = diff_ns.abs() <= acceptable_ns;
        drop(buffer);

        if ok && self.auto_calibration {
            let mut cnt = self.calib_update_cnt.lock().unwrap();
            if *cnt < 100 {
                let mut calib = self.calib_ns.lock().unwrap();
                *calib = (diff_ns + *cnt as i64 * *calib) / (*cnt as i64 + 1);
                *cnt += 1;
            }
        }

        (ok, diff_ns / 1_000_000)
    }

    fn send_error(&self, env: &PluginEnv, original: MidiMessage, diff_ms: i64) {
        let velocity = if (0..=127).contains(&self.error_velocity) {
            self.error_velocity as u8
        } else {
            original.data2
        };
        let note = if diff_ms > 0 {
            self.error_late
        } else {
            self.error_early
        };

        let on = MidiMessage::new(0x9F, note, velocity);
        let off = MidiMessage::new(0x8F, note, 0);
        env.debug(&format!("error note for {original:?} (diff {diff_ms}ms): {on:?}"));

        let mut out = self.output.lock().unwrap();
        let _ = out.send(&on.to_bytes());
        let _ = out.send(&off.to_bytes());
    }
}

fn signed_diff_ns(a: Instant, b: Instant) -> i64 {
    if a >= b {
        (a - b).as_nanos() as i64
    } else {
        -((b - a).as_nanos() as i64)
    }
}

/// Shifts `now` by a signed nanosecond offset: positive moves it earlier
/// (matching the click's own delay), negative moves it later, since
/// `Instant` arithmetic only accepts non-negative `Duration`s.
fn shift_instant(now: Instant, shift_ns: i64) -> Instant {
    if shift_ns >= 0 {
        now - Duration::from_nanos(shift_ns as u64)
    } else {
        now + Duration::from_nanos((-shift_ns) as u64)
    }
}

impl Plugin for TimingPlugin {
    fn process(&mut self, env: &PluginEnv, msg: MidiMessage) -> Result<Vec<MidiMessage>, PluginError> {
        if is_note_on(&msg) {
            let note = msg.data1;
            if self.control.contains(&note) {
                self.enabled = !self.enabled;
                env.debug(&format!("toggle enabled status: new status {}", self.enabled));
            } else if self.enabled && !self.shared.buffer.lock().unwrap().is_empty() {
                let (ok, diff_ms) = self.check_time(Instant::now(), env);
                if !ok {
                    self.send_error(env, msg, diff_ms);
                    if self.drop_on_error {
                        return Ok(vec![]);
                    }
                }
            }
        }
        Ok(vec![msg])
    }
}

pub fn build(config: &Value) -> Result<Box<dyn Plugin>, XtalkError> {
    let cfg: Config = serde_json::from_value(config.clone())
        .map_err(|e| XtalkError::Config(format!("timing plugin config: {e}")))?;

    let output = transport::open_output(&cfg.client, None)?;
    let output = Arc::new(Mutex::new(output));

    let shared = Arc::new(Shared {
        buffer: Mutex::new(Vec::new()),
        index: Mutex::new(-1),
    });
    let scheduler = Scheduler::new();

    let play_interval = cfg.play_interval;
    let delay_ms = cfg.delay.max(0) as u64;
    let shared_for_input = Arc::clone(&shared);
    let output_for_input = Arc::clone(&output);
    let click_client_name = format!("{}-click", cfg.client);

    // Arc'd so the input callback (and its scheduled jobs) can outlive this
    // function while the plugin itself keeps the other handle.
    let scheduler_for_input = Arc::new(scheduler);
    let scheduler_clone = Arc::clone(&scheduler_for_input);

    let input = transport::open_input(&click_client_name, None, move |_stamp, bytes, _| {
        let Some(msg) = MidiMessage::from_bytes(bytes) else {
            return;
        };
        let is_on = is_note_on(&msg);
        let now = Instant::now();

        if is_on {
            shared_for_input.buffer.lock().unwrap().push(BufferEntry { at: now, msg });
        }

        if play_interval > 0 {
            let shared_play = Arc::clone(&shared_for_input);
            let output_play = Arc::clone(&output_for_input);
            let msg_bytes = msg.to_bytes();
            scheduler_clone.schedule_after(Duration::from_millis(delay_ms), move || {
                let should_send = if is_on {
                    let mut idx = shared_play.index.lock().unwrap();
                    *idx = (*idx + 1) % play_interval.max(1);
                    *idx == 0
                } else {
                    true
                };
                if should_send {
                    let mut out = output_play.lock().unwrap();
                    let _ = out.send(&msg_bytes);
                }
            });
        }

        if is_on {
            let shared_evict = Arc::clone(&shared_for_input);
            scheduler_clone.schedule_after(Duration::from_millis(delay_ms * 2), move || {
                let mut buffer = shared_evict.buffer.lock().unwrap();
                if !buffer.is_empty() {
                    buffer.remove(0);
                }
            });
        }
    })?;

    Ok(Box::new(TimingPlugin {
        control: cfg.control,
        delay_ms: cfg.delay,
        play_interval: cfg.play_interval,
        accept_range: cfg.accept_range,
        max_diff_ms: cfg.max_diff,
        error_early: cfg.error_early,
        error_late: cfg.error_late,
        error_velocity: cfg.error_velocity,
        drop_on_error: cfg.drop,
        calibration_ms: cfg.calibration,
        auto_calibration: cfg.auto_calibration,
        pipeline_delay_ms: cfg.pipeline_delay_ms,
        enabled: true,
        calib_ns: Mutex::new(0),
        calib_update_cnt: Mutex::new(0),
        shared,
        scheduler: scheduler_for_input,
        output,
        input: Some(input),
    }))
}
