//! Dispatcher (C4): wait, classify, gate against the cross-talk policy, run
//! the plugin chain, emit. Runs on its own dedicated thread.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::error::PluginError;
use crate::message::{is_note_mod, is_note_on, MidiMessage};
use crate::plugin::{run_chain, ChainEntry};

use super::{context::PipelineContext, ingress::IngressEvent, is_disable_event};

/// The same bypass sink `PluginEnv::send` uses, so the final emit and any
/// plugin's direct injection are serialized behind the one real
/// `Mutex<midir::MidiOutputConnection>` the closure wraps in production.
type OutputSink = Arc<Mutex<dyn FnMut(MidiMessage) + Send>>;

pub struct Dispatcher {
    ctx: Arc<PipelineContext>,
    chain: Vec<ChainEntry>,
    output: OutputSink,
    before_cache: Vec<MidiMessage>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<PipelineContext>, chain: Vec<ChainEntry>, output: OutputSink) -> Self {
        Self {
            ctx,
            chain,
            output,
            before_cache: Vec::new(),
        }
    }

    /// Consumes queued events until the channel closes or a plugin aborts.
    pub fn run(mut self, rx: Receiver<IngressEvent>) -> Result<(), PluginError> {
        for (msg, delta_ms) in rx.iter() {
            self.handle(msg, delta_ms)?;
        }
        Ok(())
    }

    fn handle(&mut self, msg: MidiMessage, delta_ms: i64) -> Result<(), PluginError> {
        let wait_ms = delta_ms.min(self.ctx.args.delay).max(0) as u64;
        if wait_ms > 0 {
            std::thread::sleep(Duration::from_millis(wait_ms));
        }

        let is_disable = is_disable_event(&msg, self.ctx.args.dtypes());
        let is_on = is_note_on(&msg);
        let history_ms = self.ctx.args.history.max(0) as u64;

        if is_disable {
            self.schedule_disabled_cleanup(msg, history_ms);
        } else if is_on {
            self.schedule_history_cleanup(msg, history_ms);
        }

        if is_disable {
            self.forward(msg)?;
        } else if is_on {
            let blocked = self
                .ctx
                .policy
                .blocks(&msg, &self.ctx.history, &self.ctx.disabled)
                .is_some();

            if blocked {
                self.before_cache.clear();
            } else {
                let cached = std::mem::take(&mut self.before_cache);
                for cached_msg in cached {
                    self.forward(cached_msg)?;
                }
                self.forward(msg)?;
            }
        } else if self.ctx.args.before && !is_note_mod(&msg) {
            self.before_cache.push(msg);
        } else {
            self.forward(msg)?;
        }

        Ok(())
    }

    fn schedule_disabled_cleanup(&self, msg: MidiMessage, history_ms: u64) {
        let ctx = Arc::clone(&self.ctx);
        self.ctx
            .scheduler
            .schedule_after(Duration::from_millis(history_ms), move || {
                ctx.disabled.remove(&msg);
            });
    }

    fn schedule_history_cleanup(&self, msg: MidiMessage, history_ms: u64) {
        let ctx = Arc::clone(&self.ctx);
        self.ctx
            .scheduler
            .schedule_after(Duration::from_millis(history_ms), move || {
                ctx.history.remove(&msg);
            });
    }

    fn forward(&mut self, msg: MidiMessage) -> Result<(), PluginError> {
        let out = run_chain(&mut self.chain, msg)?;
        let mut output = self.output.lock().unwrap();
        for m in out {
            output(m);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Args;
    use crate::plugin::PluginEnv;
    use clap::Parser;
    use std::sync::mpsc;

    struct Echo;
    impl crate::plugin::Plugin for Echo {
        fn process(&mut self, _env: &PluginEnv, msg: MidiMessage) -> Result<Vec<MidiMessage>, PluginError> {
            Ok(vec![msg])
        }
    }

    fn test_dispatcher(args: Args) -> (Dispatcher, mpsc::Receiver<MidiMessage>) {
        let ctx = Arc::new(PipelineContext::new(args).unwrap());
        let (capture_tx, capture_rx) = mpsc::channel();
        let output: OutputSink = Arc::new(Mutex::new(move |m: MidiMessage| {
            let _ = capture_tx.send(m);
        }));
        let env = PluginEnv::new("echo", Arc::clone(&output));
        let chain = vec![ChainEntry {
            name: "echo",
            plugin: Box::new(Echo),
            env,
        }];

        (Dispatcher::new(ctx, chain, output), capture_rx)
    }

    #[test]
    fn single_note_on_passes_through() {
        let args = Args::try_parse_from(["xtalk"]).unwrap();
        let (mut dispatcher, rx) = test_dispatcher(args);
        let msg = MidiMessage::new(0x90, 38, 100);
        dispatcher.handle(msg, 0).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), msg);
    }

    #[test]
    fn weak_echo_is_blocked_by_default_policy() {
        let args = Args::try_parse_from(["xtalk"]).unwrap();
        let (mut dispatcher, rx) = test_dispatcher(args);
        dispatcher.handle(MidiMessage::new(0x90, 38, 100), 0).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap().data1, 38);

        dispatcher.handle(MidiMessage::new(0x90, 40, 20), 0).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn before_flag_caches_non_note_messages_until_next_note_on() {
        let args = Args::try_parse_from(["xtalk", "--before"]).unwrap();
        let (mut dispatcher, rx) = test_dispatcher(args);
        let cc = MidiMessage::new(0xB0, 7, 100);
        dispatcher.handle(cc, 0).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(dispatcher.before_cache, vec![cc]);

        let note = MidiMessage::new(0x90, 38, 100);
        dispatcher.handle(note, 0).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), cc);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), note);
        assert!(dispatcher.before_cache.is_empty());
    }
}
