//! Ingress (C3): the `midir` input callback. Runs on a transport-owned
//! thread; its only jobs are history bookkeeping and handing the message off
//! to the dispatcher without blocking.

use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::error::XtalkError;
use crate::message::{is_note_on, MidiMessage};
use crate::transport;

use super::{is_disable_event, context::PipelineContext};

/// One dispatcher-bound event: the message plus the inter-arrival delay (ms)
/// since the previous message, as reported by the transport's timestamp.
pub type IngressEvent = (MidiMessage, i64);

pub fn spawn(
    ctx: Arc<PipelineContext>,
    tx: Sender<IngressEvent>,
) -> Result<midir::MidiInputConnection<()>, XtalkError> {
    let client = ctx.args.client.clone();
    let input_spec = ctx.args.input.clone();
    let dtypes = ctx.args.dtypes();

    let mut last_stamp: Option<u64> = None;

    transport::open_input(&client, input_spec.as_deref(), move |stamp, bytes, _| {
        let Some(msg) = MidiMessage::from_bytes(bytes) else {
            return;
        };

        let delta_ms = match last_stamp {
            Some(prev) => (stamp.saturating_sub(prev) / 1000) as i64,
            None => 0,
        };
        last_stamp = Some(stamp);

        if is_note_on(&msg) {
            ctx.history.add(msg);
        } else if is_disable_event(&msg, dtypes) {
            ctx.disabled.add(msg);
        }

        let _ = tx.send((msg, delta_ms));
    })
}

