//! Bucketed sliding-window store of recently seen MIDI messages (C1).
//!
//! Two instances live in [`crate::pipeline::context::PipelineContext`]: one
//! tracking recent note-ons indexed by note number, one tracking recent
//! "disable" events (note-off/aftertouch) the same way. Neither instance
//! expires entries on its own; the ingress/dispatcher schedule a matching
//! [`MessageHistory::remove`] via the [`crate::scheduler::Scheduler`].

use std::sync::Mutex;

use crate::message::MidiMessage;

/// Which byte of the message selects the bucket.
#[derive(Debug, Clone, Copy)]
pub enum Index {
    Data1,
    Data2,
}

impl Index {
    fn key(self, msg: &MidiMessage) -> usize {
        match self {
            Index::Data1 => msg.data1 as usize,
            Index::Data2 => msg.data2 as usize,
        }
    }
}

pub struct MessageHistory {
    idx: Index,
    buckets: Mutex<Vec<Vec<MidiMessage>>>,
}

impl MessageHistory {
    pub fn new(idx: Index) -> Self {
        Self {
            idx,
            buckets: Mutex::new(vec![Vec::new(); 256]),
        }
    }

    pub fn add(&self, msg: MidiMessage) {
        let mut buckets = self.buckets.lock().unwrap();
        buckets[self.idx.key(&msg)].push(msg);
    }

    /// Removes the first occurrence equal to `msg`; a no-op if absent.
    pub fn remove(&self, msg: &MidiMessage) {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = &mut buckets[self.idx.key(msg)];
        if let Some(pos) = bucket.iter().position(|m| m == msg) {
            bucket.remove(pos);
        }
    }

    /// Removes and returns the most recently added message sharing `msg`'s
    /// bucket, or `None` if the bucket is empty.
    pub fn pop_similar(&self, msg: &MidiMessage) -> Option<MidiMessage> {
        let mut buckets = self.buckets.lock().unwrap();
        buckets[self.idx.key(msg)].pop()
    }

    pub fn has_similar(&self, msg: &MidiMessage) -> bool {
        let buckets = self.buckets.lock().unwrap();
        !buckets[self.idx.key(msg)].is_empty()
    }

    /// A snapshot of the bucket sharing `msg`'s index byte, including `msg`
    /// itself if it was already added.
    pub fn get_similar(&self, msg: &MidiMessage) -> Vec<MidiMessage> {
        let buckets = self.buckets.lock().unwrap();
        buckets[self.idx.key(msg)].clone()
    }

    /// A snapshot of the union of the buckets named by `values`. An empty
    /// `values` yields an empty vec.
    pub fn get_all(&self, values: &[u8]) -> Vec<MidiMessage> {
        let buckets = self.buckets.lock().unwrap();
        let mut out = Vec::new();
        for &v in values {
            out.extend(buckets[v as usize].iter().copied());
        }
        out
    }
}
