//! The timed message pipeline: ingress, dispatch, and the shared context
//! that ties them to the policy engine and plugin chain.

pub mod context;
pub mod dispatcher;
pub mod ingress;

use crate::cli::DisableKind;
use crate::message::{is_aftertouch, is_note_off, MidiMessage};

/// Whether `msg` counts as a "disable" event under the configured `--dtypes`.
pub(crate) fn is_disable_event(msg: &MidiMessage, kind: DisableKind) -> bool {
    match kind {
        DisableKind::None => false,
        DisableKind::NoteOff => is_note_off(msg),
        DisableKind::Aftertouch => is_aftertouch(msg),
        DisableKind::Any => is_note_off(msg) || is_aftertouch(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtypes_none_never_counts_as_disable() {
        let msg = MidiMessage::new(0xA0, 38, 64);
        assert!(!is_disable_event(&msg, DisableKind::None));
    }

    #[test]
    fn dtypes_any_counts_note_off_and_aftertouch() {
        let note_off = MidiMessage::new(0x80, 38, 0);
        let aftertouch = MidiMessage::new(0xA0, 38, 64);
        assert!(is_disable_event(&note_off, DisableKind::Any));
        assert!(is_disable_event(&aftertouch, DisableKind::Any));
    }

    #[test]
    fn dtypes_aftertouch_excludes_note_off() {
        let note_off = MidiMessage::new(0x80, 38, 0);
        assert!(!is_disable_event(&note_off, DisableKind::Aftertouch));
    }
}
