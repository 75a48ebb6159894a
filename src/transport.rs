//! MIDI port enumeration and connection setup.
//!
//! Thin wrapper around `midir`: resolving a `--input`/`--output` argument
//! (a port index or a case-insensitive name substring) to a concrete port,
//! falling back to a virtual port when none is given, and listing ports for
//! `--list`.

use midir::{Ignore, MidiInput, MidiInputPort, MidiOutput, MidiOutputPort};

use crate::error::XtalkError;

/// Resolves a `--api` value. `midir` picks its backend at compile time via
/// Cargo features, so this only validates the name and is otherwise
/// informational; the default backend is whatever the build enabled.
pub fn validate_api(api: &str) -> Result<(), XtalkError> {
    match api {
        "jack" | "alsa" | "default" => Ok(()),
        other => Err(XtalkError::Config(format!(
            "unknown MIDI API '{}', expected jack|alsa|default",
            other
        ))),
    }
}

/// Prints every available input and output port for `client`, one per line,
/// as `--list` requires.
pub fn list_ports(client: &str) -> Result<(), XtalkError> {
    let input =
        MidiInput::new(client).map_err(|e| XtalkError::Transport(format!("midi input: {e}")))?;
    println!("Input ports:");
    for (i, port) in input.ports().iter().enumerate() {
        let name = input
            .port_name(port)
            .unwrap_or_else(|_| "<unknown>".to_string());
        println!("  {}: {}", i, name);
    }

    let output =
        MidiOutput::new(client).map_err(|e| XtalkError::Transport(format!("midi output: {e}")))?;
    println!("Output ports:");
    for (i, port) in output.ports().iter().enumerate() {
        let name = output
            .port_name(port)
            .unwrap_or_else(|_| "<unknown>".to_string());
        println!("  {}: {}", i, name);
    }

    Ok(())
}

/// Resolves `spec` (a port index like `"2"`, or a case-insensitive substring
/// of a port name) against `ports`. Returns `None` to mean "no match, create
/// a virtual port instead" when `spec` is `None`.
fn resolve_port<'a, C>(
    spec: Option<&str>,
    ports: &'a [MidiPortHandle<C>],
) -> Result<Option<&'a MidiPortHandle<C>>, XtalkError> {
    let Some(spec) = spec else {
        return Ok(None);
    };

    if let Ok(idx) = spec.parse::<usize>() {
        return ports
            .get(idx)
            .map(Some)
            .ok_or_else(|| XtalkError::Transport(format!("no port at index {idx}")));
    }

    let needle = spec.to_lowercase();
    let matched: Vec<_> = ports
        .iter()
        .filter(|p| p.name.to_lowercase().contains(&needle))
        .collect();

    match matched.len() {
        0 => Err(XtalkError::Transport(format!(
            "no port name matches '{spec}'"
        ))),
        1 => Ok(Some(matched[0])),
        _ => Err(XtalkError::Transport(format!(
            "port name '{spec}' is ambiguous ({} matches)",
            matched.len()
        ))),
    }
}

/// A named port paired with its `midir` handle, so substring matching can
/// run without re-querying the connection object.
struct MidiPortHandle<C> {
    name: String,
    port: C,
}

/// Opens the configured input connection, handing decoded 3-byte messages
/// (longer/shorter system messages are passed through raw and the dispatcher
/// ignores anything `MidiMessage::from_bytes` can't parse) to `callback`.
pub fn open_input<F>(
    client: &str,
    spec: Option<&str>,
    callback: F,
) -> Result<midir::MidiInputConnection<()>, XtalkError>
where
    F: FnMut(u64, &[u8], &mut ()) + Send + 'static,
{
    let mut input =
        MidiInput::new(client).map_err(|e| XtalkError::Transport(format!("midi input: {e}")))?;
    input.ignore(Ignore::None);

    let handles: Vec<MidiPortHandle<MidiInputPort>> = input
        .ports()
        .into_iter()
        .map(|port| {
            let name = input
                .port_name(&port)
                .unwrap_or_else(|_| "<unknown>".to_string());
            MidiPortHandle { name, port }
        })
        .collect();

    let chosen = resolve_port(spec, &handles)?;

    match chosen {
        Some(handle) => input
            .connect(&handle.port, "xtalk-in", callback, ())
            .map_err(|e| XtalkError::Transport(format!("connect input: {e}"))),
        None => input
            .create_virtual(&format!("{client}:input"), callback, ())
            .map_err(|e| XtalkError::Transport(format!("virtual input: {e}"))),
    }
}

/// Opens the configured output connection.
pub fn open_output(
    client: &str,
    spec: Option<&str>,
) -> Result<midir::MidiOutputConnection, XtalkError> {
    let output = MidiOutput::new(client)
        .map_err(|e| XtalkError::Transport(format!("midi output: {e}")))?;

    let handles: Vec<MidiPortHandle<MidiOutputPort>> = output
        .ports()
        .into_iter()
        .map(|port| {
            let name = output
                .port_name(&port)
                .unwrap_or_else(|_| "<unknown>".to_string());
            MidiPortHandle { name, port }
        })
        .collect();

    let chosen = resolve_port(spec, &handles)?;

    match chosen {
        Some(handle) => output
            .connect(&handle.port, "xtalk-out")
            .map_err(|e| XtalkError::Transport(format!("connect output: {e}"))),
        None => output
            .create_virtual(&format!("{client}:output"))
            .map_err(|e| XtalkError::Transport(format!("virtual output: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_api_accepts_known_names() {
        assert!(validate_api("jack").is_ok());
        assert!(validate_api("alsa").is_ok());
        assert!(validate_api("default").is_ok());
    }

    #[test]
    fn validate_api_rejects_unknown_name() {
        assert!(validate_api("coreaudio").is_err());
    }

    #[test]
    fn resolve_port_by_index() {
        let ports = vec![
            MidiPortHandle {
                name: "Alpha".into(),
                port: (),
            },
            MidiPortHandle {
                name: "Beta".into(),
                port: (),
            },
        ];
        // Exercised against () in place of a real midir port type to keep
        // this test free of hardware/daemon dependencies; resolve_port only
        // ever looks at `name`.
        let found = resolve_port(Some("1"), &ports).unwrap();
        assert_eq!(found.unwrap().name, "Beta");
    }

    #[test]
    fn resolve_port_by_unique_substring() {
        let ports = vec![
            MidiPortHandle {
                name: "Alpha Keyboard".into(),
                port: (),
            },
            MidiPortHandle {
                name: "Beta Pad".into(),
                port: (),
            },
        ];
        let found = resolve_port(Some("pad"), &ports).unwrap();
        assert_eq!(found.unwrap().name, "Beta Pad");
    }

    #[test]
    fn resolve_port_ambiguous_substring_errors() {
        let ports = vec![
            MidiPortHandle {
                name: "Alpha".into(),
                port: (),
            },
            MidiPortHandle {
                name: "Alphabet".into(),
                port: (),
            },
        ];
        assert!(resolve_port(Some("alpha"), &ports).is_err());
    }

    #[test]
    fn resolve_port_none_means_virtual() {
        let ports: Vec<MidiPortHandle<()>> = vec![];
        assert!(resolve_port(None, &ports).unwrap().is_none());
    }
}
