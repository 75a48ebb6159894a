//! Typed error hierarchy for configuration loading, plugin loading, and the
//! plugin chain's per-message failure handling (§7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum XtalkError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to load policy file {path}: {source}")]
    PolicyLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed policy JSON in {path}: {source}")]
    PolicyJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown plugin '{0}' in --plugins")]
    UnknownPlugin(String),

    #[error("failed to load plugin config {path}: {source}")]
    PluginConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed plugin config JSON in {path}: {source}")]
    PluginConfigJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("MIDI transport error: {0}")]
    Transport(String),
}

/// Error returned by a plugin's `process`. `Abort` propagates out of the
/// dispatcher loop and terminates the pipeline; any other variant is logged
/// and treated as if the plugin emitted no messages for the current input.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin requested pipeline shutdown: {0}")]
    Abort(String),

    #[error("plugin processing failed: {0}")]
    Failed(#[from] anyhow::Error),
}
