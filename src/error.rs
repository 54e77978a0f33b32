//! Errors that decide whether a plugin may run.
//!
//! Anything surfaced here at construction time moves the plugin to
//! [`PluginState::Disabled`](crate::plugin::PluginState) for the rest of the
//! process lifetime. Runtime failures from the query or sink layers are plain
//! `anyhow` errors and go back to the scheduler instead.

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Code asked for an option that has no default and no override.
    #[error("option '{option}' of plugin {plugin} has no value")]
    MissingOption { plugin: String, option: String },

    /// The option value cannot be coerced into the type the plugin expects.
    #[error("option '{option}' of plugin {plugin} has invalid value '{value}': {reason}")]
    InvalidOption {
        plugin: String,
        option: String,
        value: String,
        reason: String,
    },

    /// The threshold string has no leading integer part.
    #[error("invalid memory threshold '{0}', expected <integer><MB|GB|TB>, for example 1GB")]
    InvalidThreshold(String),

    /// The plugin only works on a different operating system.
    #[error("plugin {plugin} works only on {required}")]
    UnsupportedPlatform { plugin: String, required: String },

    /// A required system file could not be read or understood.
    #[error("cannot read {path}: {reason}")]
    HostProbe { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, PluginError>;
