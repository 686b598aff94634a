//! Configuration and identity persistence for the transcode runner (C1).
//!
//! The runner has no CLI surface: everything it needs to boot comes from a
//! handful of environment variables (see [`EnvConfig`]) plus a small
//! `config.json` persisted next to the binary once the control plane has
//! assigned this machine an id and a long-lived token (see
//! [`identity::IdentityStore`]).

mod env;
mod identity;

pub use env::{EncoderHint, EnvConfig};
pub use identity::{IdentityStore, RunnerIdentity};

/// Errors raised while reading environment configuration or the persisted
/// identity file. These are always `CONFIG_ERROR` at the runner-error
/// boundary (see `runner_core::error::RunnerError`).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {var}")]
    MissingVar { var: &'static str },

    #[error("invalid value for environment variable {var}: {value}")]
    InvalidValue { var: &'static str, value: String },

    #[error("{message}: {source}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize identity: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
}
