//! Error taxonomy for the preview service.
//!
//! Packaging errors surface before any mount attempt. Errors thrown by
//! sandboxed code never appear here: they travel as `RuntimeError` status
//! events over the bridge.

use crate::bridge::InstanceId;
use thiserror::Error;

/// Rejected before a document is produced. Recoverable by editing the source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackagingError {
    #[error("source is empty")]
    Empty,

    #[error("source is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("invalid entry point name `{0}`")]
    InvalidEntry(String),

    #[error("syntax error at {line}:{column}: {message}")]
    SyntaxInvalid {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("unsupported import `{specifier}` at line {line}; only the bundled runtime can be imported")]
    UnsupportedImport { specifier: String, line: usize },

    #[error("parser initialisation failed: {0}")]
    Parser(String),
}

/// Delivery failure on the bridge. Fatal to one instance only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The host dropped its receiver (instance superseded or unmounted).
    #[error("event channel closed")]
    Closed,

    /// The sandbox side went away without being unmounted.
    #[error("sandbox instance {0} disconnected")]
    Disconnected(InstanceId),

    #[error("no sandbox instance is mounted")]
    NotMounted,
}

/// Props handed to the entry component failed sanitization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropsError {
    #[error("prototype pollution attempt: `{0}` key is forbidden in props")]
    ForbiddenKey(String),

    #[error("props nesting too deep (max {0} levels)")]
    TooDeep(usize),

    #[error("props must be a JSON object")]
    NotAnObject,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failure reported by a session store or generation service.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("session {0} not found")]
    SessionNotFound(uuid::Uuid),

    #[error("generation failed: {0}")]
    Generation(String),
}

/// Everything the host-facing API can return.
#[derive(Debug, Error)]
pub enum PreviewError {
    #[error(transparent)]
    Packaging(#[from] PackagingError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Props(#[from] PropsError),

    #[error("failed to spawn sandbox thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PreviewError>;
