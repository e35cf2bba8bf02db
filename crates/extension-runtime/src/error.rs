//! Extension runtime error types

use std::path::PathBuf;

use chart_core::{InterpretError, ParseError};
use thiserror::Error;

use crate::config::ExtensionKind;

/// Configuration problems. Entry-level variants affect one extension only.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Malformed(#[from] serde_yaml::Error),

    #[error("duplicate module id '{0}'")]
    DuplicateModule(String),

    #[error("module '{module}' entry #{index} has an empty extension id")]
    EmptyExtensionId { module: String, index: usize },

    #[error("module '{module}' entry #{index} is invalid: {message}")]
    InvalidEntry {
        module: String,
        index: usize,
        message: String,
    },

    #[error("module '{module}' already had extension '{extension}'")]
    DuplicateExtension { module: String, extension: String },

    #[error("module '{module}' does not accept extension '{extension}' of type '{kind}'")]
    UnsupportedType {
        module: String,
        extension: String,
        kind: ExtensionKind,
    },

    #[error("extension '{extension}' cannot use chart '{chart}': {source}")]
    Chart {
        extension: String,
        chart: String,
        #[source]
        source: ParseError,
    },
}

/// Failure to add an extension to the dispatcher.
#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("extension '{0}' is already registered")]
    AlreadyExists(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

/// Failure to deliver an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no extension '{0}' is registered")]
    UnknownExtension(String),

    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("chart of extension '{0}' is no longer loaded")]
    ChartUnavailable(String),

    #[error("extension '{extension}': {source}")]
    Interpret {
        extension: String,
        #[source]
        source: InterpretError,
    },
}

/// Failure of a module's send capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("module '{0}' has no sink attached")]
    NoSink(String),

    #[error("outbound channel of module '{0}' is closed")]
    Closed(String),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
