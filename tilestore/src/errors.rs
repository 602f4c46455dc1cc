use std::io;
use std::result;

use crate::geom::Region;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid dimension, tile, attribute or filter configuration when defining an array.
    #[error("schema error: {0}")]
    Schema(String),

    /// A read or write addressed cells outside of the array's domain.
    #[error("region {region:?} is outside of domain {domain:?}")]
    Range { region: Region, domain: Region },

    #[error("buffer has shape {actual:?}, region needs {expected:?}")]
    ShapeMismatch {
        expected: [usize; 2],
        actual: [usize; 2],
    },

    #[error("array stores {stored} cells, handle was opened for {requested}")]
    TypeMismatch {
        stored: &'static str,
        requested: &'static str,
    },

    /// Write through a read handle or vice versa.
    #[error("array {uri} is open for {mode}")]
    Mode { uri: String, mode: &'static str },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A stored object couldn't be decoded.
    #[error("bad format in {path}: {reason}")]
    Format { path: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// A task in a barrier panicked or was cancelled.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// Another task failed to load an object this task was waiting on.
    #[error("failed to load object")]
    Load,

    #[error(transparent)]
    IO(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskFailed(err.to_string())
    }
}

pub type Result<T> = result::Result<T, Error>;
