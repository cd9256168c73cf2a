//! Error types for the replay pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for pipeline operations.
///
/// Workers do not die on these: resource-acquisition failures degrade
/// (the recorder refuses to start, the aggregator skips recovery), and
/// data-integrity failures surface as rejected opens or degraded reads.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// I/O failure on a log file.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Log header magic does not match `FILE_MAGIC`.
    #[error("bad log magic 0x{found:08x} in {path} (expected 0x{expected:08x})")]
    BadMagic {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    /// Log header version is not the current format version.
    #[error("unsupported log version {found} in {path} (expected {expected})")]
    BadVersion {
        path: PathBuf,
        found: u16,
        expected: u16,
    },

    /// Operation attempted on a channel that is not open for it.
    #[error("channel {name}: {reason}")]
    Channel { name: String, reason: String },

    /// Shared memory object could not be created or attached.
    #[error("shared memory {name}: {reason}")]
    SharedMemory { name: String, reason: String },

    /// Bad startup configuration (unknown mode, invalid value).
    #[error("configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ReplayError>;

impl ReplayError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
