//! Library-wide error type.
//!
//! Every failed top-level operation surfaces exactly one `Hdf5Error`;
//! nested parse failures are chained through `source()`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Hdf5Error>;

#[derive(Debug, Error)]
pub enum Hdf5Error {
    #[error("cannot access {path:?}")]
    FileAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no HDF5 signature at offset 0, 512, 1024 or 2048")]
    InvalidSignature,

    #[error("unsupported {what} version {version}")]
    UnsupportedVersion { what: &'static str, version: u32 },

    #[error("{path}: no such object")]
    PathNotFound { path: String },

    #[error("{path}: not a group")]
    NotAGroup { path: String },

    #[error("{path}: not a dataset")]
    NotADataset { path: String },

    #[error("malformed {0}")]
    Malformed(String),

    #[error("read of {len} bytes at address {address:#x} runs past end of file")]
    ShortRead { address: u64, len: u64 },

    #[error("fletcher32 checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("filter {name} rejected its input: {detail}")]
    FilterError { name: &'static str, detail: String },

    #[error("unsupported filter id {0}")]
    UnsupportedFilter(u16),

    #[error("unsupported datatype: {0}")]
    UnsupportedDatatype(String),

    #[error("unsupported chunk index type {0}")]
    UnsupportedChunkIndex(u8),

    #[error("unsupported group encoding: {0}")]
    UnsupportedGroupEncoding(&'static str),

    #[error("unsupported external link to {file:?}")]
    UnsupportedExternalLink { file: String },

    #[error("unsupported write shape: {0}")]
    UnsupportedWriteShape(&'static str),

    #[error("link cycle detected at {path}")]
    LinkCycle { path: String },

    #[error("dataset needs {needed} bytes, over the {budget} byte budget")]
    ShapeOverflow { needed: u64, budget: u64 },

    #[error("chunk decoded to {actual} bytes, expected {expected}")]
    ChunkSizeMismatch { expected: u64, actual: u64 },

    /// Operation context added at the public API boundary.
    #[error("{operation} {path}")]
    Context {
        operation: &'static str,
        path: String,
        #[source]
        source: Box<Hdf5Error>,
    },
}

impl Hdf5Error {
    /// Wrap an error with the operation and object path it occurred under.
    pub(crate) fn in_context(self, operation: &'static str, path: &str) -> Hdf5Error {
        match self {
            // Do not stack a second layer if an inner call already added one.
            e @ Hdf5Error::Context { .. } => e,
            e => Hdf5Error::Context {
                operation,
                path: path.to_owned(),
                source: Box::new(e),
            },
        }
    }
}

/// Convert a nom failure into `Malformed`, keeping the innermost
/// `context(...)` label so the message names the structure that failed.
impl<'a> From<nom::Err<nom::error::VerboseError<&'a [u8]>>> for Hdf5Error {
    fn from(e: nom::Err<nom::error::VerboseError<&'a [u8]>>) -> Self {
        use nom::error::VerboseErrorKind;
        match e {
            nom::Err::Incomplete(_) => Hdf5Error::Malformed("truncated structure".to_owned()),
            nom::Err::Error(v) | nom::Err::Failure(v) => {
                let label = v
                    .errors
                    .iter()
                    .rev()
                    .find_map(|(_, kind)| match kind {
                        VerboseErrorKind::Context(c) => Some(*c),
                        _ => None,
                    })
                    .unwrap_or("structure");
                Hdf5Error::Malformed(label.to_owned())
            }
        }
    }
}
