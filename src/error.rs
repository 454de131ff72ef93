//! Error taxonomy for the bucket engine.
//!
//! Every fallible operation in this crate returns [Result], which is
//! [std::result::Result] pinned to [Error]. Variants correspond to the
//! error kinds enumerated in the design: I/O, malformed on-disk records,
//! invalid use of a closed handle, bad arguments, wrong transaction mode,
//! spatial operations on a non-spatial bucket, and configuration failures.

use std::io;

/// Crate-wide result alias, mirroring the `core::Result` alias pattern.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0}: {1}")]
    Io(String, #[source] io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid transaction mode: {0}")]
    InvalidTxMode(String),

    #[error("spatial operation unsupported: {0}")]
    SpatialUnsupported(String),

    #[error("configuration option error: {0}")]
    Option(String),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, err: io::Error) -> Error {
        Error::Io(context.into(), err)
    }
}
