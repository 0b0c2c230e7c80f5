use thiserror::Error;

use crate::PixelFormat;

/// The error type for interactions with this library.
///
/// The first three variants describe caller mistakes; everything the driver
/// or the platform gets wrong collapses into [`Error::Platform`]. Engine
/// callbacks receive the same four-way split.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The operation is not valid in the engine's current state.
    #[error("operation invoked in an illegal engine state")]
    IllegalState,
    /// Caller-provided data is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// An input chunk does not fit the remaining input-buffer capacity.
    #[error("input chunk exceeds the input buffer plane capacity")]
    UnreadableInput,
    /// No device node supports the requested coded format.
    #[error("no device supports pixel format {0}")]
    NoDevice(PixelFormat),
    /// An unexpected driver or OS failure.
    #[error("platform failure: {0}")]
    Platform(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Platform(std::io::Error::from_raw_os_error(errno as i32))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
