//! Error kinds for the parameter-sharing protocol.

use core::fmt;

/// Failures surfaced by the backend and frontend services.
///
/// Store failures are transient on the backend: they are logged and the
/// current publication stalls rather than tearing the service down. On the
/// frontend every kind here aborts `init`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The store is missing required configuration (`/backend` absent or
    /// non-integer). Fatal at frontend init.
    Config,
    /// A store read or write failed.
    Store,
    /// The grant facility could not map the requested references.
    MapFailed,
    /// The directory holds fewer grant slots than the caller expected.
    Truncated,
    /// The published directory list disagrees with the expected length.
    Desync,
    /// The requested model is not in the table.
    UnknownModel,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            Error::Config => "missing or malformed backend configuration",
            Error::Store => "store read or write failed",
            Error::MapFailed => "grant mapping failed",
            Error::Truncated => "grant directory truncated",
            Error::Desync => "published grant directory has unexpected length",
            Error::UnknownModel => "model not in table",
        };
        f.write_str(desc)
    }
}
