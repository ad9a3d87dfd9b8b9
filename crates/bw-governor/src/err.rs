//! Declare an error type for the bw-governor crate.

use std::io;

use thiserror::Error;
use tor_config::ConfigBuildError;
use tor_error::{Bug, ErrorKind, HasKind};

/// An error returned while acquiring bandwidth or changing a budget's limits.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// We were asked to use a configuration that doesn't make sense.
    ///
    /// The previous configuration is still in effect.
    #[error("Invalid bandwidth budget configuration")]
    InvalidConfig(#[from] ConfigBuildError),

    /// We were waiting for bandwidth, and somebody fired our
    /// [`Interrupt`](crate::Interrupt).
    ///
    /// The budget we were waiting on was not charged. When a request spans
    /// several budgets, the ones that granted it before the wait keep their
    /// charge.
    #[error("Bandwidth request was cancelled")]
    Cancelled,

    /// An internal error of some kind that should never occur, or a misuse of
    /// the API.
    #[error("Internal error")]
    Bug(#[from] Bug),
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        use ErrorKind as EK;
        match self {
            E::InvalidConfig(_) => EK::InvalidConfig,
            E::Cancelled => EK::Other,
            E::Bug(e) => e.kind(),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        // There is no io::ErrorKind for "cancelled". We don't use
        // `Interrupted`: callers retry on that, and an interrupt stays fired.
        io::Error::other(err)
    }
}
