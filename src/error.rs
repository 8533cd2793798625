//! Error handling for `transit_core`.
//!
//! A single `Error` type wrapping an `ErrorKind` discriminant and,
//! optionally, a boxed source error, plus extension traits to convert
//! arbitrary `std::result::Result`s at call sites with one method
//! call.

use std::error;
use std::fmt;
use std::result;

/// Wrapper result type used throughout this crate.
pub type Result<T> = result::Result<T, Error>;

/// Broad classification of the subsystem an error originated in.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    Router,
    Dispatcher,
    Connection,
    Handshake,
    Relay,
    Codec,
    Config,
}

/// Extension of `std::result::Result`, used to wrap its error variant
/// in a [`Error`].
pub trait ResultWrappedExt {
    type T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

/// Extension of `std::result::Result`, used when the underlying error
/// type should be dropped (e.g. it doesn't implement `Send`).
pub trait ResultSimpleExt {
    type T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<T> {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<T> {
        self.map_err(|_| Error::wrapped(kind, msg.to_owned()))
    }
}

enum ErrorInner {
    Simple(ErrorKind),
    Wrapped(ErrorKind, Box<dyn error::Error + Send + Sync>),
    Timeout(ErrorKind),
}

/// The error type used throughout this crate.
pub struct Error {
    inner: ErrorInner,
}

impl Error {
    /// An error carrying no further context besides its kind.
    pub fn simple(kind: ErrorKind) -> Self {
        Error {
            inner: ErrorInner::Simple(kind),
        }
    }

    /// Wraps an arbitrary error, tagging it with `kind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Error {
            inner: ErrorInner::Wrapped(kind, e.into()),
        }
    }

    /// A deadline elapsed before a terminal outcome was observed.
    pub fn timeout(kind: ErrorKind) -> Self {
        Error {
            inner: ErrorInner::Timeout(kind),
        }
    }

    /// Returns a copy of this error's `ErrorKind`.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Simple(k) => *k,
            ErrorInner::Wrapped(k, _) => *k,
            ErrorInner::Timeout(k) => *k,
        }
    }

    /// True if this error represents a deadline elapsing rather than
    /// a hard failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner, ErrorInner::Timeout(_))
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(f, "Error::Simple({:?})", k),
            ErrorInner::Wrapped(k, e) => write!(f, "Error::Wrapped({:?}, {})", k, e),
            ErrorInner::Timeout(k) => write!(f, "Error::Timeout({:?})", k),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(f, "{:?}", k),
            ErrorInner::Wrapped(k, e) => write!(f, "{:?}: {}", k, e),
            ErrorInner::Timeout(k) => write!(f, "{:?}: timed out", k),
        }
    }
}

impl error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::wrapped(ErrorKind::Router, e)
    }
}
