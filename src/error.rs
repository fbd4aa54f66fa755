//! Errors returned by the map and by pair redistributors.
use std::any::Any;
use std::error;
use std::fmt::{self, Display, Formatter};

/// The kind of an [`Error`], for callers that branch on what went wrong rather than on the
/// message text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller supplied an invalid argument.
    IllegalParameter,
    /// A pair from one map was about to be linked into a chain of another.
    IllegalPairType,
    /// The pair redistributor of a segment failed.
    PairRedistributor,
}

/// Errors returned by this library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// An argument was out of range, e.g. a shard count of zero.
    IllegalParameter(String),
    /// An attempt to link pairs or bucket tables that do not belong together.
    ///
    /// This points at a programming error in a custom [`PairRedistributor`], never at the
    /// data stored in the map.
    ///
    /// [`PairRedistributor`]: crate::PairRedistributor
    IllegalPairType(String),
    /// Redistributing the pairs of a segment failed after a `put` or `delete`.
    ///
    /// The mutation itself went through: `applied` is the value the operation would have
    /// returned had the redistributor succeeded.
    PairRedistributor {
        /// Whether the triggering `put` inserted a new key, or `delete` removed one.
        applied: bool,
        /// What the redistributor reported.
        source: PairRedistributorError,
    },
}

impl Error {
    pub(crate) fn illegal_parameter(msg: impl Into<String>) -> Self {
        Error::IllegalParameter(msg.into())
    }

    pub(crate) fn illegal_pair_type(msg: impl Into<String>) -> Self {
        Error::IllegalPairType(msg.into())
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IllegalParameter(_) => ErrorKind::IllegalParameter,
            Error::IllegalPairType(_) => ErrorKind::IllegalPairType,
            Error::PairRedistributor { .. } => ErrorKind::PairRedistributor,
        }
    }

    /// For a redistribution failure, the result of the mutation that triggered it.
    pub fn applied(&self) -> Option<bool> {
        match *self {
            Error::PairRedistributor { applied, .. } => Some(applied),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::IllegalParameter(msg) => {
                write!(f, "concurrent map: illegal parameter: {}", msg)
            }
            Error::IllegalPairType(msg) => {
                write!(f, "concurrent map: illegal pair type: {}", msg)
            }
            Error::PairRedistributor { source, .. } => Display::fmt(source, f),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::PairRedistributor { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// The error type reported by a [`PairRedistributor`].
///
/// Panics inside a redistributor are caught by the segment and reported as this error too.
///
/// [`PairRedistributor`]: crate::PairRedistributor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairRedistributorError {
    message: String,
}

impl PairRedistributorError {
    /// Creates an error with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The description given when the error was created.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(msg) = payload.downcast_ref::<&str>() {
            (*msg).to_owned()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            String::from("redistributor panicked")
        };
        Self::new(message)
    }
}

impl From<Error> for PairRedistributorError {
    fn from(e: Error) -> Self {
        match e {
            Error::PairRedistributor { source, .. } => source,
            other => Self::new(other.to_string()),
        }
    }
}

impl Display for PairRedistributorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "concurrent map: failing pair redistribution: {}",
            self.message
        )
    }
}

impl error::Error for PairRedistributorError {}
