use std::{borrow, error, fmt, result};

use chetl_config::shared::ValidationError;
use chetl_postgres::replication::protocol::DecodeError;

/// Type alias for convenience when using the Result type with our error.
pub type ChetlResult<T> = result::Result<T, ChetlError>;

/// Internal error representation with kind, description and optional source.
///
/// Boxed to keep the public error type one pointer wide on the success path.
struct ErrorInner {
    kind: ErrorKind,
    description: borrow::Cow<'static, str>,
    detail: Option<String>,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

/// Error classification for the replication pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A logical replication wire message could not be decoded.
    DecodeFailed,
    /// A line of the bulk-copy stream could not be decoded.
    CopyDecodeFailed,
    /// A relation message differs structurally from the previously seen
    /// descriptor for the same table.
    SchemaDrift,
    /// A message arrived that is not valid in the current engine state.
    InvalidState,
    /// The warehouse rejected an upload or statement.
    DestinationError,
    /// A checkpoint store read failed.
    StateStoreReadFailed,
    /// A checkpoint store write failed.
    StateStoreWriteFailed,
    /// A stored checkpoint value failed to parse.
    StateCorrupted,
    /// A temporary replication slot could not be created within the
    /// configured number of attempts.
    SlotCreationFailed,
    /// The source failed while streaming a table copy.
    SourceError,
    /// A worker task panicked.
    WorkerPanicked,
    /// Configuration parsing or validation failure.
    ConfigurationError,
    /// Error that doesn't fit other categories.
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::DecodeFailed => "decode failed",
            ErrorKind::CopyDecodeFailed => "copy decode failed",
            ErrorKind::SchemaDrift => "schema drift",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::DestinationError => "destination error",
            ErrorKind::StateStoreReadFailed => "state store read failed",
            ErrorKind::StateStoreWriteFailed => "state store write failed",
            ErrorKind::StateCorrupted => "state corrupted",
            ErrorKind::SlotCreationFailed => "slot creation failed",
            ErrorKind::SourceError => "source error",
            ErrorKind::WorkerPanicked => "worker panicked",
            ErrorKind::ConfigurationError => "configuration error",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A stable error type for the replication pipeline.
///
/// Carries a machine-readable [`ErrorKind`], a static description and an
/// optional dynamic detail, plus an optional source error for chaining.
pub struct ChetlError(Box<ErrorInner>);

impl ChetlError {
    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    /// Returns the detail message, when present.
    pub fn detail(&self) -> Option<&str> {
        self.0.detail.as_deref()
    }

    /// Attaches a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        self.0.source = Some(source.into());
        self
    }
}

impl fmt::Debug for ChetlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChetlError")
            .field("kind", &self.0.kind)
            .field("description", &self.0.description)
            .field("detail", &self.0.detail)
            .field("source", &self.0.source)
            .finish()
    }
}

impl fmt::Display for ChetlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.description)?;
        if let Some(detail) = &self.0.detail {
            write!(f, ": {detail}")?;
        }
        if let Some(source) = &self.0.source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl error::Error for ChetlError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn error::Error + 'static))
    }
}

impl From<(ErrorKind, &'static str)> for ChetlError {
    fn from((kind, description): (ErrorKind, &'static str)) -> Self {
        ChetlError(Box::new(ErrorInner {
            kind,
            description: borrow::Cow::Borrowed(description),
            detail: None,
            source: None,
        }))
    }
}

impl From<(ErrorKind, &'static str, String)> for ChetlError {
    fn from((kind, description, detail): (ErrorKind, &'static str, String)) -> Self {
        ChetlError(Box::new(ErrorInner {
            kind,
            description: borrow::Cow::Borrowed(description),
            detail: Some(detail),
            source: None,
        }))
    }
}

impl From<DecodeError> for ChetlError {
    fn from(error: DecodeError) -> Self {
        ChetlError::from((
            ErrorKind::DecodeFailed,
            "Failed to decode a logical replication message",
        ))
        .with_source(error)
    }
}

impl From<ValidationError> for ChetlError {
    fn from(error: ValidationError) -> Self {
        ChetlError::from((ErrorKind::ConfigurationError, "Invalid configuration")).with_source(error)
    }
}
