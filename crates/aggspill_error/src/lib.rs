use std::borrow::Cow;
use std::error::Error;
use std::fmt;

pub type Result<T, E = DbError> = std::result::Result<T, E>;

/// Helper macro for returning an error for stuff we haven't implemented yet.
#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)+) => {{
        let msg = format!($($arg)+);
        return Err($crate::DbError::not_implemented(msg));
    }};
}

/// Broad classification of an error.
///
/// Callers branch on the kind, the message is for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Something went wrong that shouldn't have.
    Internal,
    /// Bad configuration or input data.
    InvalidInput,
    /// Feature not implemented.
    NotImplemented,
    /// Memory limit exceeded with no way to shed state.
    ResourceExhausted,
    /// Failed to persist aggregate state to a temporary file.
    SpillWriteFailed,
    /// Temporary file missing, truncated, or corrupt.
    SpillReadFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Internal => "internal",
            Self::InvalidInput => "invalid input",
            Self::NotImplemented => "not implemented",
            Self::ResourceExhausted => "resource exhausted",
            Self::SpillWriteFailed => "spill write failed",
            Self::SpillReadFailed => "spill read failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
pub struct DbError {
    inner: Box<DbErrorInner>,
}

#[derive(Debug)]
struct DbErrorInner {
    kind: ErrorKind,
    msg: Cow<'static, str>,
    fields: Vec<(Cow<'static, str>, String)>,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl DbError {
    pub fn new(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::with_kind(ErrorKind::Internal, msg)
    }

    pub fn with_kind(kind: ErrorKind, msg: impl Into<Cow<'static, str>>) -> Self {
        DbError {
            inner: Box::new(DbErrorInner {
                kind,
                msg: msg.into(),
                fields: Vec::new(),
                source: None,
            }),
        }
    }

    pub fn with_source(
        msg: impl Into<Cow<'static, str>>,
        source: Box<dyn Error + Send + Sync>,
    ) -> Self {
        let mut err = Self::new(msg);
        err.inner.source = Some(source);
        err
    }

    pub fn invalid_input(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::with_kind(ErrorKind::InvalidInput, msg)
    }

    pub fn not_implemented(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::with_kind(ErrorKind::NotImplemented, msg)
    }

    pub fn resource_exhausted(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::with_kind(ErrorKind::ResourceExhausted, msg)
    }

    pub fn spill_write(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::with_kind(ErrorKind::SpillWriteFailed, msg)
    }

    pub fn spill_read(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::with_kind(ErrorKind::SpillReadFailed, msg)
    }

    /// Attach a key/value pair to the error for additional context.
    pub fn with_field(
        mut self,
        key: impl Into<Cow<'static, str>>,
        value: impl fmt::Display,
    ) -> Self {
        self.inner.fields.push((key.into(), value.to_string()));
        self
    }

    /// Replace the kind of this error.
    ///
    /// Used when a lower layer produced a generic error that needs to be
    /// reclassified, e.g. an io error while writing a spill file.
    pub fn reclassify(mut self, kind: ErrorKind) -> Self {
        self.inner.kind = kind;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    pub fn get_msg(&self) -> &str {
        self.inner.msg.as_ref()
    }

    pub fn get_field(&self, key: &str) -> Option<&str> {
        self.inner
            .fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl From<std::io::Error> for DbError {
    fn from(value: std::io::Error) -> Self {
        DbError::with_source("IO error", Box::new(value))
    }
}

impl From<std::fmt::Error> for DbError {
    fn from(value: std::fmt::Error) -> Self {
        DbError::with_source("Format error", Box::new(value))
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.msg)?;

        for (key, value) in &self.inner.fields {
            write!(f, "\n    {key}: {value}")?;
        }

        if let Some(source) = &self.inner.source {
            write!(f, "\nError source: {source}")?;
        }

        Ok(())
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

/// Extension trait for wrapping foreign errors with a message.
pub trait ResultExt<T, E> {
    fn context(self, msg: &'static str) -> Result<T, DbError>;
    fn context_fn<F>(self, f: F) -> Result<T, DbError>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T, E> for std::result::Result<T, E>
where
    E: Error + Send + Sync + 'static,
{
    fn context(self, msg: &'static str) -> Result<T, DbError> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(DbError::with_source(msg, Box::new(e))),
        }
    }

    fn context_fn<F>(self, f: F) -> Result<T, DbError>
    where
        F: FnOnce() -> String,
    {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(DbError::with_source(f(), Box::new(e))),
        }
    }
}

pub trait OptionExt<T> {
    /// Return an error if the option is None.
    fn required(self, msg: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, msg: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(DbError::new(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_fields() {
        let err = DbError::spill_read("Segment checksum mismatch")
            .with_field("bucket", 4)
            .with_field("path", "/tmp/x");

        assert_eq!(ErrorKind::SpillReadFailed, err.kind());
        assert_eq!(Some("4"), err.get_field("bucket"));
        assert_eq!(
            "Segment checksum mismatch\n    bucket: 4\n    path: /tmp/x",
            err.to_string()
        );
    }

    #[test]
    fn context_keeps_source() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::other("disk gone"));
        let err = res.context("failed to write").unwrap_err();

        assert_eq!(ErrorKind::Internal, err.kind());
        assert!(err.source().is_some());
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn reclassify_io_error() {
        let err: DbError = std::io::Error::other("nope").into();
        let err = err.reclassify(ErrorKind::SpillWriteFailed);
        assert_eq!(ErrorKind::SpillWriteFailed, err.kind());
    }

    #[test]
    fn required_none() {
        let v: Option<u8> = None;
        assert!(v.required("missing").is_err());
    }

    #[test]
    fn not_implemented_macro() {
        fn unsupported(name: &str) -> Result<()> {
            not_implemented!("aggregate '{name}'")
        }
        let err = unsupported("median").unwrap_err();
        assert_eq!(ErrorKind::NotImplemented, err.kind());
        assert_eq!("aggregate 'median'", err.get_msg());
    }
}
