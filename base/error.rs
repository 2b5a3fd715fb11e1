// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Error type and macros, in the shape our other projects use: a
//! machine-inspectable [`ErrorKind`] plus human-oriented message and an
//! optional source chain. Constructed via the [`err!`](crate::err) and
//! [`bail!`](crate::bail) macros.

use std::error::Error as StdError;
use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors. See that link for
/// descriptions of each error.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        };
        f.write_str(s)
    }
}

struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

/// An error with a required [`ErrorKind`], optional message, and optional
/// source.
///
/// Boxed so that `Result<T, Error>` stays one word wide on the `Ok` path.
pub struct Error(Box<ErrorInner>);

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error(Box::new(ErrorInner {
            kind,
            msg: None,
            source: None,
        }))
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Walks the chain, formatting each layer; used by `Display`.
    fn write_chain(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0.msg.as_deref() {
            Some(m) => write!(f, "{}: {}", self.0.kind, m)?,
            None => write!(f, "{}", self.0.kind)?,
        }
        let mut source = self.0.source.as_deref().map(|s| s as &dyn StdError);
        while let Some(s) = source {
            write!(f, ": {s}")?;
            source = s.source();
        }
        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.write_chain(f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.write_chain(f)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

/// Builder used by the [`err!`](crate::err) macro; not typically named
/// directly.
pub struct ErrorBuilder(Box<ErrorInner>);

impl ErrorBuilder {
    pub fn new(kind: ErrorKind) -> Self {
        ErrorBuilder(Box::new(ErrorInner {
            kind,
            msg: None,
            source: None,
        }))
    }

    pub fn msg(mut self, msg: String) -> Self {
        self.0.msg = Some(msg);
        self
    }

    pub fn source<S: Into<Box<dyn StdError + Send + Sync>>>(mut self, source: S) -> Self {
        self.0.source = Some(source.into());
        self
    }

    pub fn build(self) -> Error {
        Error(self.0)
    }
}

/// Constructs an [`Error`] from an `ErrorKind` variant name and optional
/// `msg(...)` / `source(...)` clauses.
///
/// ```
/// use moonfire_base::err;
/// let e = err!(InvalidArgument, msg("bad pid {}", 0x1fff));
/// assert_eq!(e.kind(), moonfire_base::ErrorKind::InvalidArgument);
/// assert_eq!(e.to_string(), "Invalid argument: bad pid 8191");
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind).build()
    };
    ($kind:ident, msg($($msg:tt)*)) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind)
            .msg(format!($($msg)*))
            .build()
    };
    ($kind:ident, source($source:expr)) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind)
            .source($source)
            .build()
    };
    ($kind:ident, msg($($msg:tt)*), source($source:expr)) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind)
            .msg(format!($($msg)*))
            .source($source)
            .build()
    };
    ($kind:ident, source($source:expr), msg($($msg:tt)*)) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind)
            .source($source)
            .msg(format!($($msg)*))
            .build()
    };
}

/// Like [`err!`](crate::err) but returns from the enclosing function.
///
/// ```
/// use moonfire_base::bail;
/// fn f() -> Result<(), moonfire_base::Error> {
///     bail!(Unimplemented, msg("no such codec"));
/// }
/// assert_eq!(f().unwrap_err().kind(), moonfire_base::ErrorKind::Unimplemented);
/// ```
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::err!($($arg)*).into())
    };
}

/// Extension methods for `Result`.
pub trait ResultExt<T, E> {
    /// Annotates an error with the given kind, keeping it as the source.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| ErrorBuilder::new(k).source(e).build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let e = crate::err!(Unknown, msg("write failed"), source(io));
        assert_eq!(e.kind(), ErrorKind::Unknown);
        assert_eq!(e.to_string(), "Unknown: write failed: pipe closed");
    }

    #[test]
    fn err_kind_annotates() {
        use std::io::Read;
        let mut buf = [0u8; 1];
        let r = std::io::Cursor::new("")
            .read_exact(&mut buf[..])
            .err_kind(ErrorKind::OutOfRange);
        assert_eq!(r.unwrap_err().kind(), ErrorKind::OutOfRange);
    }
}
