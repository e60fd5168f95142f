//! Binding errors
//!
//! Failures inside the engine are recorded in the context's pending
//! exception slot; [`Exception`] is the native-side marker for "an exception
//! is pending there" and remembers where it was raised.

use std::fmt;
use std::io;
use std::panic::Location;

use thiserror::Error;

use crate::engine::EngineCtx;
use crate::value::Value;

/// Result alias for binding operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error from a binding operation
#[derive(Debug, Error)]
pub enum Error {
    /// An exception is pending in the engine context
    #[error(transparent)]
    Exception(#[from] Exception),
    /// Native failure; surfaced to scripts as an InternalError
    #[error("{0}")]
    Runtime(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Binding exception for the exception pending in `ctx`
    #[track_caller]
    pub fn exception(ctx: &EngineCtx) -> Error {
        Error::Exception(Exception::new(ctx))
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        matches!(self, Error::Exception(_))
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Runtime(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Runtime(msg.to_string())
    }
}

/// Exception pending in an engine context
///
/// Carries no payload: the error value stays in the engine until
/// [`Exception::value`] takes it.
#[derive(Clone)]
pub struct Exception {
    ctx: EngineCtx,
    location: &'static Location<'static>,
}

impl Exception {
    #[track_caller]
    pub fn new(ctx: &EngineCtx) -> Self {
        Exception {
            ctx: ctx.clone(),
            location: Location::caller(),
        }
    }

    /// The engine context holding the exception
    #[inline]
    pub fn engine(&self) -> &EngineCtx {
        &self.ctx
    }

    /// Take the pending exception (`null` when none is pending)
    pub fn value(&self) -> Value {
        Value::from_raw(&self.ctx, self.ctx.get_exception())
    }

    /// Where the exception was raised on the native side
    #[inline]
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exception")
            .field("location", &format_args!("{}", self.location))
            .finish()
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JavaScript exception raised at {}", self.location)
    }
}

impl std::error::Error for Exception {}
