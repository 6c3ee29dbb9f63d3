//! Type-erased errors for crate boundaries.
//!
//! Libraries in this workspace define typed errors (via `snafu`) for the failures callers are expected to match on.
//! When several of those need to be merged into one fallible signature, such as when loading a component from
//! configuration, [`GenericError`] is used instead.
#![deny(missing_docs)]

use std::fmt::Display;

/// A type-erased error.
pub type GenericError = anyhow::Error;

/// Constructs a [`GenericError`].
///
/// Accepts a string literal, a format string with arguments (as with `std::format!`), or an existing value that
/// implements `Debug` and `Display`. When given an existing `std::error::Error`, its source chain is preserved.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::__anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::__anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::__anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as __anyhow;

mod sealed {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

/// Extension methods for attaching context to a fallible result.
///
/// This mirrors `anyhow::Context` under a different name so that it can be imported alongside `snafu::ResultExt`
/// without the method names colliding.
pub trait ErrorContext<T, E>: sealed::Sealed {
    /// Wraps the error, if any, with the given context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error, if any, with context that is only built when an error actually occurred.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        anyhow::Context::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        anyhow::Context::with_context(self, f)
    }
}
