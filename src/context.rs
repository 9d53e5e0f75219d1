// src/context.rs
//! Context extension traits + macros for error handling.
//!
//! anyhow-like API over the crate's own [`Error`]: `.context()` / `.with_context()`
//! on any `Result` or `Option`, plus `bail!` / `ensure!`. Zero overhead on the `Ok` path.

use std::panic::Location;

use crate::error::{Error, Result};

/// `.context()` / `.with_context()` on any `Result` whose error converts into [`Error`].
pub trait Context<T, E> {
    /// Add static or owned context (eager, use only when cheap).
    #[track_caller]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    /// Add context lazily; the closure only runs on the error path.
    #[track_caller]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    #[inline]
    #[track_caller]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        let at = Location::caller();
        match self {
            Ok(value) => Ok(value),
            Err(err) => Err(err.into().context_at(context, at)),
        }
    }

    #[inline]
    #[track_caller]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        let at = Location::caller();
        match self {
            Ok(value) => Ok(value),
            Err(err) => Err(err.into().context_at(f(), at)),
        }
    }
}

/// `Option<T>` → `Result<T, Error>` with a message.
pub trait OptionContext<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> OptionContext<T> for Option<T> {
    #[inline]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.ok_or_else(|| Error::custom(context))
    }

    #[inline]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.ok_or_else(|| Error::custom(f()))
    }
}

// ====================== CONVENIENCE MACROS ======================

/// Early return with an error: `bail!("msg")`, `bail!(err)` or formatted.
#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::error::Error::format(format_args!($msg)))
    };
    ($err:expr $(,)?) => {
        return Err(Into::<$crate::error::Error>::into($err))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::error::Error::format(format_args!($fmt, $($arg)*)))
    };
}

/// Ensure a condition is true, else `bail!`.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $msg:literal $(,)?) => {
        if !($cond) {
            $crate::bail!($msg);
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::bail!($fmt, $($arg)*);
        }
    };
}
