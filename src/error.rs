// src/error.rs
//! Error handling for the engine core.
//!
//! - One enum for every failure the asset and GPU layers can report; cheap to match, allocates only on error paths.
//! - Context chaining records the call site (`file:line`) so a log line points at the code that gave up.
//! - `anyhow` is reserved for the binary; the library always returns [`Result`].

use std::fmt;
use std::panic::Location;
use thiserror::Error;

use crate::vertex_layout::LayoutError;

/// Which registry table an id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    VertexShader,
    PixelShader,
    Mesh,
    Texture,
    Material,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::VertexShader => "vertex shader",
            ResourceKind::PixelShader => "pixel shader",
            ResourceKind::Mesh => "mesh",
            ResourceKind::Texture => "texture",
            ResourceKind::Material => "material",
        })
    }
}

/// Main error type. Send + Sync + 'static.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// File system failures while reading assets or config.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config (de)serialization.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// PNG/JPEG decode failures.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Malformed or unsupported DDS container.
    #[error("DDS error: {0}")]
    Dds(String),

    /// OBJ parse failures.
    #[error("mesh import error: {0}")]
    MeshImport(String),

    /// Shader front-end or reflection failures.
    #[error("shader `{name}`: {message}")]
    Shader { name: String, message: String },

    /// Input signature could not be turned into a vertex layout.
    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// Insertion under an id that is already occupied. The first entry is untouched.
    #[error("{kind} {id:#010x} already registered")]
    Duplicate { kind: ResourceKind, id: u32 },

    /// Lookup of an id that was never registered.
    #[error("{kind} {id:#010x} not found")]
    NotFound { kind: ResourceKind, id: u32 },

    /// Constant buffer bound outside the slot table.
    #[error("constant buffer slot {slot} out of range (max {max})")]
    SlotOutOfRange { slot: u32, max: u32 },

    /// Device creation or resource allocation failed.
    #[error("GPU error: {0}")]
    Gpu(String),

    /// The device was lost; resources must be recreated.
    #[error("GPU device lost")]
    DeviceLost,

    /// Simple custom message.
    #[error("{0}")]
    Custom(String),

    /// Context chaining with the call site that added it.
    #[error("{message} ({file}:{line}): {source}")]
    WithContext {
        message: String,
        file: &'static str,
        line: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    /// Formatted custom error (like `format!` but returns `Error`).
    #[inline]
    pub fn format(args: fmt::Arguments) -> Self {
        Self::Custom(fmt::format(args))
    }

    #[inline]
    pub fn msg(msg: &'static str) -> Self {
        Self::Custom(msg.into())
    }

    #[inline]
    pub fn shader(name: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Shader {
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// Wrap with context, recording the caller's location.
    #[inline]
    #[track_caller]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        self.context_at(context, Location::caller())
    }

    pub(crate) fn context_at<C: Into<String>>(self, context: C, at: &'static Location<'static>) -> Self {
        Self::WithContext {
            message: context.into(),
            file: at.file(),
            line: at.line(),
            source: Box::new(self),
        }
    }

    /// Innermost error of a context chain.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self.root(), Error::Io(_))
    }

    #[inline]
    pub fn is_duplicate(&self) -> bool {
        matches!(self.root(), Error::Duplicate { .. })
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound { .. })
    }

    #[inline]
    pub fn is_device_lost(&self) -> bool {
        matches!(self.root(), Error::DeviceLost)
    }
}

impl From<ddsfile::Error> for Error {
    fn from(err: ddsfile::Error) -> Self {
        Error::Dds(err.to_string())
    }
}

impl From<tobj::LoadError> for Error {
    fn from(err: tobj::LoadError) -> Self {
        Error::MeshImport(err.to_string())
    }
}

/// Convenient `Result` alias, use `crate::Result<T>` everywhere.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn test_context_records_call_site() {
        let err: Result<()> = Err(Error::msg("boom"));
        let err = err.context("loading Cube.obj").unwrap_err();
        match &err {
            Error::WithContext { message, file, line, .. } => {
                assert_eq!(message, "loading Cube.obj");
                assert!(file.ends_with("error.rs"));
                assert!(*line > 0);
            }
            other => panic!("expected context, got {other:?}"),
        }
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_kind_checks_see_through_context() {
        let err = Error::Duplicate { kind: ResourceKind::Mesh, id: 7 }.context("outer").context("outermost");
        assert!(err.is_duplicate());
        assert!(!err.is_io());
        assert_eq!(err.root().to_string(), "mesh 0x00000007 already registered");
    }
}
