//! Error types for Mach-O analysis and validation.
//!
//! Every structural problem the analyzer can detect maps onto one variant of
//! [`Error`]. The variants follow the kinds of damage a Mach-O file can carry:
//! a buffer that is not Mach-O at all, a broken load command area, bad
//! segments or sections, an inconsistent LINKEDIT, or a fixup stream that
//! violates its grammar.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::util::LebError;

/// The main error type for Mach-O analysis.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Header Errors ====================
    #[error("{0}")]
    MalformedMagic(String),

    #[error("{0}")]
    MalformedArch(String),

    #[error("{0}")]
    MalformedFiletype(String),

    #[error("{0}")]
    MalformedFat(String),

    #[error("{0}")]
    MalformedPlatform(String),

    // ==================== Structure Errors ====================
    #[error("{0}")]
    MalformedLoadCommands(String),

    #[error("{0}")]
    MalformedSegment(String),

    #[error("{0}")]
    MalformedSection(String),

    #[error("{0}")]
    MalformedEntryPoint(String),

    // ==================== LINKEDIT Errors ====================
    #[error("{0}")]
    MalformedLinkEdit(String),

    #[error("{0}")]
    MalformedFixup(String),

    #[error("{0}")]
    MalformedExportTrie(String),

    #[error("{0}")]
    MalformedMetadata(String),

    // ==================== Resource Errors ====================
    #[error("unable to allocate {needed:#x} bytes: {reason}")]
    ResourceExhaustion { needed: u64, reason: String },

    // ==================== Parse Errors ====================
    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// A specialized Result type for Mach-O analysis.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorKind {
    Io,
    MalformedMagic,
    MalformedArch,
    MalformedFiletype,
    MalformedFat,
    MalformedPlatform,
    MalformedLoadCommands,
    MalformedSegment,
    MalformedSection,
    MalformedEntryPoint,
    MalformedLinkEdit,
    MalformedFixup,
    MalformedExportTrie,
    MalformedMetadata,
    ResourceExhaustion,
    Parse,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Error {
    /// Returns the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::FileOpen { .. } | Error::MemoryMap { .. } => ErrorKind::Io,
            Error::MalformedMagic(_) => ErrorKind::MalformedMagic,
            Error::MalformedArch(_) => ErrorKind::MalformedArch,
            Error::MalformedFiletype(_) => ErrorKind::MalformedFiletype,
            Error::MalformedFat(_) => ErrorKind::MalformedFat,
            Error::MalformedPlatform(_) => ErrorKind::MalformedPlatform,
            Error::MalformedLoadCommands(_) => ErrorKind::MalformedLoadCommands,
            Error::MalformedSegment(_) => ErrorKind::MalformedSegment,
            Error::MalformedSection(_) => ErrorKind::MalformedSection,
            Error::MalformedEntryPoint(_) => ErrorKind::MalformedEntryPoint,
            Error::MalformedLinkEdit(_) => ErrorKind::MalformedLinkEdit,
            Error::MalformedFixup(_) => ErrorKind::MalformedFixup,
            Error::MalformedExportTrie(_) => ErrorKind::MalformedExportTrie,
            Error::MalformedMetadata(_) => ErrorKind::MalformedMetadata,
            Error::ResourceExhaustion { .. } => ErrorKind::ResourceExhaustion,
            Error::Parse { .. } | Error::BufferTooSmall { .. } => ErrorKind::Parse,
        }
    }

    /// Returns true if this error indicates a recoverable condition.
    ///
    /// A broken fixup stream or metadata section stops that one walk, but
    /// does not invalidate the LINKEDIT blobs that were checked on their own.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedFixup(_) | Error::MalformedExportTrie(_) | Error::MalformedMetadata(_)
        )
    }

    /// Prefixes the message of a malformed-image error with the file it was
    /// found in. Other errors are returned unchanged.
    pub fn in_file(self, path: &str) -> Self {
        let wrap = |msg: String| format!("in '{}' {}", path, msg);
        match self {
            Error::MalformedLoadCommands(m) => Error::MalformedLoadCommands(wrap(m)),
            Error::MalformedSegment(m) => Error::MalformedSegment(wrap(m)),
            Error::MalformedSection(m) => Error::MalformedSection(wrap(m)),
            Error::MalformedEntryPoint(m) => Error::MalformedEntryPoint(wrap(m)),
            Error::MalformedLinkEdit(m) => Error::MalformedLinkEdit(wrap(m)),
            Error::MalformedFixup(m) => Error::MalformedFixup(wrap(m)),
            Error::MalformedExportTrie(m) => Error::MalformedExportTrie(wrap(m)),
            Error::MalformedMetadata(m) => Error::MalformedMetadata(wrap(m)),
            other => other,
        }
    }

    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }

    /// Creates a resource exhaustion error.
    #[inline]
    pub fn resource_exhaustion(needed: u64, reason: impl Into<String>) -> Self {
        Error::ResourceExhaustion {
            needed,
            reason: reason.into(),
        }
    }
}

/// LEB128 failures only occur inside fixup opcode streams.
impl From<LebError> for Error {
    fn from(err: LebError) -> Self {
        Error::MalformedFixup(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = Error::MalformedSegment("in 'x' segment filesize exceeds vmsize".into());
        assert_eq!(err.kind(), ErrorKind::MalformedSegment);
        assert_eq!(err.to_string(), "in 'x' segment filesize exceeds vmsize");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::MalformedFixup("bad bind opcode 0xE0".into()).is_recoverable());
        assert!(!Error::buffer_too_small(32, 4).is_recoverable());
        assert_eq!(Error::parse(4, "x").kind(), ErrorKind::Parse);
    }

    #[test]
    fn test_in_file_prefix() {
        let err = Error::MalformedFixup("bad bind opcode 0xE0".into()).in_file("/tmp/a.dylib");
        assert_eq!(err.to_string(), "in '/tmp/a.dylib' bad bind opcode 0xE0");
        let err = Error::MalformedMagic("not mach-o".into()).in_file("/tmp/a.dylib");
        assert_eq!(err.to_string(), "not mach-o");
    }
}
