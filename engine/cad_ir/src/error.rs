//! Error taxonomy for the compile and commit paths.
//!
//! Lexer failures surface through the parser as a `ParseError`; type and
//! codegen failures are `CompileError`s; structural commit-time failures
//! are `RuntimeError`s. JIT-internal invariant violations (verifier
//! failures, missing intrinsics) are compiler bugs and panic instead of
//! propagating as data.

use thiserror::Error;

use crate::source::SourceRange;

/// A parse failure. Never accompanies a partially built AST.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
    pub range: SourceRange,
}

impl ParseError {
    pub fn new(message: impl Into<String>, range: SourceRange) -> Self {
        ParseError {
            message: message.into(),
            range,
        }
    }
}

/// A type-check or codegen failure for a single block.
///
/// Sibling and ancestor compiled units are unaffected; the previous good
/// block keeps running until a successful recompile replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
    pub range: SourceRange,
}

impl CompileError {
    pub fn new(message: impl Into<String>, range: SourceRange) -> Self {
        CompileError {
            message: message.into(),
            range,
        }
    }
}

/// A structural failure while validating or committing a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
        }
    }
}

/// Error returned from the `compile` entry point.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

impl Error {
    /// The source range the diagnostic points at.
    pub fn range(&self) -> SourceRange {
        match self {
            Error::Parse(e) => e.range,
            Error::Compile(e) => e.range,
        }
    }

    /// The diagnostic text.
    pub fn description(&self) -> &str {
        match self {
            Error::Parse(e) => &e.message,
            Error::Compile(e) => &e.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Pos, SourceRange};

    #[test]
    fn test_error_range_passthrough() {
        let range = SourceRange::new(Pos::new(2, 0), Pos::new(2, 5));
        let err: Error = ParseError::new("unexpected `)`", range).into();
        assert_eq!(err.range(), range);
        assert_eq!(err.description(), "unexpected `)`");
        assert_eq!(err.to_string(), "unexpected `)`");
    }

    #[test]
    fn test_compile_error_into_error() {
        let range = SourceRange::DUMMY;
        let err: Error = CompileError::new("unknown function `sine`", range).into();
        assert!(matches!(err, Error::Compile(_)));
    }
}
