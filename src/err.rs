//! Common error interfaces and pipeline diagnostics.
//!
//! This module consists of:
//! - [`Error`]: The trait implemented by every error type in this crate,
//!   which extends [`std::error::Error`] with an optional help message.
//! - [`Diagnostic`]: A single positioned message produced by a pipeline stage.
//! - [`Stage`]: The pipeline stage a diagnostic originated from.

use std::borrow::Cow;

/// Unified error interface for all errors in this crate.
///
/// Beyond the standard [`std::error::Error`] requirements, this trait
/// allows errors to carry a help message suggesting how to fix them.
pub trait Error: std::error::Error {
    /// A hint on how to resolve this error (if there is an obvious one).
    fn help(&self) -> Option<Cow<str>> {
        None
    }
}

/// How severe a [`Diagnostic`] is.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Something looks off, but the stage's output is still usable.
    Warning,
    /// The stage's output cannot be trusted past this point.
    Error,
}
impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Error   => f.write_str("error"),
        }
    }
}

/// The pipeline stage a [`Diagnostic`] was produced by.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Stage {
    /// Source text to tokens.
    Lex,
    /// Tokens to AST.
    Parse,
    /// AST to assembly text.
    CodeGen,
    /// Assembly text to a runnable program.
    Assembly,
}
impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Lex      => f.write_str("Lexical Analysis"),
            Stage::Parse    => f.write_str("Parsing"),
            Stage::CodeGen  => f.write_str("Code Generation"),
            Stage::Assembly => f.write_str("Assembly"),
        }
    }
}

/// A single positioned message from a pipeline stage.
///
/// Diagnostics are collected into ordered lists per stage; every stage runs
/// to its defined stopping point and returns its diagnostics as values.
/// Nothing in the core raises a control-flow exception to the caller.
#[derive(Debug, PartialEq, Eq, Clone, serde::Serialize)]
pub struct Diagnostic {
    /// 1-based source line the message refers to.
    pub line: usize,
    /// The message itself.
    pub message: String,
    /// Whether this kills the stage's output.
    pub severity: Severity,
}
impl Diagnostic {
    /// Creates an error diagnostic.
    pub fn error(line: usize, message: impl Into<String>) -> Self {
        Diagnostic { line, message: message.into(), severity: Severity::Error }
    }
    /// Creates a warning diagnostic.
    pub fn warning(line: usize, message: impl Into<String>) -> Self {
        Diagnostic { line, message: message.into(), severity: Severity::Warning }
    }

    /// Whether this diagnostic has [`Severity::Error`].
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}
impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}: {}", self.line, self.severity, self.message)
    }
}

/// Checks whether any diagnostic in the list is an error.
pub fn any_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}
