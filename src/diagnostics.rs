//! Diagnostic plumbing shared by every compilation stage (spec C7).
//!
//! Every stage that can fail partially (type checker, IR generator) reports
//! through [`Diagnostic`] and keeps going so a single pass over one file
//! surfaces as many problems as it can. Stages that cannot recover (codegen)
//! signal failure through their own error type instead; see [`CompileError`].

use std::fmt;

/// A byte-range source span, carried by AST nodes and propagated into IR and
/// emitted EVM instructions for debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SourceSpan {
    pub offset: u32,
    pub length: u32,
}

impl SourceSpan {
    pub fn new(offset: u32, length: u32) -> Self {
        SourceSpan { offset, length }
    }
}

/// Severity of a reported [`Diagnostic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// One diagnostic record, matching spec.md §6's wire format exactly.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loc: Option<SourceSpan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl Diagnostic {
    pub fn error(code: &'static str, message: impl Into<String>, loc: Option<SourceSpan>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code,
            message: message.into(),
            loc,
            expected: None,
            actual: None,
        }
    }

    pub fn warning(code: &'static str, message: impl Into<String>, loc: Option<SourceSpan>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            code,
            message: message.into(),
            loc,
            expected: None,
            actual: None,
        }
    }

    pub fn with_types(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.severity, self.code, self.message)?;
        if let (Some(e), Some(a)) = (&self.expected, &self.actual) {
            write!(f, " (expected {e}, got {a})")?;
        }
        Ok(())
    }
}

/// Diagnostics accumulated by a pass, bucketed the way spec.md §6's
/// `messages` field wants them exposed to the driver.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticBag {
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub info: Vec<Diagnostic>,
}

impl DiagnosticBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diag: Diagnostic) {
        match diag.severity {
            Severity::Error => self.errors.push(diag),
            Severity::Warning => self.warnings.push(diag),
            Severity::Info => self.info.push(diag),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn extend(&mut self, other: DiagnosticBag) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.info.extend(other.info);
    }
}

/// Top-level failure of `compile()` (spec.md §7 propagation policy: the
/// driver aborts only once a pass's error list is non-empty, or codegen
/// fails outright).
#[derive(Debug)]
pub enum CompileError {
    /// The type checker or IR generator accumulated Error-severity diagnostics.
    Diagnostics(DiagnosticBag),
    /// Codegen hit a fatal, non-recoverable condition (spec.md §4.4.3).
    Codegen(crate::codegen::CodeGenError),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Diagnostics(bag) => {
                write!(f, "compilation failed with {} error(s)", bag.errors.len())
            }
            CompileError::Codegen(e) => write!(f, "code generation failed: {e}"),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<crate::codegen::CodeGenError> for CompileError {
    fn from(e: crate::codegen::CodeGenError) -> Self {
        CompileError::Codegen(e)
    }
}

/// Diagnostic code constants (spec.md §7's three taxonomic layers).
pub mod codes {
    // Type errors (C2)
    pub const UNDEFINED_VARIABLE: &str = "UNDEFINED_VARIABLE";
    pub const TYPE_MISMATCH: &str = "TYPE_MISMATCH";
    pub const INVALID_OPERAND: &str = "INVALID_OPERAND";
    pub const INVALID_OPERATION: &str = "INVALID_OPERATION";
    pub const NOT_INDEXABLE: &str = "NOT_INDEXABLE";
    pub const NO_SUCH_FIELD: &str = "NO_SUCH_FIELD";
    pub const INVALID_INDEX_TYPE: &str = "INVALID_INDEX_TYPE";
    pub const INVALID_TYPE_CAST: &str = "INVALID_TYPE_CAST";
    pub const INVALID_ARGUMENT_COUNT: &str = "INVALID_ARGUMENT_COUNT";

    // IR-generation errors (C4)
    pub const UNKNOWN_TYPE: &str = "UNKNOWN_TYPE";
    pub const MISSING_TYPE_INFO: &str = "MISSING_TYPE_INFO";
    pub const INVALID_LVALUE: &str = "INVALID_LVALUE";
    pub const BREAK_OUTSIDE_LOOP: &str = "BREAK_OUTSIDE_LOOP";
    pub const CONTINUE_OUTSIDE_LOOP: &str = "CONTINUE_OUTSIDE_LOOP";
    pub const UNSUPPORTED_DECLARATION_KIND: &str = "UNSUPPORTED_DECLARATION_KIND";

    // Codegen errors (C6) - fatal, carried by CodeGenError rather than Diagnostic
    pub const MEMORY_ALLOCATION_FAILED: &str = "MEMORY_ALLOCATION_FAILED";
    pub const STACK_TOO_DEEP_UNRECOVERABLE: &str = "STACK_TOO_DEEP_UNRECOVERABLE";
    pub const UNSUPPORTED_INSTRUCTION: &str = "UNSUPPORTED_INSTRUCTION";
}
