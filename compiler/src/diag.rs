// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used by every analysis and pass of the
// default-attribute pipeline. Diagnostics are attached to a program location
// (the whole program, an operation, or one operand of an operation).
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::id::OpId;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0100`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable diagnostic codes, grouped by the component that emits them.
pub mod codes {
    use super::DiagCode;

    // ── Program structure ──
    pub const E0001: DiagCode = DiagCode("E0001");

    // ── Loop nests and fusion ──
    pub const E0100: DiagCode = DiagCode("E0100");
    pub const E0101: DiagCode = DiagCode("E0101");
    pub const E0102: DiagCode = DiagCode("E0102");
    pub const E0103: DiagCode = DiagCode("E0103");
    pub const E0104: DiagCode = DiagCode("E0104");
    pub const E0105: DiagCode = DiagCode("E0105");

    // ── Sequencing ──
    pub const E0200: DiagCode = DiagCode("E0200");

    // ── Storage ──
    pub const E0300: DiagCode = DiagCode("E0300");
    pub const E0301: DiagCode = DiagCode("E0301");
    pub const E0302: DiagCode = DiagCode("E0302");
    pub const E0303: DiagCode = DiagCode("E0303");
    pub const E0304: DiagCode = DiagCode("E0304");
    pub const E0305: DiagCode = DiagCode("E0305");
    pub const E0306: DiagCode = DiagCode("E0306");
    pub const E0307: DiagCode = DiagCode("E0307");

    // ── Ordering hazards ──
    pub const E0400: DiagCode = DiagCode("E0400");
    pub const E0401: DiagCode = DiagCode("E0401");
    pub const E0402: DiagCode = DiagCode("E0402");
}

// ── Location ─────────────────────────────────────────────────────────────

/// Program location a diagnostic is reported against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Program,
    Op(OpId),
    Operand { op: OpId, index: usize },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Program => write!(f, "program"),
            Location::Op(op) => write!(f, "{}", op),
            Location::Operand { op, index } => write!(f, "{} operand #{}", op, index),
        }
    }
}

// ── Related location ─────────────────────────────────────────────────────

/// A secondary location providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct RelatedLocation {
    pub location: Location,
    pub label: String,
}

// ── Cause record ─────────────────────────────────────────────────────────

/// One link in a cause chain: an earlier failure a summary diagnostic stands
/// for.
#[derive(Debug, Clone)]
pub struct CauseRecord {
    pub message: String,
    pub location: Option<Location>,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// An error emitted by any analysis or pass.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub location: Location,
    pub message: String,
    pub hint: Option<String>,
    pub related: Vec<RelatedLocation>,
    pub cause_chain: Vec<CauseRecord>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, related locations, or causes.
    pub fn new(location: Location, message: impl Into<String>) -> Self {
        Self {
            code: None,
            location,
            message: message.into(),
            hint: None,
            related: Vec::new(),
            cause_chain: Vec::new(),
        }
    }

    /// Shorthand for a diagnostic carrying a code.
    pub fn error(code: DiagCode, location: Location, message: impl Into<String>) -> Self {
        Self::new(location, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a related location.
    pub fn with_related(mut self, location: Location, label: impl Into<String>) -> Self {
        self.related.push(RelatedLocation {
            location,
            label: label.into(),
        });
        self
    }

    /// Attach a cause record to the chain.
    pub fn with_cause(mut self, message: impl Into<String>, location: Option<Location>) -> Self {
        self.cause_chain.push(CauseRecord {
            message: message.into(),
            location,
        });
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "error[{}]: {}", code, self.message)?,
            None => write!(f, "error: {}", self.message)?,
        }
        for related in &self.related {
            write!(f, "\n  note: {}: {}", related.location, related.label)?;
        }
        for cause in &self.cause_chain {
            match cause.location {
                Some(location) => write!(f, "\n  cause: {}: {}", location, cause.message)?,
                None => write!(f, "\n  cause: {}", cause.message)?,
            }
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}
