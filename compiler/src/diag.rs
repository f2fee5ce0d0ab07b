// diag.rs: Unified diagnostics model
//
// Provides the shared diagnostic types used by the load, lower and verify
// phases. A diagnostic points at a graph field, a node, or both.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0008`, `W0100`).
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

/// Stable diagnostic codes.
///
/// `E00xx` schema, `E01xx` lowering, `E02xx` artifact/verification,
/// `W01xx` lowering warnings.
pub mod codes {
    use super::DiagCode;

    pub const E_INVALID_JSON: DiagCode = DiagCode("E0001");
    pub const E_MISSING_FRAME_WIDTH: DiagCode = DiagCode("E0002");
    pub const E_BAD_FRAME_WIDTH: DiagCode = DiagCode("E0003");
    pub const E_MISSING_NODES: DiagCode = DiagCode("E0004");
    pub const E_EMPTY_NODES: DiagCode = DiagCode("E0005");
    pub const E_MISSING_ID: DiagCode = DiagCode("E0006");
    pub const E_MISSING_KIND: DiagCode = DiagCode("E0007");
    pub const E_DUPLICATE_ID: DiagCode = DiagCode("E0008");
    pub const E_BAD_PARAM_VALUE: DiagCode = DiagCode("E0009");

    pub const E_UNKNOWN_KIND: DiagCode = DiagCode("E0100");
    pub const E_PARAM_RANGE: DiagCode = DiagCode("E0101");
    pub const E_LENGTH_MISMATCH: DiagCode = DiagCode("E0102");
    pub const E_TYPE_MISMATCH: DiagCode = DiagCode("E0103");
    pub const E_MISSING_INPUT: DiagCode = DiagCode("E0104");
    pub const E_TERMINAL: DiagCode = DiagCode("E0105");
    pub const E_MIRROR_VARIANT: DiagCode = DiagCode("E0106");
    pub const E_MIRROR_ODD_WIDTH: DiagCode = DiagCode("E0107");
    pub const E_CONDITIONAL_PLACEMENT: DiagCode = DiagCode("E0108");
    pub const E_BAD_PARAM: DiagCode = DiagCode("E0109");
    pub const E_OBLIGATION: DiagCode = DiagCode("E0110");

    pub const E_ARTIFACT_PARSE: DiagCode = DiagCode("E0200");
    pub const E_EQUIVALENCE: DiagCode = DiagCode("E0201");

    pub const W_DISCARDED_OUTPUT: DiagCode = DiagCode("W0100");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A diagnostic emitted by any phase.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub message: String,
    /// Id of the offending node, when one is known.
    pub node: Option<String>,
    /// Name of the offending field (`frame_width`, `nodes[2].kind`, ...).
    pub field: Option<String>,
    pub hint: Option<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, location, or hint.
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            message: message.into(),
            node: None,
            field: None,
            hint: None,
        }
    }

    pub fn error(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, message).with_code(code)
    }

    pub fn warning(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach the id of the node the diagnostic is about.
    pub fn with_node(mut self, id: impl Into<String>) -> Self {
        self.node = Some(id.into());
        self
    }

    /// Attach the offending field.
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        match (&self.node, &self.field) {
            (Some(node), Some(field)) => write!(f, " (node \"{}\", field `{}`)", node, field)?,
            (Some(node), None) => write!(f, " (node \"{}\")", node)?,
            (None, Some(field)) => write!(f, " (field `{}`)", field)?,
            (None, None) => {}
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

/// True if any diagnostic in the list is an error.
pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(Diagnostic::is_error)
}
