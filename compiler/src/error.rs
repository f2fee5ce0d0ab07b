// error.rs: Crate-level error type
//
// Phase entry points report `Vec<Diagnostic>`; the pipeline folds a failed
// phase into one `PgcError` variant. Nothing is retried and there is no
// partial success.

use std::fmt;

use crate::diag::Diagnostic;
use crate::sim::ExecError;
use crate::verify::EquivalenceFailure;

pub type PgcResult<T> = std::result::Result<T, PgcError>;

#[derive(thiserror::Error, Debug)]
pub enum PgcError {
    /// Malformed or incomplete graph description.
    #[error("invalid graph description:\n{}", DiagList(.0))]
    Schema(Vec<Diagnostic>),

    /// Well-formed graph that cannot be lowered.
    #[error("graph cannot be lowered:\n{}", DiagList(.0))]
    Lowering(Vec<Diagnostic>),

    #[error(transparent)]
    Equivalence(#[from] EquivalenceFailure),

    /// Emitted text that does not parse back into LIR.
    #[error("artifact does not parse:\n  {}", .0.join("\n  "))]
    Artifact(Vec<String>),

    #[error("execution fault: {0}")]
    Exec(#[from] ExecError),
}

impl PgcError {
    /// Diagnostics carried by schema and lowering failures.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            PgcError::Schema(d) | PgcError::Lowering(d) => d,
            _ => &[],
        }
    }
}

struct DiagList<'a>(&'a [Diagnostic]);

impl fmt::Display for DiagList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  {}", d)?;
        }
        Ok(())
    }
}
