use std::time::Duration;

use miette::Diagnostic;
use symbex_core::solver::DIFF_MASK_SOLVER_TIMEOUT;

// ENGINE OPTIONS
// ================================================================================================

#[derive(Debug, thiserror::Error, Diagnostic, PartialEq, Eq)]
pub enum EngineOptionsError {
    #[error("diff-mask solver timeout must be non-zero")]
    #[diagnostic(help("an unbounded byte-diff query can stall every loop-analysis round"))]
    ZeroDiffMaskTimeout,
}

/// Knobs of the engine core.
///
/// Mirrors the command-line surface of the interpreter: whether `open_merge`/`close_merge`
/// regions are honored, how a provably false `assume` terminates, whether `posix_prefer_cex` is
/// active, whether loop analysis forgives mutation of undeclared objects, and the solver timeout
/// for the per-byte fixpoint checks.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub use_merge: bool,
    pub silent_assume: bool,
    pub readable_posix: bool,
    pub condone_undeclared_havocs: bool,
    pub diff_mask_timeout: Duration,
}

impl EngineOptions {
    pub fn new(
        use_merge: bool,
        silent_assume: bool,
        readable_posix: bool,
        condone_undeclared_havocs: bool,
        diff_mask_timeout: Duration,
    ) -> Result<Self, EngineOptionsError> {
        if diff_mask_timeout.is_zero() {
            return Err(EngineOptionsError::ZeroDiffMaskTimeout);
        }
        Ok(EngineOptions {
            use_merge,
            silent_assume,
            readable_posix,
            condone_undeclared_havocs,
            diff_mask_timeout,
        })
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            use_merge: true,
            silent_assume: false,
            readable_posix: false,
            condone_undeclared_havocs: false,
            diff_mask_timeout: DIFF_MASK_SOLVER_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_is_rejected() {
        let err = EngineOptions::new(true, false, false, false, Duration::ZERO).unwrap_err();
        assert_eq!(err, EngineOptionsError::ZeroDiffMaskTimeout);
    }
}
