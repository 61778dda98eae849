use alloc::string::String;
use core::time::Duration;

use crate::{constraints::ConstraintSet, expr::Expr};

// SOLVER INTERFACE
// ================================================================================================

/// Solver timeout applied to the per-byte difference checks of the loop-invariant fixpoint.
///
/// A timed-out or failed query there is treated as "the byte may differ", so this can be kept
/// aggressively short.
pub const DIFF_MASK_SOLVER_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SolverError {
    #[error("solver query timed out")]
    Timeout,
    #[error("solver returned unknown")]
    Unknown,
    #[error("solver failure: {0}")]
    Failure(String),
}

/// The validity/value queries the engine issues against the external SMT backend.
///
/// All queries are evaluated under a constraint set; expressions passed to the validity queries
/// are boolean. Outside the loop-fixpoint byte-diff check a failed query is fatal to the issuing
/// state; inside it, failure degrades to the conservative answer.
pub trait Solver {
    /// Returns true iff `expr` holds in every model of `constraints`.
    fn must_be_true(&mut self, constraints: &ConstraintSet, expr: &Expr)
    -> Result<bool, SolverError>;

    /// Returns a constant expression that `expr` can evaluate to under `constraints`.
    fn get_value(&mut self, constraints: &ConstraintSet, expr: &Expr) -> Result<Expr, SolverError>;

    /// Returns constant lower/upper bounds of `expr` under `constraints`.
    fn get_range(
        &mut self,
        constraints: &ConstraintSet,
        expr: &Expr,
    ) -> Result<(Expr, Expr), SolverError>;

    /// Applies `timeout` to subsequent queries; `None` restores the unbounded default.
    fn set_timeout(&mut self, timeout: Option<Duration>);

    fn must_be_false(
        &mut self,
        constraints: &ConstraintSet,
        expr: &Expr,
    ) -> Result<bool, SolverError> {
        self.must_be_true(constraints, &Expr::is_zero(expr.clone()))
    }

    fn may_be_true(
        &mut self,
        constraints: &ConstraintSet,
        expr: &Expr,
    ) -> Result<bool, SolverError> {
        Ok(!self.must_be_false(constraints, expr)?)
    }

    fn may_be_false(
        &mut self,
        constraints: &ConstraintSet,
        expr: &Expr,
    ) -> Result<bool, SolverError> {
        Ok(!self.must_be_true(constraints, expr)?)
    }
}
