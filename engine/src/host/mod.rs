//! The interface to the external collaborators: the solver backend, the memory allocator of the
//! interpreter, function-pointer resolution, the errno/exception plumbing, and the test-case
//! emitter.

use std::sync::Arc;

use symbex_core::{expr::Expr, solver::Solver};

use crate::{
    errors::TerminationError,
    memory::MemoryObject,
    module::{CallSite, KFunction},
    state::ExecutionState,
};

// HOST TRAIT
// ================================================================================================

/// Capabilities the intrinsic handlers borrow from the surrounding interpreter.
///
/// Allocation-family methods bind the resulting pointer into the call site's destination register
/// themselves (mirroring how the interpreter binds every other call result); `realloc` owns its
/// zero-size/zero-pointer case split, forking internally if its allocator needs to.
pub trait Host {
    /// The solver handle borrowed per-state. Never shared across states within one call.
    fn solver(&mut self) -> &mut dyn Solver;

    fn allocate(
        &mut self,
        state: &mut ExecutionState,
        size: &Expr,
        zero_memory: bool,
        alignment: Option<u64>,
        site: &CallSite,
    ) -> Result<(), TerminationError>;

    fn free(
        &mut self,
        state: &mut ExecutionState,
        address: &Expr,
    ) -> Result<(), TerminationError>;

    fn realloc(
        &mut self,
        state: &mut ExecutionState,
        address: &Expr,
        size: &Expr,
        site: &CallSite,
    ) -> Result<(), TerminationError>;

    /// Binds an object of `size` bytes at the exact `address`.
    fn allocate_fixed(
        &mut self,
        state: &mut ExecutionState,
        address: u64,
        size: u64,
    ) -> Result<(), TerminationError>;

    /// Resolves a concrete address to the function it points at.
    fn function_at(&self, _address: u64) -> Option<Arc<KFunction>> {
        None
    }

    /// Address of the modeled `errno` location of `state`.
    fn errno_address(&self, _state: &ExecutionState) -> Option<u64> {
        None
    }

    /// The type id the personality routine compares selectors against.
    fn eh_typeid_for(&mut self, _type_info: &Expr) -> Result<Expr, TerminationError> {
        Err(TerminationError::unhandled("exception type ids are not modeled by this host"))
    }

    /// Continues a raised exception at the next landing pad.
    fn unwind_to_next_landing_pad(
        &mut self,
        _state: &mut ExecutionState,
    ) -> Result<(), TerminationError> {
        Err(TerminationError::unhandled("unwinding is not modeled by this host"))
    }

    /// Records a counter-example preference for `object`.
    fn prefer_cex(&mut self, object: &Arc<MemoryObject>, condition: Expr);

    /// Consumes `symbolics` and `havocs` of a terminating state.
    fn emit_test_case(&mut self, _state: &ExecutionState) {}
}
