//! Core of a symbolic execution engine for an LLVM-style intermediate representation.
//!
//! The crate owns the per-path [`ExecutionState`] record with its fork and merge operations, the
//! copy-on-write [`AddressSpace`], the loop-invariant fixpoint driver, the typed call trace, and
//! the dispatcher for the modeling intrinsics target programs link against. The interpreter main
//! loop, the IR front end, and the SMT backend are external: they drive the state one instruction
//! at a time and provide their capabilities through the [`Host`] trait and the
//! `symbex_core::Solver` interface.

mod errors;
mod loops;
mod memory;
mod module;
mod options;
mod stack;
mod state;
mod trace;
mod unwind;

pub mod host;
pub mod intrinsics;

#[cfg(test)]
mod test_utils;

#[cfg(test)]
mod tests;

// RE-EXPORTS
// ================================================================================================

pub use errors::{MemoryError, StateTermination, TerminationError, TerminationKind};
pub use host::Host;
pub use intrinsics::{INTRINSIC_TABLE, IntrinsicKind, Intrinsics, warning_once};
pub use loops::{LoopFixpoint, LoopInProcess, StateByteMask};
pub use memory::{AddressSpace, MemoryObject, ObjectId, ObjectState};
pub use module::{BlockId, CallSite, FunctionId, InstRef, KFunction, LoopId, LoopInfo, Module};
pub use options::{EngineOptions, EngineOptionsError};
pub use stack::StackFrame;
pub use state::{ExecutionState, HavocInfo, MergeGroup, MergeGroupRef, StateId};
pub use symbex_core::{
    ByteMask, ConstraintSet,
    expr::{Array, ArrayId, Expr, ExprKind, SymbolSet, Width, symbols_of},
    solver::{Solver, SolverError},
};
pub use trace::{
    CallArg, CallExtraFPtr, CallExtraPtr, CallExtraVal, CallInfo, CallPathError, CallPathSummary,
    Direction, FieldDescr, LoadedCall, RetVal, load_call_path, write_call_path,
};
pub use unwind::UnwindingInformation;
