#![no_std]

#[macro_use]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod bitmask;
pub mod constraints;
pub mod expr;
pub mod solver;

#[cfg(feature = "std")]
pub mod ktest;

// RE-EXPORTS
// ================================================================================================

pub use bitmask::ByteMask;
pub use constraints::ConstraintSet;
pub use expr::{
    Array, ArrayId, Expr, ExprKind, SymbolSet, WIDTH_8, WIDTH_16, WIDTH_32, WIDTH_64, WIDTH_BOOL,
    WIDTH_PTR, Width, symbols_of, unique_array_name,
};
#[cfg(feature = "std")]
pub use ktest::{KTest, KTestError, KTestHavocedLocation, KTestObject};
pub use solver::{DIFF_MASK_SOLVER_TIMEOUT, Solver, SolverError};
