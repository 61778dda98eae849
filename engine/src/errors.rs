//! Two-tier error boundary: memory and state operations return context-free errors
//! ([`MemoryError`], [`TerminationError`]); the intrinsic-dispatch boundary folds them into a
//! [`StateTermination`] that tells the interpreter what to do with the state. There is no
//! recovery of a terminated state.

use miette::Diagnostic;
use symbex_core::SolverError;

// MEMORY ERRORS
// ================================================================================================

#[derive(Debug, thiserror::Error, Diagnostic, PartialEq, Eq)]
pub enum MemoryError {
    #[error("object was rendered inaccessible: {message}")]
    Inaccessible { message: String },
    #[error("no object bound at address {address:#x}")]
    UnboundAddress { address: u64 },
    #[error("access of {width} bits at byte offset {offset} exceeds object of {size} bytes")]
    OutOfBounds { offset: u32, width: u32, size: u32 },
}

// STATE TERMINATION
// ================================================================================================

/// The error kinds a state can terminate with. The kind selects the suffix of the emitted
/// test-case artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationKind {
    User,
    Ptr,
    Assert,
    Overflow,
    Inaccessible,
    Unhandled,
    ReportError,
    Exec,
}

impl TerminationKind {
    /// Suffix of the error artifact written next to the test case.
    pub fn file_suffix(&self) -> &'static str {
        match self {
            TerminationKind::User => "user.err",
            TerminationKind::Ptr => "ptr.err",
            TerminationKind::Assert => "assert.err",
            TerminationKind::Overflow => "overflow.err",
            TerminationKind::Inaccessible => "inaccessible.err",
            TerminationKind::Unhandled => "unhandled.err",
            TerminationKind::ReportError => "report.err",
            TerminationKind::Exec => "exec.err",
        }
    }
}

/// A context-free description of why a state must terminate. Raised by state operations and
/// intrinsic handlers; the interpreter attaches the program location and emits the test case.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum TerminationError {
    #[error("{message}")]
    User { message: String },
    #[error("memory error: {message}")]
    Ptr { message: String, address: Option<u64> },
    #[error("{message}")]
    Assert { message: String },
    #[error("overflow on {operation}")]
    Overflow { operation: &'static str },
    #[error("inaccessible object: {message}")]
    Inaccessible { message: String },
    #[error("{message}")]
    Unhandled { message: String },
    #[error("{message}")]
    ReportError { message: String, suffix: String, file: String, line: u64 },
    #[error("internal error: {message}")]
    Exec { message: String },
    #[error("solver failure")]
    #[diagnostic(help("solver failures outside the loop-invariant fixpoint are fatal"))]
    Solver(#[from] SolverError),
}

impl TerminationError {
    pub fn user(message: impl Into<String>) -> Self {
        TerminationError::User { message: message.into() }
    }

    pub fn ptr(message: impl Into<String>, address: Option<u64>) -> Self {
        TerminationError::Ptr { message: message.into(), address }
    }

    pub fn assert_fail(message: impl Into<String>) -> Self {
        TerminationError::Assert { message: message.into() }
    }

    pub fn inaccessible(message: impl Into<String>) -> Self {
        TerminationError::Inaccessible { message: message.into() }
    }

    pub fn unhandled(message: impl Into<String>) -> Self {
        TerminationError::Unhandled { message: message.into() }
    }

    pub fn exec(message: impl Into<String>) -> Self {
        TerminationError::Exec { message: message.into() }
    }

    pub fn kind(&self) -> TerminationKind {
        match self {
            TerminationError::User { .. } => TerminationKind::User,
            TerminationError::Ptr { .. } => TerminationKind::Ptr,
            TerminationError::Assert { .. } => TerminationKind::Assert,
            TerminationError::Overflow { .. } => TerminationKind::Overflow,
            TerminationError::Inaccessible { .. } => TerminationKind::Inaccessible,
            TerminationError::Unhandled { .. } => TerminationKind::Unhandled,
            TerminationError::ReportError { .. } => TerminationKind::ReportError,
            TerminationError::Exec { .. } | TerminationError::Solver(_) => TerminationKind::Exec,
        }
    }
}

impl From<MemoryError> for TerminationError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::Inaccessible { message } => TerminationError::Inaccessible { message },
            MemoryError::UnboundAddress { address } => {
                TerminationError::ptr("invalid pointer", Some(address))
            },
            MemoryError::OutOfBounds { .. } => TerminationError::ptr(err.to_string(), None),
        }
    }
}

/// What the interpreter should do with a state after an intrinsic handler ran: nothing (the
/// handler completed), or terminate it in one of three ways.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum StateTermination {
    /// Normal program exit; a test case is emitted.
    #[error("program exit")]
    Exit,
    /// Exit without emitting a test case.
    #[error("silent exit")]
    SilentExit,
    #[error(transparent)]
    #[diagnostic(transparent)]
    Error(#[from] TerminationError),
}

impl From<MemoryError> for StateTermination {
    fn from(err: MemoryError) -> Self {
        StateTermination::Error(err.into())
    }
}

impl From<SolverError> for StateTermination {
    fn from(err: SolverError) -> Self {
        StateTermination::Error(err.into())
    }
}
