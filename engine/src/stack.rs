use std::sync::Arc;

use smallvec::SmallVec;
use symbex_core::expr::Expr;

use crate::{memory::ObjectId, module::{InstRef, KFunction}};

// STACK FRAME
// ================================================================================================

/// One call frame: the caller's cursor, the callee, a register file sized by the callee, and the
/// allocas bound while the frame is live.
///
/// A `None` local is an undefined cell; merging two states leaves a register undefined when
/// either side has not written it.
#[derive(Clone, Debug)]
pub struct StackFrame {
    pub caller: Option<InstRef>,
    pub function: Arc<KFunction>,
    pub locals: Vec<Option<Expr>>,
    pub allocas: SmallVec<[ObjectId; 4]>,
    pub varargs: Option<ObjectId>,
    /// Distance hint maintained by the coverage tracker; not interpreted by the core.
    pub min_dist_to_uncovered_on_return: u32,
}

impl StackFrame {
    pub fn new(caller: Option<InstRef>, function: Arc<KFunction>) -> Self {
        let locals = vec![None; function.num_registers() as usize];
        StackFrame {
            caller,
            function,
            locals,
            allocas: SmallVec::new(),
            varargs: None,
            min_dist_to_uncovered_on_return: 0,
        }
    }

    /// Whether two frames belong to the same call site and callee. Merge compares stacks
    /// frame-for-frame with this.
    pub fn same_shape(&self, other: &StackFrame) -> bool {
        self.caller == other.caller && self.function.id() == other.function.id()
    }
}
