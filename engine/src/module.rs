//! The narrow view of the loaded program the engine core needs: function identities with their
//! register counts, basic-block cursors, and per-function loop nests. Instruction decoding and
//! module loading live in the front end.

use std::{
    cell::{Cell, Ref, RefCell},
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use symbex_core::expr::{WIDTH_64, Width};

use crate::loops::LoopFixpoint;

// IDENTITIES AND CURSORS
// ================================================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoopId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop{}", self.0)
    }
}

/// An opaque instruction cursor into the loaded module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstRef {
    pub function: FunctionId,
    pub block: BlockId,
    pub index: u32,
}

impl InstRef {
    pub fn entry(function: FunctionId) -> Self {
        InstRef { function, block: BlockId(0), index: 0 }
    }
}

/// The call instruction an intrinsic was invoked from: its cursor, the destination register of
/// the call (if the result is consumed), and the width the result is expected at.
#[derive(Clone, Copy, Debug)]
pub struct CallSite {
    pub at: InstRef,
    pub dest: Option<u32>,
    pub ret_width: Width,
}

impl CallSite {
    pub fn new(at: InstRef, dest: Option<u32>) -> Self {
        CallSite { at, dest, ret_width: WIDTH_64 }
    }

    pub fn with_ret_width(mut self, width: Width) -> Self {
        self.ret_width = width;
        self
    }
}

// LOOP INFORMATION
// ================================================================================================

#[derive(Clone, Debug)]
struct LoopNode {
    header: BlockId,
    blocks: BTreeSet<BlockId>,
    parent: Option<LoopId>,
}

/// The natural-loop forest of one function.
#[derive(Clone, Debug, Default)]
pub struct LoopInfo {
    loops: BTreeMap<LoopId, LoopNode>,
}

impl LoopInfo {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Registers a loop. The header must be one of the loop's blocks, and a nested loop's blocks
    /// must all belong to its parent.
    pub fn add_loop(
        &mut self,
        header: BlockId,
        blocks: impl IntoIterator<Item = BlockId>,
        parent: Option<LoopId>,
    ) -> LoopId {
        let blocks: BTreeSet<_> = blocks.into_iter().collect();
        assert!(blocks.contains(&header), "loop header must be a loop block");
        if let Some(p) = parent {
            let pnode = &self.loops[&p];
            assert!(blocks.is_subset(&pnode.blocks), "nested loop escapes its parent");
        }
        let id = LoopId(self.loops.len() as u32);
        self.loops.insert(id, LoopNode { header, blocks, parent });
        id
    }

    /// The innermost loop containing `block`, if any.
    pub fn loop_for(&self, block: BlockId) -> Option<LoopId> {
        self.loops
            .iter()
            .filter(|(_, node)| node.blocks.contains(&block))
            .max_by_key(|(id, _)| self.depth(**id))
            .map(|(id, _)| *id)
    }

    pub fn header(&self, id: LoopId) -> BlockId {
        self.loops[&id].header
    }

    pub fn is_header(&self, block: BlockId) -> bool {
        self.loops.values().any(|node| node.header == block)
    }

    /// Whether `outer` contains `inner` (reflexively).
    pub fn contains(&self, outer: LoopId, inner: LoopId) -> bool {
        let mut cursor = Some(inner);
        while let Some(id) = cursor {
            if id == outer {
                return true;
            }
            cursor = self.loops[&id].parent;
        }
        false
    }

    fn depth(&self, id: LoopId) -> u32 {
        let mut depth = 0;
        let mut cursor = self.loops[&id].parent;
        while let Some(p) = cursor {
            depth += 1;
            cursor = self.loops[&p].parent;
        }
        depth
    }
}

// FUNCTIONS
// ================================================================================================

/// Per-function metadata: register-file size for stack frames, the loop nest, and the registry of
/// converged loop fixpoints.
#[derive(Debug)]
pub struct KFunction {
    id: FunctionId,
    name: String,
    num_registers: u32,
    pub loop_info: LoopInfo,
    fixpoints: RefCell<Vec<LoopFixpoint>>,
    is_declaration: Cell<bool>,
    does_not_return: Cell<bool>,
}

impl KFunction {
    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_registers(&self) -> u32 {
        self.num_registers
    }

    /// Whether the function has no body in the loaded module.
    pub fn is_declaration(&self) -> bool {
        self.is_declaration.get()
    }

    /// Drops the function's body so calls can only resolve to the engine-side handler.
    pub fn delete_body(&self) {
        self.is_declaration.set(true);
    }

    pub fn does_not_return(&self) -> bool {
        self.does_not_return.get()
    }

    pub fn mark_no_return(&self) {
        self.does_not_return.set(true);
    }

    /// Records a converged loop fixpoint: the loop, the byte mask that had to be forgotten, and
    /// the address space at loop entry.
    pub fn insert_fixpoint(&self, fixpoint: LoopFixpoint) {
        self.fixpoints.borrow_mut().push(fixpoint);
    }

    pub fn fixpoints(&self) -> Ref<'_, Vec<LoopFixpoint>> {
        self.fixpoints.borrow()
    }
}

impl PartialEq for KFunction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for KFunction {}

/// The function table of a loaded module.
#[derive(Debug, Default)]
pub struct Module {
    functions: BTreeMap<String, Arc<KFunction>>,
    by_id: BTreeMap<FunctionId, Arc<KFunction>>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        num_registers: u32,
        loop_info: LoopInfo,
    ) -> Arc<KFunction> {
        let name = name.into();
        let id = FunctionId(self.functions.len() as u32);
        let kf = Arc::new(KFunction {
            id,
            name: name.clone(),
            num_registers,
            loop_info,
            fixpoints: RefCell::new(Vec::new()),
            is_declaration: Cell::new(false),
            does_not_return: Cell::new(false),
        });
        self.functions.insert(name, kf.clone());
        self.by_id.insert(id, kf.clone());
        kf
    }

    pub fn function(&self, name: &str) -> Option<&Arc<KFunction>> {
        self.functions.get(name)
    }

    pub fn function_by_id(&self, id: FunctionId) -> Option<&Arc<KFunction>> {
        self.by_id.get(&id)
    }

    pub fn functions(&self) -> impl Iterator<Item = &Arc<KFunction>> {
        self.by_id.values()
    }
}
