//! The per-path execution record and its fork/merge operations.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    fmt,
    io::{self, Write},
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use regex::Regex;
use smallvec::SmallVec;
use symbex_core::{
    ByteMask, ConstraintSet,
    expr::{Array, Expr, SymbolSet, Width, unique_array_name},
};
use tracing::debug;

use crate::{
    errors::TerminationError,
    loops::LoopInProcess,
    memory::{AddressSpace, MemoryObject, ObjectId},
    module::{InstRef, KFunction, LoopId},
    stack::StackFrame,
    trace::CallInfo,
    unwind::UnwindingInformation,
};

mod merge;
pub use merge::{MergeGroup, MergeGroupRef};

// STATE IDENTITY
// ================================================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(u32);

impl StateId {
    pub const UNSET: StateId = StateId(0);
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "es{}", self.0)
    }
}

static NEXT_STATE_ID: AtomicU32 = AtomicU32::new(1);

// HAVOC REGISTRY
// ================================================================================================

/// A memory location pre-declared as allowed to change between loop-analysis rounds. Once the
/// location is actually forgotten, the generated array and the forgotten byte mask are recorded
/// here for test-case emission.
#[derive(Clone, Debug)]
pub struct HavocInfo {
    pub name: String,
    pub havoced: bool,
    pub mask: ByteMask,
    pub value: Option<Array>,
}

// FUNCTION ALIASES
// ================================================================================================

/// One callee-name rewrite rule. Rules are searched in insertion order; the first match wins.
/// Removal matches the rule's original pattern text, never the functions a regex rule happens to
/// match.
#[derive(Clone, Debug)]
struct FunctionAlias {
    name: String,
    alias: String,
    regex: Option<Regex>,
}

// EXECUTION STATE
// ================================================================================================

/// Complete record of one in-flight execution path.
pub struct ExecutionState {
    /// Instruction to be executed next.
    pub pc: InstRef,
    /// Instruction currently being executed.
    pub prev_pc: InstRef,
    /// Call stack; the active frame is the last element.
    pub stack: Vec<StackFrame>,
    /// Which predecessor block control arrived from (selects phi values).
    pub incoming_bb_index: u32,
    /// Number of times this path was forked.
    pub depth: u32,
    pub address_space: AddressSpace,
    /// Loop-invariant analysis in progress, shared with the sibling paths of the same round. The
    /// handle's reference count is the number of paths still inside the round.
    pub loop_in_process: Option<Rc<RefCell<LoopInProcess>>>,
    /// Loops whose fixpoint already converged; shared across forks.
    pub analysed_loops: Arc<BTreeSet<LoopId>>,
    /// Snapshot taken when entering a loop header, consumed by `induce_invariants` if the
    /// analysis actually starts.
    pub execution_state_for_loop_in_process: Option<Box<ExecutionState>>,
    pub constraints: ConstraintSet,
    pub covered_lines: BTreeMap<String, BTreeSet<u32>>,
    /// Allocations made symbolic, in creation order; drives test-case emission.
    pub symbolics: Vec<(Arc<MemoryObject>, Array)>,
    pub havocs: BTreeMap<ObjectId, HavocInfo>,
    havoc_names: BTreeSet<String>,
    array_names: BTreeSet<String>,
    /// The recorded call trace; the last entry is the active call.
    pub call_path: Vec<CallInfo>,
    /// Symbols carried over from previous returns; seeds the relevant-constraint closure of the
    /// next call.
    pub relevant_symbols: SymbolSet,
    /// False for ancillary paths (e.g. invariant-search rounds) whose traces must not be
    /// reported.
    pub do_trace: bool,
    /// Forgives undeclared memory locations changing during invariant analysis.
    pub condone_undeclared_havocs: bool,
    pub open_merge_stack: SmallVec<[MergeGroupRef; 2]>,
    pub stepped_instructions: u64,
    pub reused_symbols: BTreeMap<String, BTreeMap<i32, Expr>>,
    pub bpf_calls: u32,
    pub insts_since_cov_new: u32,
    pub unwinding_information: Option<UnwindingInformation>,
    id: StateId,
    pub covered_new: bool,
    /// Set by `set_forking(0)`; the fork scheduler honors it.
    pub fork_disabled: bool,
    fn_aliases: Vec<FunctionAlias>,
    reads_intercepts: BTreeMap<u64, String>,
    writes_intercepts: BTreeMap<u64, String>,
}

impl ExecutionState {
    /// The initial state: a single frame for `kf` with the cursor at its entry.
    pub fn new(kf: Arc<KFunction>) -> Self {
        let pc = InstRef::entry(kf.id());
        let mut state = ExecutionState {
            pc,
            prev_pc: pc,
            stack: Vec::new(),
            incoming_bb_index: 0,
            depth: 0,
            address_space: AddressSpace::new(),
            loop_in_process: None,
            analysed_loops: Arc::new(BTreeSet::new()),
            execution_state_for_loop_in_process: None,
            constraints: ConstraintSet::new(),
            covered_lines: BTreeMap::new(),
            symbolics: Vec::new(),
            havocs: BTreeMap::new(),
            havoc_names: BTreeSet::new(),
            array_names: BTreeSet::new(),
            call_path: Vec::new(),
            relevant_symbols: SymbolSet::new(),
            do_trace: true,
            condone_undeclared_havocs: false,
            open_merge_stack: SmallVec::new(),
            stepped_instructions: 0,
            reused_symbols: BTreeMap::new(),
            bpf_calls: 0,
            insts_since_cov_new: 0,
            unwinding_information: None,
            id: StateId::UNSET,
            covered_new: false,
            fork_disabled: false,
            fn_aliases: Vec::new(),
            reads_intercepts: BTreeMap::new(),
            writes_intercepts: BTreeMap::new(),
        };
        state.push_frame(None, kf);
        state
    }

    // IDENTITY
    // --------------------------------------------------------------------------------------------

    pub fn id(&self) -> StateId {
        self.id
    }

    /// Assigns the next process-wide id. Clones carry [`StateId::UNSET`] until this is called.
    pub fn set_id(&mut self) {
        self.id = StateId(NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed));
    }

    // FORKING
    // --------------------------------------------------------------------------------------------

    /// Clones this state into an independent successor with a fresh id and reset coverage
    /// tracking. The clone shares the address space copy-on-write and joins every open merge
    /// group and the active loop-analysis round.
    pub fn branch(&mut self) -> ExecutionState {
        self.depth += 1;

        let mut other = self.clone();
        other.set_id();
        other.covered_new = false;
        other.covered_lines.clear();
        debug!(parent = %self.id, child = %other.id, depth = self.depth, "forked state");
        other
    }

    // STACK
    // --------------------------------------------------------------------------------------------

    pub fn push_frame(&mut self, caller: Option<InstRef>, kf: Arc<KFunction>) {
        self.stack.push(StackFrame::new(caller, kf));
    }

    /// Pops the active frame, unbinding its allocas from the address space.
    pub fn pop_frame(&mut self) {
        if let Some(frame) = self.stack.pop() {
            for alloca in &frame.allocas {
                self.address_space.unbind_object(*alloca);
            }
        }
    }

    /// The callee of the active frame.
    pub fn current_function(&self) -> &Arc<KFunction> {
        &self.stack.last().expect("state has no stack frame").function
    }

    /// Writes `value` into a register of the active frame.
    pub fn bind_local(&mut self, register: u32, value: Expr) {
        let frame = self.stack.last_mut().expect("state has no stack frame");
        frame.locals[register as usize] = Some(value);
    }

    // CONSTRAINTS AND SYMBOLICS
    // --------------------------------------------------------------------------------------------

    pub fn add_constraint(&mut self, constraint: Expr) {
        self.constraints.add(constraint);
    }

    pub fn add_symbolic(&mut self, object: Arc<MemoryObject>, array: Array) {
        self.symbolics.push((object, array));
    }

    /// Returns an array name derived from `base` that no other array of this state uses.
    pub fn unique_array_name(&mut self, base: &str) -> String {
        unique_array_name(&mut self.array_names, base)
    }

    /// Installs a fresh symbolic array over the whole object and records it for test-case
    /// emission.
    pub fn make_symbolic_object(
        &mut self,
        id: ObjectId,
        name: &str,
    ) -> Result<Array, TerminationError> {
        let object = self
            .address_space
            .object(id)
            .ok_or_else(|| TerminationError::exec("make_symbolic of an unbound object"))?
            .clone();
        let unique = self.unique_array_name(name);
        let array = Array::new(unique, object.size);
        let wos = self.address_space.get_writeable(id).expect("object bound above");
        wos.make_symbolic(&array);
        self.add_symbolic(object, array.clone());
        Ok(array)
    }

    /// Pre-declares `object` as allowed to be havoced under `name`. Names are unique per state.
    pub fn add_havoc_info(&mut self, id: ObjectId, name: &str) -> Result<(), TerminationError> {
        if let Some(existing) = self.havocs.get(&id) {
            if existing.name == name {
                return Ok(());
            }
            return Err(TerminationError::user(format!(
                "object already declared as havoc location '{}'",
                existing.name
            )));
        }
        if !self.havoc_names.insert(name.to_string()) {
            return Err(TerminationError::user(format!(
                "havoc location name '{name}' is already in use"
            )));
        }
        self.havocs.insert(
            id,
            HavocInfo { name: name.to_string(), havoced: false, mask: ByteMask::new(0), value: None },
        );
        Ok(())
    }

    // MEMORY VIEWS
    // --------------------------------------------------------------------------------------------

    pub fn is_accessible_addr(&self, address: u64) -> Result<bool, TerminationError> {
        let (_, os) = self
            .address_space
            .resolve_one(address)
            .ok_or_else(|| TerminationError::ptr("unknown pointer", Some(address)))?;
        Ok(os.is_accessible())
    }

    /// Reads `width` bits at a concrete address. The trace system passes
    /// `circumvent_inaccessibility` to peek at objects the program itself may not touch.
    pub fn read_memory_chunk(
        &self,
        address: u64,
        width: Width,
        circumvent_inaccessibility: bool,
    ) -> Result<Expr, TerminationError> {
        let (object, os) = self
            .address_space
            .resolve_one(address)
            .ok_or_else(|| TerminationError::ptr("unknown pointer", Some(address)))?;
        let offset = object.offset_of(address);
        Ok(os.read(offset, width, circumvent_inaccessibility)?)
    }

    // FUNCTION ALIASES
    // --------------------------------------------------------------------------------------------

    /// Resolves `fn_name` through the alias table; `None` when no rule matches.
    pub fn get_fn_alias(&self, fn_name: &str) -> Option<&str> {
        for rule in &self.fn_aliases {
            let matches = match &rule.regex {
                Some(re) => re.is_match(fn_name),
                None => rule.name == fn_name,
            };
            if matches {
                return Some(&rule.alias);
            }
        }
        None
    }

    pub fn add_fn_alias(&mut self, old_fn: &str, new_fn: &str) {
        self.remove_fn_alias(old_fn);
        self.fn_aliases.push(FunctionAlias {
            name: old_fn.to_string(),
            alias: new_fn.to_string(),
            regex: None,
        });
    }

    pub fn add_fn_regex_alias(&mut self, fn_regex: &str, new_fn: &str) -> Result<(), regex::Error> {
        self.remove_fn_alias(fn_regex);
        // match the whole name, as alias rules name functions, not substrings
        let re = Regex::new(&format!("^(?:{fn_regex})$"))?;
        self.fn_aliases.push(FunctionAlias {
            name: fn_regex.to_string(),
            alias: new_fn.to_string(),
            regex: Some(re),
        });
        Ok(())
    }

    pub fn remove_fn_alias(&mut self, fn_name: &str) {
        self.fn_aliases.retain(|rule| rule.name != fn_name);
    }

    // HARDWARE-MODELING INTERCEPTS
    // --------------------------------------------------------------------------------------------

    pub fn get_intercept_reader(&self, address: u64) -> Option<&str> {
        self.reads_intercepts.get(&address).map(String::as_str)
    }

    pub fn get_intercept_writer(&self, address: u64) -> Option<&str> {
        self.writes_intercepts.get(&address).map(String::as_str)
    }

    pub fn add_reads_intercept(&mut self, address: u64, reader: String) {
        self.reads_intercepts.insert(address, reader);
    }

    pub fn add_writes_intercept(&mut self, address: u64, writer: String) {
        self.writes_intercepts.insert(address, writer);
    }

    // DIAGNOSTICS
    // --------------------------------------------------------------------------------------------

    /// Writes a human-readable stack trace, innermost frame first.
    pub fn dump_stack(&self, out: &mut dyn Write) -> io::Result<()> {
        let mut target = self.prev_pc;
        for (idx, frame) in self.stack.iter().rev().enumerate() {
            writeln!(
                out,
                "\t#{idx} {:08} in {} ()",
                target.index,
                frame.function.name()
            )?;
            match frame.caller {
                Some(caller) => target = caller,
                None => break,
            }
        }
        Ok(())
    }

    /// Writes the current path constraints in the call-path text form.
    pub fn write_constraints(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, ";;-- Constraints --")?;
        for constraint in self.constraints.iter() {
            writeln!(out, "{constraint}")?;
        }
        Ok(())
    }
}

impl Clone for ExecutionState {
    /// Deep-copies the path-local record. The clone has no id yet, drops the loop-header
    /// snapshot (it belongs to the original path), and announces itself to every open merge
    /// group.
    fn clone(&self) -> Self {
        for group in &self.open_merge_stack {
            group.borrow_mut().register_open();
        }
        ExecutionState {
            pc: self.pc,
            prev_pc: self.prev_pc,
            stack: self.stack.clone(),
            incoming_bb_index: self.incoming_bb_index,
            depth: self.depth,
            address_space: self.address_space.clone(),
            loop_in_process: self.loop_in_process.clone(),
            analysed_loops: self.analysed_loops.clone(),
            execution_state_for_loop_in_process: None,
            constraints: self.constraints.clone(),
            covered_lines: self.covered_lines.clone(),
            symbolics: self.symbolics.clone(),
            havocs: self.havocs.clone(),
            havoc_names: self.havoc_names.clone(),
            array_names: self.array_names.clone(),
            call_path: self.call_path.clone(),
            relevant_symbols: self.relevant_symbols.clone(),
            do_trace: self.do_trace,
            condone_undeclared_havocs: self.condone_undeclared_havocs,
            open_merge_stack: self.open_merge_stack.clone(),
            stepped_instructions: self.stepped_instructions,
            reused_symbols: self.reused_symbols.clone(),
            bpf_calls: self.bpf_calls,
            insts_since_cov_new: self.insts_since_cov_new,
            unwinding_information: self.unwinding_information.clone(),
            id: StateId::UNSET,
            covered_new: self.covered_new,
            fork_disabled: self.fork_disabled,
            fn_aliases: self.fn_aliases.clone(),
            reads_intercepts: self.reads_intercepts.clone(),
            writes_intercepts: self.writes_intercepts.clone(),
        }
    }
}

impl Drop for ExecutionState {
    fn drop(&mut self) {
        for group in &self.open_merge_stack {
            group.borrow_mut().deregister_open();
        }
        while !self.stack.is_empty() {
            self.pop_frame();
        }
    }
}

impl fmt::Debug for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionState")
            .field("id", &self.id)
            .field("pc", &self.pc)
            .field("depth", &self.depth)
            .field("constraints", &self.constraints.len())
            .field("objects", &self.address_space.len())
            .finish_non_exhaustive()
    }
}
