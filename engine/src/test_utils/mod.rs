//! Shared fixtures for the test suite: a deterministic structural solver, an in-memory host with
//! a bump allocator, and module/state builders.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use symbex_core::{
    ConstraintSet,
    expr::{Expr, ExprKind, WIDTH_8, WIDTH_PTR},
    ktest::{KTest, KTestHavocedLocation, KTestObject},
    solver::{Solver, SolverError},
};

use crate::{
    errors::TerminationError,
    host::Host,
    memory::{AddressSpace, MemoryObject, ObjectState},
    module::{BlockId, CallSite, InstRef, KFunction, LoopId, LoopInfo, Module},
    state::ExecutionState,
};

// TEST SOLVER
// ================================================================================================

/// A solver that decides only what structural constant folding already decided, and evaluates
/// expressions under the all-zero assignment for value queries. Sound for the validity answers
/// the engine acts on: a non-constant query is never "must".
#[derive(Debug, Default)]
pub struct TestSolver {
    pub timeout: Option<Duration>,
    pub queries: u32,
}

fn eval_zero(expr: &Expr) -> u64 {
    let width = expr.width();
    let mask = |v: u64| if width >= 64 { v } else { v & ((1u64 << width) - 1) };
    match expr.kind() {
        ExprKind::Constant(v) => *v,
        ExprKind::Read { .. } => 0,
        ExprKind::Concat { high, low } => {
            mask((eval_zero(high) << low.width()) | eval_zero(low))
        },
        ExprKind::Extract { expr, bit_offset } => mask(eval_zero(expr) >> bit_offset),
        ExprKind::Select { cond, on_true, on_false } => {
            if eval_zero(cond) != 0 { eval_zero(on_true) } else { eval_zero(on_false) }
        },
        ExprKind::And(a, b) => eval_zero(a) & eval_zero(b),
        ExprKind::Or(a, b) => eval_zero(a) | eval_zero(b),
        ExprKind::Eq(a, b) => u64::from(eval_zero(a) == eval_zero(b)),
        ExprKind::Ne(a, b) => u64::from(eval_zero(a) != eval_zero(b)),
        ExprKind::Mul(a, b) => mask(eval_zero(a).wrapping_mul(eval_zero(b))),
        ExprKind::Ult(a, b) => u64::from(eval_zero(a) < eval_zero(b)),
        ExprKind::Slt(a, b) => {
            let sext = |v: u64, w: u32| {
                if w >= 64 { v as i64 } else { ((v << (64 - w)) as i64) >> (64 - w) }
            };
            u64::from(sext(eval_zero(a), a.width()) < sext(eval_zero(b), b.width()))
        },
        ExprKind::ZExt(inner) => eval_zero(inner),
    }
}

impl Solver for TestSolver {
    fn must_be_true(
        &mut self,
        _constraints: &ConstraintSet,
        expr: &Expr,
    ) -> Result<bool, SolverError> {
        self.queries += 1;
        Ok(expr.is_true())
    }

    fn get_value(
        &mut self,
        _constraints: &ConstraintSet,
        expr: &Expr,
    ) -> Result<Expr, SolverError> {
        self.queries += 1;
        if expr.width() > 64 {
            return Err(SolverError::Unknown);
        }
        Ok(Expr::constant(eval_zero(expr), expr.width()))
    }

    fn get_range(
        &mut self,
        constraints: &ConstraintSet,
        expr: &Expr,
    ) -> Result<(Expr, Expr), SolverError> {
        if let Some(v) = expr.as_constant() {
            let c = Expr::constant(v, expr.width());
            return Ok((c.clone(), c));
        }
        let low = self.get_value(constraints, expr)?;
        let high = Expr::constant(u64::MAX, expr.width());
        Ok((low, high))
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }
}

// TEST HOST
// ================================================================================================

/// A host with a bump allocator over the state's address space and a recording test-case sink.
pub struct TestHost {
    pub solver: TestSolver,
    next_address: u64,
    functions: BTreeMap<u64, Arc<KFunction>>,
    pub preferences: Vec<(u64, Expr)>,
    pub emitted_tests: Vec<KTest>,
}

impl TestHost {
    pub fn new() -> Self {
        TestHost {
            solver: TestSolver::default(),
            next_address: 0x1_0000,
            functions: BTreeMap::new(),
            preferences: Vec::new(),
            emitted_tests: Vec::new(),
        }
    }

    /// Makes `function` resolvable at a fabricated address, returning that address.
    pub fn register_function(&mut self, function: Arc<KFunction>) -> u64 {
        let address = 0xf000_0000 + 0x10 * self.functions.len() as u64;
        self.functions.insert(address, function);
        address
    }
}

impl Host for TestHost {
    fn solver(&mut self) -> &mut dyn Solver {
        &mut self.solver
    }

    fn allocate(
        &mut self,
        state: &mut ExecutionState,
        size: &Expr,
        zero_memory: bool,
        _alignment: Option<u64>,
        site: &CallSite,
    ) -> Result<(), TerminationError> {
        let size = size
            .as_constant()
            .ok_or_else(|| TerminationError::unhandled("symbolic allocation size"))?;
        let address = self.next_address;
        self.next_address += size.max(1) + 16;
        let object = MemoryObject::new(address, size as u32, false, false);
        let contents = if zero_memory {
            ObjectState::zeroed(size as u32)
        } else {
            ObjectState::from_bytes(&vec![0xaa; size as usize])
        };
        state.address_space.bind_object(object, contents);
        if let Some(dest) = site.dest {
            state.bind_local(dest, Expr::constant(address, WIDTH_PTR));
        }
        Ok(())
    }

    fn free(
        &mut self,
        state: &mut ExecutionState,
        address: &Expr,
    ) -> Result<(), TerminationError> {
        let address = address
            .as_constant()
            .ok_or_else(|| TerminationError::unhandled("symbolic free address"))?;
        if address == 0 {
            return Ok(());
        }
        let id = state
            .address_space
            .resolve_one(address)
            .map(|(mo, _)| mo.id())
            .ok_or_else(|| TerminationError::ptr("free of unknown pointer", Some(address)))?;
        state.address_space.unbind_object(id);
        Ok(())
    }

    fn realloc(
        &mut self,
        state: &mut ExecutionState,
        address: &Expr,
        size: &Expr,
        site: &CallSite,
    ) -> Result<(), TerminationError> {
        if size.as_constant() == Some(0) {
            return self.free(state, address);
        }
        if address.as_constant() == Some(0) {
            return self.allocate(state, size, false, None, site);
        }
        self.allocate(state, size, false, None, site)?;
        self.free(state, address)
    }

    fn allocate_fixed(
        &mut self,
        state: &mut ExecutionState,
        address: u64,
        size: u64,
    ) -> Result<(), TerminationError> {
        let object = MemoryObject::new(address, size as u32, false, true);
        state.address_space.bind_object(object, ObjectState::zeroed(size as u32));
        Ok(())
    }

    fn function_at(&self, address: u64) -> Option<Arc<KFunction>> {
        self.functions.get(&address).cloned()
    }

    fn unwind_to_next_landing_pad(
        &mut self,
        _state: &mut ExecutionState,
    ) -> Result<(), TerminationError> {
        Ok(())
    }

    fn prefer_cex(&mut self, object: &Arc<MemoryObject>, condition: Expr) {
        self.preferences.push((object.address, condition));
    }

    /// Builds a test case under the all-zero model: one object per symbolic allocation, one
    /// havoc record per forgotten location.
    fn emit_test_case(&mut self, state: &ExecutionState) {
        let objects = state
            .symbolics
            .iter()
            .map(|(object, array)| KTestObject {
                name: array.name().to_string(),
                bytes: vec![0; object.size as usize],
            })
            .collect();
        let havocs = state
            .havocs
            .values()
            .filter(|info| info.havoced)
            .map(|info| KTestHavocedLocation {
                name: info.name.clone(),
                bytes: vec![0; info.mask.len() as usize],
                mask: info.mask.clone(),
            })
            .collect();
        self.emitted_tests.push(KTest { objects, havocs, ..KTest::default() });
    }
}

// FIXTURES
// ================================================================================================

/// A module holding `main` plus declarations for the whole intrinsic surface.
pub fn module_with_intrinsics() -> (Module, Arc<KFunction>) {
    let mut module = Module::new();
    let main = module.add_function("main", 16, LoopInfo::empty());
    for info in crate::intrinsics::INTRINSIC_TABLE {
        if module.function(info.name).is_none() {
            module.add_function(info.name, 0, LoopInfo::empty()).delete_body();
        }
    }
    (module, main)
}

/// A `main` whose block 1 heads the loop {1, 2}; block 0 is the entry, block 3 the exit.
pub fn module_with_loop() -> (Module, Arc<KFunction>, LoopId) {
    let mut module = Module::new();
    let mut loop_info = LoopInfo::empty();
    let loop_id = loop_info.add_loop(BlockId(1), [BlockId(1), BlockId(2)], None);
    let main = module.add_function("main", 16, loop_info);
    (module, main, loop_id)
}

pub fn fresh_state(main: &Arc<KFunction>) -> ExecutionState {
    let mut state = ExecutionState::new(main.clone());
    state.set_id();
    state
}

/// Binds a concrete object at `address` and returns it.
pub fn bind_bytes(
    space: &mut AddressSpace,
    address: u64,
    bytes: &[u8],
) -> Arc<MemoryObject> {
    let object = MemoryObject::new(address, bytes.len() as u32, false, false);
    space.bind_object(object.clone(), ObjectState::from_bytes(bytes));
    object
}

/// Binds a NUL-terminated string object at `address`.
pub fn bind_string(space: &mut AddressSpace, address: u64, text: &str) -> Arc<MemoryObject> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    bind_bytes(space, address, &bytes)
}

/// Moves the state's cursor into `block` of the active function.
pub fn at_block(state: &mut ExecutionState, block: BlockId) {
    let function = state.current_function().id();
    let cursor = InstRef { function, block, index: 0 };
    state.prev_pc = cursor;
    state.pc = cursor;
}

/// A call site whose result lands in register 0.
pub fn site_with_dest(state: &ExecutionState) -> CallSite {
    CallSite::new(state.pc, Some(0)).with_ret_width(WIDTH_PTR)
}

/// A call site whose result is discarded.
pub fn void_site(state: &ExecutionState) -> CallSite {
    CallSite::new(state.pc, None)
}

/// A 4-byte little-endian read of the whole `array`.
pub fn read32(array: &symbex_core::expr::Array) -> Expr {
    let mut value = Expr::read8(array, 0);
    for i in 1..4 {
        value = Expr::concat(Expr::read8(array, i), value);
    }
    value
}

pub fn byte(value: u8) -> Expr {
    Expr::constant(u64::from(value), WIDTH_8)
}
