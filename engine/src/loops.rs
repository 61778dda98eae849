//! Dynamic loop-invariant induction.
//!
//! A loop is analyzed in rounds: each round re-executes the body from a snapshot of the header
//! state, and every path that reaches the header again (or escapes the loop) is terminated after
//! folding the bytes it changed into a per-object diff mask. When the terminal path of a round
//! finds that the mask stopped growing, the fixpoint is registered and the loop restarts in
//! normal execution mode with the masked bytes forgotten (replaced by fresh symbolic arrays).

use std::{
    cell::RefCell,
    collections::BTreeMap,
    rc::Rc,
    sync::Arc,
    time::Duration,
};

use symbex_core::{
    ByteMask,
    expr::{Array, Expr},
    solver::Solver,
};
use tracing::debug;

use crate::{
    errors::TerminationError,
    memory::{AddressSpace, ObjectId},
    module::{BlockId, LoopId},
    state::ExecutionState,
};

/// Per-object byte masks covering all memory of a state.
pub type StateByteMask = BTreeMap<ObjectId, ByteMask>;

/// A converged loop analysis: the loop, the bytes that must be forgotten on entry, and the
/// address space observed at the header.
#[derive(Clone, Debug)]
pub struct LoopFixpoint {
    pub loop_id: LoopId,
    pub forget_mask: StateByteMask,
    pub entry_space: AddressSpace,
}

// LOOP IN PROCESS
// ================================================================================================

/// The shared record of one in-flight loop analysis.
///
/// The handle's reference count doubles as the number of sibling paths still executing inside the
/// current round: when a path terminates while being the only holder, it closes the round.
#[derive(Debug)]
pub struct LoopInProcess {
    loop_id: LoopId,
    /// Snapshot of the header state every round restarts from. Never carries a `loop_in_process`
    /// itself.
    restart_state: Box<ExecutionState>,
    /// Bytes known to possibly differ between rounds.
    changed_bytes: StateByteMask,
    /// Whether the current round discovered new differing bytes.
    last_round_updated: bool,
    /// Enclosing analysis for nested loops.
    outer: Option<Rc<RefCell<LoopInProcess>>>,
}

impl LoopInProcess {
    pub fn new(
        loop_id: LoopId,
        header_state: Box<ExecutionState>,
        outer: Option<Rc<RefCell<LoopInProcess>>>,
    ) -> Rc<RefCell<Self>> {
        debug_assert!(
            header_state.loop_in_process.is_none(),
            "the restart state must not itself be inside a loop analysis"
        );
        Rc::new(RefCell::new(LoopInProcess {
            loop_id,
            restart_state: header_state,
            changed_bytes: StateByteMask::new(),
            last_round_updated: false,
            outer,
        }))
    }

    pub fn loop_id(&self) -> LoopId {
        self.loop_id
    }

    pub fn changed_bytes(&self) -> &StateByteMask {
        &self.changed_bytes
    }

    pub fn entry_state(&self) -> &ExecutionState {
        &self.restart_state
    }

    pub fn outer(&self) -> Option<&Rc<RefCell<LoopInProcess>>> {
        self.outer.as_ref()
    }

    /// Folds the objects `current` has changed relative to the round's entry snapshot into the
    /// diff mask.
    pub fn update_changed_objects(
        &mut self,
        current: &ExecutionState,
        solver: &mut dyn Solver,
        timeout: Duration,
    ) -> Result<(), TerminationError> {
        let updated = update_diff_mask(
            &mut self.changed_bytes,
            &self.restart_state.address_space,
            current,
            solver,
            timeout,
        )?;
        if updated {
            self.last_round_updated = true;
        }
        Ok(())
    }

    /// Builds the state the next round (or the post-fixpoint normal execution) starts from:
    /// a clone of the header snapshot with every masked byte forgotten.
    fn make_restart_state(
        this: &Rc<RefCell<LoopInProcess>>,
    ) -> Result<Box<ExecutionState>, TerminationError> {
        let mut inner = this.borrow_mut();
        let loop_id = inner.loop_id;
        let mut state = Box::new(inner.restart_state.as_ref().clone());
        state.set_id();

        for (id, mask) in &inner.changed_bytes {
            let os = state
                .address_space
                .find_object(*id)
                .ok_or_else(|| {
                    TerminationError::exec("changed objects must contain only existing objects")
                })?
                .clone();
            if os.read_only {
                return Err(TerminationError::exec(
                    "read-only object cannot have been changed by a loop body",
                ));
            }
            debug!(
                target: "loop_analysis",
                %loop_id,
                object = %id,
                forgotten = mask.count_ones(),
                size = os.size(),
                "forgetting bytes"
            );

            let base = match state.havocs.get(id) {
                Some(info) => info.name.clone(),
                None if !state.condone_undeclared_havocs => {
                    return Err(TerminationError::exec(
                        "possible havoc location must have been predeclared",
                    ));
                },
                None => String::from("havoc"),
            };
            let array_name = state.unique_array_name(&base);
            let array = Array::new(array_name, os.size());

            let was_inaccessible = !os.is_accessible();
            let wos = state.address_space.get_writeable(*id).expect("found above");
            if was_inaccessible {
                wos.allow_access();
            }
            wos.forget_these(mask, &array);
            if was_inaccessible {
                wos.forbid_access_with_last_message();
            }

            if let Some(info) = state.havocs.get_mut(id) {
                // remember the generated value for test-case reporting; the array was not
                // created by make_symbolic, so it does not join `symbolics`
                info.value = Some(array);
                info.havoced = true;
                info.mask = mask.clone();
            }
        }

        if inner.last_round_updated {
            debug!(target: "loop_analysis", %loop_id, "more bytes changed, repeating the loop");
            inner.last_round_updated = false;
            drop(inner);
            state.loop_in_process = Some(this.clone());
        } else {
            debug!(target: "loop_analysis", %loop_id, "nothing else changed, restarting in normal mode");
            state.loop_in_process = inner.outer.clone();
            Arc::make_mut(&mut state.analysed_loops).insert(loop_id);
        }
        Ok(state)
    }
}

// DIFF MASK
// ================================================================================================

/// Adds to `mask` every byte of `state` that differs structurally from `ref_space` and that the
/// solver cannot prove equal under the state's constraints. Solver failures and timeouts count as
/// "may differ". Returns whether any bit was added.
pub(crate) fn update_diff_mask(
    mask: &mut StateByteMask,
    ref_space: &AddressSpace,
    state: &ExecutionState,
    solver: &mut dyn Solver,
    timeout: Duration,
) -> Result<bool, TerminationError> {
    let mut updated = false;
    for (object, ref_os) in ref_space.iter() {
        let os = state.address_space.find_object(object.id()).ok_or_else(|| {
            TerminationError::exec("object unbound during loop-invariant analysis")
        })?;
        if Arc::ptr_eq(ref_os, os) {
            continue;
        }
        if ref_os.is_accessible() != os.is_accessible() {
            let reason = if ref_os.is_accessible() {
                format!("cand {}", os.inaccessible_message())
            } else {
                format!("ref {}", ref_os.inaccessible_message())
            };
            return Err(TerminationError::exec(format!(
                "no support for accessibility alternation between loop iterations; \
                 inaccessibility reason: {reason}"
            )));
        }
        if !state.havocs.contains_key(&object.id()) && !state.condone_undeclared_havocs {
            return Err(TerminationError::exec(format!(
                "unexpected memory location changed its value during invariant analysis: \
                 local: {}, global: {}, fixed: {}, size: {}, address: {:#x}",
                object.is_local,
                object.is_global(),
                object.is_fixed,
                object.size,
                object.address,
            )));
        }

        let bytes = mask.entry(object.id()).or_insert_with(|| ByteMask::new(object.size));
        for offset in 0..object.size {
            if bytes.get(offset) {
                continue;
            }
            let ref_val = ref_os.read8(offset, true)?;
            let val = os.read8(offset, true)?;
            if ref_val == val {
                continue;
            }
            // the byte differs structurally; ask the solver whether it can really differ,
            // treating timeouts and failures as "yes"
            solver.set_timeout(Some(timeout));
            let may_differ = solver
                .may_be_false(&state.constraints, &Expr::eq(ref_val, val))
                .unwrap_or(true);
            solver.set_timeout(None);
            if may_differ {
                bytes.set(offset);
                updated = true;
            }
        }
    }
    Ok(updated)
}

// STATE-SIDE DRIVER
// ================================================================================================

impl ExecutionState {
    /// Cooperative termination. If a loop analysis is in progress, the terminal sibling of the
    /// round builds the replacement state the interpreter must schedule; earlier siblings just
    /// leave the round.
    pub fn terminate_state(&mut self) -> Result<Option<Box<ExecutionState>>, TerminationError> {
        let Some(lip) = self.loop_in_process.take() else {
            return Ok(None);
        };
        debug!(target: "loop_analysis", state = %self.id(), "terminating state inside loop analysis");
        if Rc::strong_count(&lip) > 1 {
            // siblings of this round are still running
            return Ok(None);
        }

        let analysis_finished = !lip.borrow().last_round_updated;
        if analysis_finished {
            let kf = self.current_function().clone();
            let inner = lip.borrow();
            debug!(target: "loop_analysis", loop_id = %inner.loop_id, "fixpoint reached");
            kf.insert_fixpoint(LoopFixpoint {
                loop_id: inner.loop_id,
                forget_mask: inner.changed_bytes.clone(),
                entry_space: inner.restart_state.address_space.clone(),
            });
        }
        let next = LoopInProcess::make_restart_state(&lip)?;
        Ok(Some(next))
    }

    /// Back edge to the header of `dst_loop`. Returns whether this path must terminate (it
    /// completed a round of an analysis in progress, or repeats an already-analyzed loop).
    fn loop_repetition(
        &mut self,
        dst_loop: LoopId,
        solver: &mut dyn Solver,
        timeout: Duration,
    ) -> Result<bool, TerminationError> {
        let in_process = self
            .loop_in_process
            .as_ref()
            .filter(|lip| lip.borrow().loop_id() == dst_loop)
            .cloned();
        if let Some(lip) = in_process {
            debug!(target: "loop_analysis", loop_id = %dst_loop, "loop repetition inside analysis round");
            lip.borrow_mut().update_changed_objects(&*self, solver, timeout)?;
            return Ok(true);
        }
        if self.analysed_loops.contains(&dst_loop) {
            debug!(target: "loop_analysis", loop_id = %dst_loop, "terminating repetition of analyzed loop");
            return Ok(true);
        }
        Ok(false)
    }

    /// Entering `dst_loop` through its header: snapshot the state in case an
    /// `induce_invariants` call follows, and re-arm the analysis for this loop.
    fn loop_enter(&mut self, dst_loop: LoopId) {
        debug!(target: "loop_analysis", loop_id = %dst_loop, "loop enter");
        Arc::make_mut(&mut self.analysed_loops).remove(&dst_loop);
        let mut snapshot = Box::new(self.clone());
        snapshot.loop_in_process = None;
        self.execution_state_for_loop_in_process = Some(snapshot);
    }

    /// Leaving `src_loop`. Returns whether this path must terminate (it escaped a loop whose
    /// analysis is in progress).
    fn loop_exit(&mut self, src_loop: LoopId) -> Result<bool, TerminationError> {
        debug!(target: "loop_analysis", loop_id = %src_loop, "loop exit");
        if let Some(lip) = &self.loop_in_process {
            if lip.borrow().loop_id() == src_loop {
                return Ok(true);
            }
        } else if let Some(mut snapshot) = self.execution_state_for_loop_in_process.take() {
            // no invariant search started; discard the header snapshot
            debug_assert!(snapshot.loop_in_process.is_none());
            let replacement = snapshot.terminate_state()?;
            debug_assert!(replacement.is_none());
        }
        Ok(false)
    }

    /// Loop bookkeeping for a basic-block transition `src` → `dst` inside the active function.
    /// Returns whether the path must terminate.
    pub fn update_loop_analysis_for_block_transfer(
        &mut self,
        dst: BlockId,
        src: BlockId,
        solver: &mut dyn Solver,
        timeout: Duration,
    ) -> Result<bool, TerminationError> {
        let kf = self.current_function().clone();
        let loop_info = &kf.loop_info;
        let dst_loop = loop_info.loop_for(dst);
        let src_loop = loop_info.loop_for(src);
        match (src_loop, dst_loop) {
            (Some(src_l), Some(dst_l)) if src_l == dst_l => {
                if loop_info.header(dst_l) == dst {
                    self.loop_repetition(dst_l, solver, timeout)
                } else {
                    // in-loop transition
                    Ok(false)
                }
            },
            (Some(src_l), Some(dst_l)) if loop_info.contains(src_l, dst_l) => {
                // nested loop enter
                debug_assert_eq!(loop_info.header(dst_l), dst);
                self.loop_enter(dst_l);
                Ok(false)
            },
            (Some(src_l), Some(dst_l)) if loop_info.contains(dst_l, src_l) => {
                // nested loop exit, possibly straight onto the outer header
                let exited = self.loop_exit(src_l)?;
                if loop_info.header(dst_l) == dst {
                    self.loop_repetition(dst_l, solver, timeout)
                } else {
                    Ok(exited)
                }
            },
            (Some(src_l), Some(dst_l)) => {
                // transition between disjoint loops
                debug_assert_eq!(loop_info.header(dst_l), dst);
                self.loop_enter(dst_l);
                self.loop_exit(src_l)
            },
            (Some(src_l), None) => self.loop_exit(src_l),
            (None, Some(dst_l)) => {
                debug_assert_eq!(loop_info.header(dst_l), dst);
                self.loop_enter(dst_l);
                Ok(false)
            },
            (None, None) => Ok(false),
        }
    }

    /// Starts the invariant search for the loop whose header contains the current instruction,
    /// consuming the header snapshot. A loop already analyzed (or being analyzed right now) is
    /// skipped.
    pub fn start_invariant_search(&mut self) -> Result<(), TerminationError> {
        let block = self.prev_pc.block;
        let kf = self.current_function().clone();
        let loop_id = kf.loop_info.loop_for(block).ok_or_else(|| {
            TerminationError::exec(
                "induce_invariants must be placed into the condition of a loop",
            )
        })?;

        let being_analyzed = self
            .loop_in_process
            .as_ref()
            .is_some_and(|lip| lip.borrow().loop_id() == loop_id);
        if being_analyzed || self.analysed_loops.contains(&loop_id) {
            debug!(target: "loop_analysis", %loop_id, "already analyzed, or being analyzed right now");
            return Ok(());
        }

        if kf.loop_info.header(loop_id) != block {
            return Err(TerminationError::exec(
                "induce_invariants must be placed into the condition of a loop",
            ));
        }
        let snapshot = self.execution_state_for_loop_in_process.take().ok_or_else(|| {
            TerminationError::exec(
                "the initial execution state must have been stored at the entrance of the loop \
                 header block",
            )
        })?;
        debug!(target: "loop_analysis", %loop_id, "starting search for loop invariants");
        self.loop_in_process =
            Some(LoopInProcess::new(loop_id, snapshot, self.loop_in_process.take()));
        Ok(())
    }

    /// The `induce_invariants` intrinsic: start (or skip) the search and return the all-ones
    /// value, so instrumented loop conditions stay reachable.
    pub fn induce_invariants_for_this_loop(
        &mut self,
        dest: Option<u32>,
    ) -> Result<(), TerminationError> {
        self.start_invariant_search()?;
        if let Some(dest) = dest {
            self.bind_local(dest, Expr::constant(0xffff_ffff, symbex_core::expr::WIDTH_32));
        }
        Ok(())
    }
}
