//! State merging: `open_merge`/`close_merge` bookkeeping and the join of two sibling states at an
//! equal program counter.

use std::{cell::RefCell, collections::BTreeSet, rc::Rc, sync::Arc};

use symbex_core::{ConstraintSet, expr::Expr};
use tracing::debug;

use super::{ExecutionState, StateId};

// MERGE GROUPS
// ================================================================================================

/// One `open_merge` region. Every state that ran through the corresponding `open_merge` (or was
/// forked from one that did) is registered here until it either closes the region or dies; the
/// merge scheduler releases the group's closed states once no open ones remain.
#[derive(Debug, Default)]
pub struct MergeGroup {
    open_states: usize,
    closed_states: Vec<StateId>,
}

pub type MergeGroupRef = Rc<RefCell<MergeGroup>>;

impl MergeGroup {
    /// A fresh group with the opening state already registered.
    pub fn new_ref() -> MergeGroupRef {
        Rc::new(RefCell::new(MergeGroup { open_states: 1, closed_states: Vec::new() }))
    }

    pub fn register_open(&mut self) {
        self.open_states += 1;
    }

    pub fn deregister_open(&mut self) {
        debug_assert!(self.open_states > 0, "deregistering from an empty merge group");
        self.open_states = self.open_states.saturating_sub(1);
    }

    /// Moves one state from the open to the closed set.
    pub fn close(&mut self, state: StateId) {
        self.deregister_open();
        self.closed_states.push(state);
    }

    pub fn open_count(&self) -> usize {
        self.open_states
    }

    pub fn closed_states(&self) -> &[StateId] {
        &self.closed_states
    }
}

// STATE MERGING
// ================================================================================================

impl ExecutionState {
    /// Attempts to fuse sibling state `b` into `self`.
    ///
    /// The merge succeeds only when both states sit at the same program counter with identical
    /// stack shapes, identical symbolics, identical address-space key sets, no active
    /// loop-analysis round, and no in-flight unwinding. On success every diverging local and
    /// memory byte becomes a `Select` on the join predicate and the constraint set becomes
    /// `common ∪ {inA ∨ inB}`; no solver calls are made.
    pub fn merge(&mut self, b: &ExecutionState) -> bool {
        debug!(a = %self.id, b = %b.id, "attempting state merge");
        if self.pc != b.pc {
            return false;
        }

        if self.loop_in_process.is_some() || b.loop_in_process.is_some() {
            debug!("merge unsupported during loop-invariant analysis");
            return false;
        }

        if self.unwinding_information.is_some() || b.unwinding_information.is_some() {
            debug!("merge refused for states with in-flight unwinding");
            return false;
        }

        if self.symbolics.len() != b.symbolics.len()
            || !self
                .symbolics
                .iter()
                .zip(b.symbolics.iter())
                .all(|((a_mo, a_arr), (b_mo, b_arr))| a_mo.id() == b_mo.id() && a_arr == b_arr)
        {
            return false;
        }

        if self.stack.len() != b.stack.len()
            || !self.stack.iter().zip(b.stack.iter()).all(|(x, y)| x.same_shape(y))
        {
            return false;
        }

        let a_constraints = self.constraints.as_set();
        let b_constraints = b.constraints.as_set();
        let common: BTreeSet<Expr> = a_constraints.intersection(b_constraints).cloned().collect();
        let a_suffix: Vec<Expr> = a_constraints.difference(&common).cloned().collect();
        let b_suffix: Vec<Expr> = b_constraints.difference(&common).cloned().collect();

        // Objects created since the fork must have been freed again, and no pre-existing object
        // may have been freed on only one side; otherwise addresses would resolve differently in
        // the merged state.
        if !self.address_space.same_key_set(&b.address_space) {
            debug!("mappings differ, merge refused");
            return false;
        }
        let mut mutated = Vec::new();
        for ((a_mo, a_os), (_, b_os)) in self.address_space.iter().zip(b.address_space.iter()) {
            if Arc::ptr_eq(a_os, b_os) {
                continue;
            }
            if a_os.read_only || !a_os.is_accessible() || !b_os.is_accessible() {
                debug!(object = %a_mo.id(), "mutated object not mergeable");
                return false;
            }
            mutated.push(a_mo.id());
        }

        let in_a = a_suffix.iter().fold(Expr::true_bool(), |acc, c| Expr::and(acc, c.clone()));
        let in_b = b_suffix.iter().fold(Expr::true_bool(), |acc, c| Expr::and(acc, c.clone()));

        for (a_frame, b_frame) in self.stack.iter_mut().zip(b.stack.iter()) {
            for (a_local, b_local) in a_frame.locals.iter_mut().zip(b_frame.locals.iter()) {
                // a register written on only one side is unusable after the join
                *a_local = match (a_local.take(), b_local) {
                    (Some(a_val), Some(b_val)) => {
                        Some(Expr::select(in_a.clone(), a_val, b_val.clone()))
                    },
                    _ => None,
                };
            }
        }

        for id in mutated {
            let b_os = b.address_space.find_object(id).expect("key sets match").clone();
            let wos = self.address_space.get_writeable(id).expect("key sets match");
            for offset in 0..b_os.size() {
                let a_byte = wos.read8(offset, false).expect("checked accessible");
                let b_byte = b_os.read8(offset, false).expect("checked accessible");
                wos.write8(offset, Expr::select(in_a.clone(), a_byte, b_byte));
            }
        }

        let mut constraints = ConstraintSet::new();
        for c in common {
            constraints.add(c);
        }
        constraints.add(Expr::or(in_a, in_b));
        self.constraints = constraints;

        debug!(merged = %self.id, "merge complete");
        true
    }
}
