use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::{
    loops::update_diff_mask,
    module::BlockId,
    test_utils::{TestSolver, at_block, bind_bytes, byte, fresh_state, module_with_loop},
};

const TIMEOUT: Duration = Duration::from_secs(1);

/// The full fixpoint scenario: a 4-byte counter mutated by the loop body. The first round marks
/// the mutated byte and restarts with it forgotten; the second round adds nothing and converges.
/// Afterwards the loop-exit path survives while back edges terminate.
#[test]
fn fixpoint_converges_in_two_rounds() {
    let (_module, main, loop_id) = module_with_loop();
    let mut solver = TestSolver::default();
    let mut state = fresh_state(&main);
    let x = bind_bytes(&mut state.address_space, 0x1000, &[10, 0, 0, 0]);
    state.add_havoc_info(x.id(), "x").unwrap();

    // entry -> header: the loop is entered and the header state snapshotted
    at_block(&mut state, BlockId(0));
    let terminate = state
        .update_loop_analysis_for_block_transfer(BlockId(1), BlockId(0), &mut solver, TIMEOUT)
        .unwrap();
    assert!(!terminate);
    assert!(state.execution_state_for_loop_in_process.is_some());

    // the header's induce_invariants call starts the analysis
    at_block(&mut state, BlockId(1));
    state.induce_invariants_for_this_loop(Some(0)).unwrap();
    assert!(state.loop_in_process.is_some());
    assert!(state.execution_state_for_loop_in_process.is_none());
    assert_eq!(
        state.stack.last().unwrap().locals[0].as_ref().unwrap().as_constant(),
        Some(0xffff_ffff)
    );

    // round 1: the body decrements the counter, then takes the back edge
    state.address_space.get_writeable(x.id()).unwrap().write8(0, byte(9));
    let terminate = state
        .update_loop_analysis_for_block_transfer(BlockId(1), BlockId(2), &mut solver, TIMEOUT)
        .unwrap();
    assert!(terminate);

    let round2 = state.terminate_state().unwrap().expect("terminal sibling restarts the round");
    let mut round2 = *round2;
    assert!(round2.loop_in_process.is_some(), "new bytes were found, the analysis repeats");
    assert!(state.loop_in_process.is_none());

    // the mutated byte was forgotten, the rest kept
    let os = round2.address_space.find_object(x.id()).unwrap();
    assert!(os.read8(0, false).unwrap().as_constant().is_none());
    assert_eq!(os.read8(1, false).unwrap().as_constant(), Some(0));
    let havoc = &round2.havocs[&x.id()];
    assert!(havoc.havoced);
    assert!(havoc.value.is_some());
    assert_eq!(havoc.mask.iter_ones().collect::<Vec<_>>(), vec![0]);

    // round 2: the body writes the same (already masked) byte; no new difference appears
    round2.address_space.get_writeable(x.id()).unwrap().write8(0, byte(7));
    let terminate = round2
        .update_loop_analysis_for_block_transfer(BlockId(1), BlockId(2), &mut solver, TIMEOUT)
        .unwrap();
    assert!(terminate);

    let after = round2.terminate_state().unwrap().expect("fixpoint restart state");
    let mut after = *after;
    assert!(after.loop_in_process.is_none(), "the loop restarts in normal execution mode");
    assert!(after.analysed_loops.contains(&loop_id));
    assert_eq!(main.fixpoints().len(), 1);
    assert_eq!(main.fixpoints()[0].loop_id, loop_id);
    assert_eq!(
        main.fixpoints()[0].forget_mask[&x.id()].iter_ones().collect::<Vec<_>>(),
        vec![0]
    );

    // in normal mode, a back edge of the analyzed loop terminates the path...
    let terminate = after
        .update_loop_analysis_for_block_transfer(BlockId(1), BlockId(2), &mut solver, TIMEOUT)
        .unwrap();
    assert!(terminate);
    assert!(after.terminate_state().unwrap().is_none());

    // ...while the exit edge continues to the code after the loop
    let terminate = after
        .update_loop_analysis_for_block_transfer(BlockId(3), BlockId(1), &mut solver, TIMEOUT)
        .unwrap();
    assert!(!terminate);
}

/// A state terminating after a fixpoint reports its havoced locations to the test emitter with
/// the exact forgotten mask.
#[test]
fn havoced_locations_reach_the_test_emitter() {
    use crate::{host::Host, test_utils::TestHost};

    let (_module, main, _loop_id) = module_with_loop();
    let mut solver = TestSolver::default();
    let mut host = TestHost::new();
    let mut state = fresh_state(&main);
    let x = bind_bytes(&mut state.address_space, 0x1000, &[10, 0, 0, 0]);
    state.add_havoc_info(x.id(), "x").unwrap();

    at_block(&mut state, BlockId(0));
    state
        .update_loop_analysis_for_block_transfer(BlockId(1), BlockId(0), &mut solver, TIMEOUT)
        .unwrap();
    at_block(&mut state, BlockId(1));
    state.induce_invariants_for_this_loop(None).unwrap();
    state.address_space.get_writeable(x.id()).unwrap().write8(0, byte(9));
    state
        .update_loop_analysis_for_block_transfer(BlockId(1), BlockId(2), &mut solver, TIMEOUT)
        .unwrap();
    let round2 = *state.terminate_state().unwrap().unwrap();

    host.emit_test_case(&round2);
    let ktest = &host.emitted_tests[0];
    assert_eq!(ktest.havocs.len(), 1);
    assert_eq!(ktest.havocs[0].name, "x");
    assert_eq!(ktest.havocs[0].bytes.len(), 4);
    assert_eq!(ktest.havocs[0].mask.iter_ones().collect::<Vec<_>>(), vec![0]);
}

/// Re-running one more diff round over a converged mask adds no bits.
#[test]
fn converged_mask_is_stable() {
    let (_module, main, _loop_id) = module_with_loop();
    let mut solver = TestSolver::default();
    let mut state = fresh_state(&main);
    let x = bind_bytes(&mut state.address_space, 0x1000, &[10, 0, 0, 0]);
    state.add_havoc_info(x.id(), "x").unwrap();

    let reference = state.clone();
    state.address_space.get_writeable(x.id()).unwrap().write8(0, byte(9));

    let mut mask = crate::loops::StateByteMask::new();
    let updated =
        update_diff_mask(&mut mask, &reference.address_space, &state, &mut solver, TIMEOUT)
            .unwrap();
    assert!(updated);
    let snapshot: Vec<_> = mask[&x.id()].iter_ones().collect();

    let updated =
        update_diff_mask(&mut mask, &reference.address_space, &state, &mut solver, TIMEOUT)
            .unwrap();
    assert!(!updated);
    assert_eq!(mask[&x.id()].iter_ones().collect::<Vec<_>>(), snapshot);
}

/// Mutating an object that was never declared with `possibly_havoc` fails the analysis.
#[test]
fn undeclared_mutation_fails_the_analysis() {
    let (_module, main, _loop_id) = module_with_loop();
    let mut solver = TestSolver::default();
    let mut state = fresh_state(&main);
    let x = bind_bytes(&mut state.address_space, 0x1000, &[10, 0, 0, 0]);

    let reference = state.clone();
    state.address_space.get_writeable(x.id()).unwrap().write8(0, byte(9));

    let mut mask = crate::loops::StateByteMask::new();
    let result =
        update_diff_mask(&mut mask, &reference.address_space, &state, &mut solver, TIMEOUT);
    assert!(result.is_err());
}

/// With `condone_undeclared_havocs` the same mutation is tolerated.
#[test]
fn condoned_undeclared_mutation_is_tolerated() {
    let (_module, main, _loop_id) = module_with_loop();
    let mut solver = TestSolver::default();
    let mut state = fresh_state(&main);
    state.condone_undeclared_havocs = true;
    let x = bind_bytes(&mut state.address_space, 0x1000, &[10, 0, 0, 0]);

    let reference = state.clone();
    state.address_space.get_writeable(x.id()).unwrap().write8(0, byte(9));

    let mut mask = crate::loops::StateByteMask::new();
    let updated =
        update_diff_mask(&mut mask, &reference.address_space, &state, &mut solver, TIMEOUT)
            .unwrap();
    assert!(updated);
}

/// Forgetting temporarily lifts and then restores the inaccessibility of objects sealed with
/// `forbid_access`, keeping the original reason.
#[test]
fn forgetting_preserves_inaccessibility() {
    let (_module, main, _loop_id) = module_with_loop();
    let mut solver = TestSolver::default();
    let mut state = fresh_state(&main);
    let x = bind_bytes(&mut state.address_space, 0x1000, &[10, 0, 0, 0]);
    state.add_havoc_info(x.id(), "x").unwrap();
    state.address_space.get_writeable(x.id()).unwrap().forbid_access("device register");

    at_block(&mut state, BlockId(0));
    state
        .update_loop_analysis_for_block_transfer(BlockId(1), BlockId(0), &mut solver, TIMEOUT)
        .unwrap();
    at_block(&mut state, BlockId(1));
    state.induce_invariants_for_this_loop(None).unwrap();

    state.address_space.get_writeable(x.id()).unwrap().write8(0, byte(9));
    let terminate = state
        .update_loop_analysis_for_block_transfer(BlockId(1), BlockId(2), &mut solver, TIMEOUT)
        .unwrap();
    assert!(terminate);

    let round2 = *state.terminate_state().unwrap().expect("restart state");
    let os = round2.address_space.find_object(x.id()).unwrap();
    assert!(!os.is_accessible());
    assert_eq!(os.inaccessible_message(), "device register");
    assert!(os.read8(0, true).unwrap().as_constant().is_none());
}

/// An object accessible at loop entry but sealed by the body alternates accessibility between
/// rounds, which the analysis rejects.
#[test]
fn accessibility_alternation_is_rejected() {
    let (_module, main, _loop_id) = module_with_loop();
    let mut solver = TestSolver::default();
    let mut state = fresh_state(&main);
    let x = bind_bytes(&mut state.address_space, 0x1000, &[10, 0, 0, 0]);
    state.add_havoc_info(x.id(), "x").unwrap();

    at_block(&mut state, BlockId(0));
    state
        .update_loop_analysis_for_block_transfer(BlockId(1), BlockId(0), &mut solver, TIMEOUT)
        .unwrap();
    at_block(&mut state, BlockId(1));
    state.induce_invariants_for_this_loop(None).unwrap();

    state.address_space.get_writeable(x.id()).unwrap().forbid_access("sealed by the body");
    let result = state.update_loop_analysis_for_block_transfer(
        BlockId(1),
        BlockId(2),
        &mut solver,
        TIMEOUT,
    );
    assert!(result.is_err());
}

/// Exiting a loop without having called `induce_invariants` discards the header snapshot.
#[test]
fn plain_loop_exit_discards_the_snapshot() {
    let (_module, main, _loop_id) = module_with_loop();
    let mut solver = TestSolver::default();
    let mut state = fresh_state(&main);

    at_block(&mut state, BlockId(0));
    state
        .update_loop_analysis_for_block_transfer(BlockId(1), BlockId(0), &mut solver, TIMEOUT)
        .unwrap();
    assert!(state.execution_state_for_loop_in_process.is_some());

    let terminate = state
        .update_loop_analysis_for_block_transfer(BlockId(3), BlockId(1), &mut solver, TIMEOUT)
        .unwrap();
    assert!(!terminate);
    assert!(state.execution_state_for_loop_in_process.is_none());
}

/// `induce_invariants` outside any loop is an internal error; on an analyzed loop it is a no-op.
#[test]
fn induce_invariants_placement_is_checked() {
    let (_module, main, _loop_id) = module_with_loop();
    let mut state = fresh_state(&main);
    at_block(&mut state, BlockId(3));
    assert!(state.induce_invariants_for_this_loop(None).is_err());
}
