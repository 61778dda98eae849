use pretty_assertions::assert_eq;
use symbex_core::expr::{Expr, ExprKind, WIDTH_32};

use crate::{
    test_utils::{bind_bytes, byte, fresh_state, module_with_intrinsics, read32},
    unwind::UnwindingInformation,
};

/// Two siblings diverging on `x < 0` with one mutated byte: the byte becomes a `Select` on the
/// join predicate and the constraints entail the disjunction of both paths.
#[test]
fn merge_multiplexes_memory_and_constraints() {
    let (_module, main) = module_with_intrinsics();
    let mut a = fresh_state(&main);
    let mo = bind_bytes(&mut a.address_space, 0x1000, &[0; 4]);
    let obj = bind_bytes(&mut a.address_space, 0x2000, &[0]);
    let x_array = a.make_symbolic_object(mo.id(), "x").unwrap();
    let x = read32(&x_array);
    let common = Expr::ult(x.clone(), Expr::constant(1000, WIDTH_32));
    a.add_constraint(common.clone());

    let mut b = a.branch();
    let negative = Expr::slt(x.clone(), Expr::constant(0, WIDTH_32));
    let non_negative = Expr::is_zero(negative.clone());
    a.add_constraint(negative.clone());
    b.add_constraint(non_negative.clone());
    a.address_space.get_writeable(obj.id()).unwrap().write8(0, byte(1));
    b.address_space.get_writeable(obj.id()).unwrap().write8(0, byte(2));

    assert!(a.merge(&b));

    let merged = a.address_space.find_object(obj.id()).unwrap().read8(0, false).unwrap();
    match merged.kind() {
        ExprKind::Select { cond, on_true, on_false } => {
            assert_eq!(cond, &negative);
            assert_eq!(on_true.as_constant(), Some(1));
            assert_eq!(on_false.as_constant(), Some(2));
        },
        other => panic!("expected a select over the join predicate, got {other:?}"),
    }
    assert!(a.constraints.contains(&common));
    assert!(a.constraints.contains(&Expr::or(negative, non_negative)));
}

#[test]
fn merge_leaves_one_sided_locals_undefined() {
    let (_module, main) = module_with_intrinsics();
    let mut a = fresh_state(&main);
    let mo = bind_bytes(&mut a.address_space, 0x1000, &[0; 4]);
    let x = read32(&a.make_symbolic_object(mo.id(), "x").unwrap());

    let mut b = a.branch();
    let cond = Expr::slt(x.clone(), Expr::constant(0, WIDTH_32));
    a.add_constraint(cond.clone());
    b.add_constraint(Expr::is_zero(cond));

    a.bind_local(0, Expr::constant(1, WIDTH_32));
    a.bind_local(1, Expr::constant(2, WIDTH_32));
    b.bind_local(0, Expr::constant(3, WIDTH_32));

    assert!(a.merge(&b));
    let frame = a.stack.last().unwrap();
    assert!(matches!(frame.locals[0].as_ref().unwrap().kind(), ExprKind::Select { .. }));
    // register 1 was written on only one side and is unusable after the join
    assert!(frame.locals[1].is_none());
}

#[test]
fn merge_requires_equal_program_counters() {
    let (_module, main) = module_with_intrinsics();
    let mut a = fresh_state(&main);
    let mut b = a.branch();
    b.pc.index += 1;
    assert!(!a.merge(&b));
}

/// One side freed an object the other still holds: the merge is refused and both states remain
/// usable.
#[test]
fn merge_refuses_mismatched_address_spaces() {
    let (_module, main) = module_with_intrinsics();
    let mut a = fresh_state(&main);
    let mo = bind_bytes(&mut a.address_space, 0x1000, &[0; 4]);

    let mut b = a.branch();
    b.address_space.unbind_object(mo.id());

    assert!(!a.merge(&b));
    assert!(a.address_space.find_object(mo.id()).is_some());
    assert!(b.address_space.find_object(mo.id()).is_none());
}

#[test]
fn merge_refuses_mismatched_symbolics() {
    let (_module, main) = module_with_intrinsics();
    let mut a = fresh_state(&main);
    let mo = bind_bytes(&mut a.address_space, 0x1000, &[0; 4]);
    let mut b = a.branch();
    b.make_symbolic_object(mo.id(), "late").unwrap();
    assert!(!a.merge(&b));
}

#[test]
fn merge_refuses_inaccessible_mutated_objects() {
    let (_module, main) = module_with_intrinsics();
    let mut a = fresh_state(&main);
    let mo = bind_bytes(&mut a.address_space, 0x1000, &[0; 4]);

    let mut b = a.branch();
    let wos = b.address_space.get_writeable(mo.id()).unwrap();
    wos.write8(0, byte(1));
    wos.forbid_access("sealed");

    assert!(!a.merge(&b));
}

#[test]
fn merge_refuses_states_with_inflight_unwinding() {
    let (_module, main) = module_with_intrinsics();
    let mut a = fresh_state(&main);
    let mut b = a.branch();
    b.unwinding_information =
        Some(UnwindingInformation::search(Expr::constant(0x7000, 64), 0));
    assert!(!a.merge(&b));
}

#[test]
fn merge_refuses_mismatched_stack_shapes() {
    let (_module, main) = module_with_intrinsics();
    let mut a = fresh_state(&main);
    let mut b = a.branch();
    b.push_frame(Some(b.pc), main.clone());
    b.pc = a.pc;
    assert!(!a.merge(&b));
}
