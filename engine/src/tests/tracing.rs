use pretty_assertions::assert_eq;
use symbex_core::expr::{Expr, WIDTH_32, WIDTH_PTR, symbols_of};

use crate::{
    module::LoopInfo,
    test_utils::{bind_bytes, byte, fresh_state, module_with_intrinsics, read32},
    trace::canonical_fn_pointer_id,
};

/// A pointer argument traced in both directions: the entry value is captured immediately, the
/// return value after the callee's write, and both contexts pull in every predicate over the
/// pointee's symbols.
#[test]
fn pointer_argument_roundtrip_capture() {
    let (_module, main) = module_with_intrinsics();
    let mut state = fresh_state(&main);
    let mo = bind_bytes(&mut state.address_space, 0x1000, &[0; 4]);
    let array = state.make_symbolic_object(mo.id(), "buf").unwrap();
    let predicate = Expr::ult(read32(&array), Expr::constant(100, WIDTH_32));
    state.add_constraint(predicate.clone());
    let unrelated = {
        let other = bind_bytes(&mut state.address_space, 0x4000, &[0; 4]);
        let other_array = state.make_symbolic_object(other.id(), "other").unwrap();
        Expr::ult(read32(&other_array), Expr::constant(5, WIDTH_32))
    };
    state.add_constraint(unrelated.clone());

    let expected_in = state.read_memory_chunk(0x1000, WIDTH_32, true).unwrap();
    state
        .trace_arg_ptr(Expr::constant(0x1000, WIDTH_PTR), WIDTH_32, "buf", "", true, true)
        .unwrap();
    {
        let info = state.call_path.last().unwrap();
        assert_eq!(info.args[0].pointee.in_val.as_ref(), Some(&expected_in));
        assert!(info.call_context.contains(&predicate));
        assert!(!info.call_context.contains(&unrelated));
    }

    // the callee writes one byte of the pointee before returning
    state.address_space.get_writeable(mo.id()).unwrap().write8(0, byte(7));
    state.trace_function_return(None).unwrap();

    let info = state.call_path.last().unwrap();
    assert!(info.returned);
    let out_val = info.args[0].pointee.out_val.as_ref().unwrap();
    let expected_out = state.read_memory_chunk(0x1000, WIDTH_32, true).unwrap();
    assert_eq!(out_val, &expected_out);
    assert_eq!(state.read_memory_chunk(0x1000, 8, true).unwrap().as_constant(), Some(7));
    assert!(info.return_context.contains(&predicate));
    assert!(!info.return_context.contains(&unrelated));
}

#[test]
fn in_capture_peeks_through_inaccessibility() {
    let (_module, main) = module_with_intrinsics();
    let mut state = fresh_state(&main);
    let mo = bind_bytes(&mut state.address_space, 0x1000, &[42, 0, 0, 0]);
    state.address_space.get_writeable(mo.id()).unwrap().forbid_access("sealed");

    state
        .trace_arg_ptr(Expr::constant(0x1000, WIDTH_PTR), WIDTH_32, "buf", "", true, false)
        .unwrap();
    let info = state.call_path.last().unwrap();
    assert_eq!(info.args[0].pointee.in_val.as_ref().unwrap().as_constant(), Some(42));
}

#[test]
fn trace_ret_pushes_one_record_per_call() {
    let (_module, main) = module_with_intrinsics();
    let mut state = fresh_state(&main);
    state.trace_ret();
    state.trace_ret();
    assert_eq!(state.call_path.len(), 1);

    state.trace_function_return(Some(Expr::constant(0, WIDTH_32))).unwrap();
    state.trace_ret();
    assert_eq!(state.call_path.len(), 2);
}

#[test]
fn returned_symbols_seed_the_next_call_context() {
    let (_module, main) = module_with_intrinsics();
    let mut state = fresh_state(&main);
    let mo = bind_bytes(&mut state.address_space, 0x1000, &[0; 4]);
    let array = state.make_symbolic_object(mo.id(), "ret").unwrap();
    let result = read32(&array);
    let predicate = Expr::ult(result.clone(), Expr::constant(9, WIDTH_32));
    state.add_constraint(predicate.clone());

    state.trace_ret();
    state.trace_function_return(Some(result)).unwrap();
    assert!(state.call_path.last().unwrap().return_context.contains(&predicate));

    // the next call sees the previous result's symbols as relevant
    state.trace_ret();
    assert_eq!(state.call_path.len(), 2);
    assert!(state.call_path.last().unwrap().call_context.contains(&predicate));
    assert!(state.relevant_symbols.contains(&array));
}

#[test]
fn field_tracing_requires_the_pointer_first() {
    let (_module, main) = module_with_intrinsics();
    let mut state = fresh_state(&main);
    bind_bytes(&mut state.address_space, 0x1000, &[0; 8]);
    let arg = Expr::constant(0x1000, WIDTH_PTR);

    state.trace_ret();
    assert!(state.trace_arg_ptr_field(&arg, 0, WIDTH_32, "f", true, true).is_err());

    state.trace_arg_ptr(arg.clone(), 64, "s", "struct s", true, true).unwrap();
    state.trace_arg_ptr_field(&arg, 0, WIDTH_32, "f", true, true).unwrap();
    // a second field at the same offset conflicts
    assert!(state.trace_arg_ptr_field(&arg, 0, WIDTH_32, "g", true, true).is_err());
    // offsets beyond the pointee are rejected
    assert!(state.trace_arg_ptr_field(&arg, 8, WIDTH_32, "h", true, true).is_err());
    // nested fields need their base field traced
    assert!(
        state.trace_arg_ptr_nested_field(&arg, 4, 0, WIDTH_32, "n", true, true).is_err()
    );
    state.trace_arg_ptr_field(&arg, 4, WIDTH_32, "g", true, true).unwrap();
    state.trace_arg_ptr_nested_field(&arg, 4, 0, 16, "n", true, true).unwrap();

    let info = state.call_path.last().unwrap();
    let pointee = &info.args[0].pointee;
    assert_eq!(pointee.fields.len(), 2);
    assert!(pointee.fields[&4].fields.contains_key(&0));
}

#[test]
fn field_descr_equality_is_an_equivalence_on_identical_trees() {
    let (_module, main) = module_with_intrinsics();
    let mut state = fresh_state(&main);
    bind_bytes(&mut state.address_space, 0x1000, &[1, 2, 3, 4, 5, 6, 7, 8]);
    let arg = Expr::constant(0x1000, WIDTH_PTR);
    state.trace_arg_ptr(arg.clone(), 64, "s", "", true, true).unwrap();
    state.trace_arg_ptr_field(&arg, 0, WIDTH_32, "f", true, true).unwrap();

    let a = state.call_path.last().unwrap().args[0].pointee.clone();
    let b = a.clone();
    assert!(a.eq(&a));
    assert!(a.eq(&b) && b.eq(&a));

    let mut c = b.clone();
    c.fields.get_mut(&0).unwrap().in_val = Some(Expr::constant(9, WIDTH_32));
    assert!(!a.eq(&c));
}

/// `same_invocation` compares callee, entry values, and call context, but deliberately ignores
/// out-values and extra pointers.
#[test]
fn same_invocation_ignores_outputs_and_extra_ptrs() {
    let (_module, main) = module_with_intrinsics();

    let make = |out_byte: u8, with_extra: bool| {
        let mut state = fresh_state(&main);
        let mo = bind_bytes(&mut state.address_space, 0x1000, &[0; 4]);
        state
            .trace_arg_ptr(Expr::constant(0x1000, WIDTH_PTR), WIDTH_32, "buf", "", true, true)
            .unwrap();
        if with_extra {
            state.trace_extra_ptr(0x1000, WIDTH_32, "peek", "", "", true, true).unwrap();
        }
        state.address_space.get_writeable(mo.id()).unwrap().write8(0, byte(out_byte));
        state.trace_function_return(Some(Expr::constant(0, WIDTH_32))).unwrap();
        state.call_path.last().unwrap().clone()
    };

    let a = make(1, false);
    let b = make(2, true);
    assert!(a.same_invocation(&b));
    assert!(!a.eq(&b));

    let c = make(1, false);
    assert!(a.eq(&c));
}

#[test]
fn extra_ptr_records_accessibility_both_ways() {
    let (_module, main) = module_with_intrinsics();
    let mut state = fresh_state(&main);
    let mo = bind_bytes(&mut state.address_space, 0x1000, &[3, 0, 0, 0]);
    state.address_space.get_writeable(mo.id()).unwrap().forbid_access("hidden");

    state.trace_extra_ptr(0x1000, WIDTH_32, "dev", "", "obj", true, true).unwrap();
    {
        let extra = &state.call_path.last().unwrap().extra_ptrs[&0x1000];
        assert!(!extra.accessible_in);
        assert_eq!(extra.pointee.in_val.as_ref().unwrap().as_constant(), Some(3));
    }

    state.address_space.allow_access(mo.id());
    state.trace_function_return(None).unwrap();
    let extra = &state.call_path.last().unwrap().extra_ptrs[&0x1000];
    assert!(extra.accessible_out);
    assert_eq!(extra.pointee.out_val.as_ref().unwrap().as_constant(), Some(3));
}

#[test]
fn recognized_function_pointers_are_canonicalized() {
    assert_eq!(canonical_fn_pointer_id("map_hash", "FlowId_hash"), Some(1));
    assert_eq!(canonical_fn_pointer_id("map_hash", "fw_flow_hash"), Some(1));
    assert_eq!(canonical_fn_pointer_id("map_key_eq", "ether_addr_eq"), Some(2));
    assert_eq!(canonical_fn_pointer_id("map_hash", "mystery_hash"), None);
    assert_eq!(canonical_fn_pointer_id("callback", "FlowId_hash"), None);

    let (mut module, main) = module_with_intrinsics();
    let hash_fn = module.add_function("lb_flow_hash", 2, LoopInfo::empty());
    let mut state = fresh_state(&main);
    state
        .trace_extra_fun_ptr(
            Expr::constant(0xf000_0000, WIDTH_PTR),
            WIDTH_32,
            "map_hash",
            "",
            "",
            hash_fn,
        )
        .unwrap();
    let fptr = &state.call_path.last().unwrap().extra_fptrs[0];
    assert_eq!(fptr.in_val.as_ref().unwrap().as_constant(), Some(3));
    assert_eq!(fptr.in_val, fptr.out_val);

    let unknown = module.add_function("my_hash", 2, LoopInfo::empty());
    let mut state = fresh_state(&main);
    assert!(
        state
            .trace_extra_fun_ptr(
                Expr::constant(0xf000_0010, WIDTH_PTR),
                WIDTH_32,
                "map_hash",
                "",
                "",
                unknown,
            )
            .is_err()
    );
}

#[test]
fn relevant_constraint_closure_is_transitive() {
    let (_module, main) = module_with_intrinsics();
    let mut state = fresh_state(&main);
    let bind_sym = |state: &mut crate::state::ExecutionState, addr: u64, name: &str| {
        let mo = bind_bytes(&mut state.address_space, addr, &[0; 4]);
        state.make_symbolic_object(mo.id(), name).unwrap()
    };
    let a = bind_sym(&mut state, 0x1000, "a");
    let b = bind_sym(&mut state, 0x2000, "b");
    let c = bind_sym(&mut state, 0x3000, "c");
    let d = bind_sym(&mut state, 0x4000, "d");

    let ab = Expr::ult(read32(&a), read32(&b));
    let bc = Expr::eq(read32(&b), read32(&c));
    let dd = Expr::ne(read32(&d), Expr::constant(0, WIDTH_32));
    state.add_constraint(ab.clone());
    state.add_constraint(bc.clone());
    state.add_constraint(dd.clone());

    let seed = symbols_of(&read32(&a));
    let closure = state.relevant_constraints(seed);
    assert_eq!(closure, vec![ab, bc]);
}
