use std::io::BufReader;

use pretty_assertions::assert_eq;
use symbex_core::expr::{Expr, WIDTH_32, WIDTH_PTR};

use crate::{
    test_utils::{bind_bytes, fresh_state, module_with_intrinsics, read32},
    trace::{load_call_path, write_call_path},
};

#[test]
fn written_call_paths_load_back() {
    let (_module, main) = module_with_intrinsics();
    let mut state = fresh_state(&main);
    let mo = bind_bytes(&mut state.address_space, 0x1000, &[0; 4]);
    let array = state.make_symbolic_object(mo.id(), "pkt").unwrap();
    let predicate = Expr::ult(read32(&array), Expr::constant(64, WIDTH_32));
    state.add_constraint(predicate.clone());

    state.trace_arg_value(Expr::constant(5, WIDTH_32), "len");
    state.trace_extra_ptr(0x1000, WIDTH_32, "pkt_data", "struct pkt", "obj", true, true).unwrap();
    state.trace_function_return(Some(Expr::constant(0, WIDTH_32))).unwrap();

    let mut bytes = Vec::new();
    write_call_path(&state, &mut bytes).unwrap();
    let text = String::from_utf8(bytes.clone()).unwrap();
    assert!(text.starts_with(";;-- kQuery --\n"));
    assert!(text.contains(";;-- Calls --"));
    assert!(text.contains(";;-- Constraints --"));

    let summary = load_call_path(BufReader::new(bytes.as_slice())).unwrap();
    assert_eq!(summary.arrays, vec![("pkt".to_string(), 4)]);
    assert_eq!(summary.calls.len(), 1);
    let call = &summary.calls[0];
    assert_eq!(call.function, "main");
    assert!(call.text.contains("5:w32"));

    // the two kQuery values paired onto the extra line are the in/out observations
    let (in_val, out_val) = &call.extra_vars["pkt_data"];
    let expected = state.read_memory_chunk(0x1000, WIDTH_32, true).unwrap().to_string();
    assert_eq!(in_val, &expected);
    assert_eq!(out_val, &expected);
    assert_eq!(summary.initial_extra_vars["pkt_data"], expected);

    assert_eq!(summary.constraints, vec![predicate.to_string()]);
}

#[test]
fn multiline_calls_are_reassembled() {
    let text = "\
;;-- kQuery --
array x[4] : w32 -> w8 = symbolic
(query [] false [])
;;-- Calls --
helper((Concat w32 (Read w8 1 x)
       (Read w8 0 x)))
consume(0:w64)
;;-- Constraints --
";
    let summary = load_call_path(BufReader::new(text.as_bytes())).unwrap();
    assert_eq!(summary.calls.len(), 2);
    assert_eq!(summary.calls[0].function, "helper");
    assert!(summary.calls[0].text.contains("Read w8 0 x"));
    assert_eq!(summary.calls[1].function, "consume");
}

#[test]
fn extra_lines_consume_value_pairs_in_order() {
    let text = "\
;;-- kQuery --
(query [] false [1:w32 2:w32 3:w32 4:w32])
;;-- Calls --
first()
extra : a & obj
second()
extra : b & obj
;;-- Constraints --
";
    let summary = load_call_path(BufReader::new(text.as_bytes())).unwrap();
    assert_eq!(
        summary.calls[0].extra_vars["a"],
        ("1:w32".to_string(), "2:w32".to_string())
    );
    assert_eq!(
        summary.calls[1].extra_vars["b"],
        ("3:w32".to_string(), "4:w32".to_string())
    );
    assert_eq!(summary.initial_extra_vars["a"], "1:w32");
}

#[test]
fn truncated_files_are_rejected() {
    let text = ";;-- kQuery --\n(query [] false [])\n";
    assert!(load_call_path(BufReader::new(text.as_bytes())).is_err());

    let text = ";;-- kQuery --\n(query [] false [])\n;;-- Calls --\nextra : a & obj\n";
    assert!(load_call_path(BufReader::new(text.as_bytes())).is_err());
}

#[test]
fn symbolic_ret_values_print_balanced() {
    let (_module, main) = module_with_intrinsics();
    let mut state = fresh_state(&main);
    let mo = bind_bytes(&mut state.address_space, 0x1000, &[0; 4]);
    let array = state.make_symbolic_object(mo.id(), "r").unwrap();
    state.trace_ret();
    state.trace_function_return(Some(read32(&array))).unwrap();
    state.trace_ret();
    state.trace_arg_value(Expr::constant(0x1000, WIDTH_PTR), "p");
    state.trace_function_return(None).unwrap();

    let mut bytes = Vec::new();
    write_call_path(&state, &mut bytes).unwrap();
    let summary = load_call_path(BufReader::new(bytes.as_slice())).unwrap();
    assert_eq!(summary.calls.len(), 2);
}
