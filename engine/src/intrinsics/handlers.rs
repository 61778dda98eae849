//! Handler bodies for every intrinsic kind.

use std::sync::atomic::{AtomicU32, Ordering};

use symbex_core::expr::{Array, Expr, WIDTH_32, WIDTH_PTR, Width};
use tracing::{debug, info, warn};

use super::{IntrinsicKind, read_string_at, warning_once};
use crate::{
    errors::{StateTermination, TerminationError},
    host::Host,
    module::CallSite,
    options::EngineOptions,
    state::{ExecutionState, MergeGroup},
    trace::Direction,
    unwind::UnwindingInformation,
};

pub(super) fn dispatch(
    kind: IntrinsicKind,
    state: &mut ExecutionState,
    site: &CallSite,
    args: &[Expr],
    host: &mut dyn Host,
    options: &EngineOptions,
) -> Result<(), StateTermination> {
    use IntrinsicKind::*;
    match kind {
        Abort => {
            expect_args(args, 0, "abort")?;
            Err(TerminationError::assert_fail("abort failure").into())
        },
        Exit => Err(StateTermination::Exit),
        SilentExit => Err(StateTermination::SilentExit),
        ReportError => {
            expect_args(args, 4, "report_error")?;
            let file = read_string_at(state, &args[0])?;
            let line = constant_or_user(&args[1], "report_error line must be concrete")?;
            let message = read_string_at(state, &args[2])?;
            let suffix = read_string_at(state, &args[3])?;
            Err(TerminationError::ReportError { message, suffix, file, line }.into())
        },
        AssertFail | Assert => {
            let message = read_string_at(state, &args[0])?;
            Err(TerminationError::assert_fail(format!("ASSERTION FAIL: {message}")).into())
        },

        Malloc | New | NewArray => {
            expect_args(args, 1, "malloc")?;
            host.allocate(state, &args[0], false, None, site)?;
            Ok(())
        },
        Calloc => {
            expect_args(args, 2, "calloc")?;
            let size = Expr::mul(args[0].clone(), args[1].clone());
            host.allocate(state, &size, true, None, site)?;
            Ok(())
        },
        Realloc => {
            expect_args(args, 2, "realloc")?;
            host.realloc(state, &args[0], &args[1], site)?;
            Ok(())
        },
        Memalign => {
            if args.len() != 2 {
                return Err(TerminationError::user(
                    "incorrect number of arguments to memalign(size_t alignment, size_t size)",
                )
                .into());
            }
            let (low, high) = host.solver().get_range(&state.constraints, &args[0])?;
            let alignment = low.as_constant().ok_or_else(|| {
                TerminationError::user("could not determine size of symbolic alignment")
            })?;
            if low != high {
                warning_once(None, "symbolic alignment for memalign, choosing smallest alignment");
            }
            host.allocate(state, &args[1], false, Some(alignment), site)?;
            Ok(())
        },
        Free | Delete | DeleteArray => {
            expect_args(args, 1, "free")?;
            host.free(state, &args[0])?;
            Ok(())
        },
        DefineFixedObject => {
            expect_args(args, 2, "define_fixed_object")?;
            let address =
                constant_or_user(&args[0], "expect constant address argument to define_fixed_object")?;
            let size =
                constant_or_user(&args[1], "expect constant size argument to define_fixed_object")?;
            host.allocate_fixed(state, address, size)?;
            Ok(())
        },

        Assume => {
            expect_args(args, 1, "assume")?;
            let condition = Expr::as_bool(args[0].clone());
            let provably_false =
                host.solver().must_be_false(&state.constraints, &condition)?;
            if provably_false {
                if options.silent_assume {
                    Err(StateTermination::SilentExit)
                } else {
                    Err(TerminationError::user("invalid assume call (provably false)").into())
                }
            } else {
                state.add_constraint(condition);
                Ok(())
            }
        },
        CheckMemoryAccess => {
            expect_args(args, 2, "check_memory_access")?;
            let (Some(address), Some(size)) = (args[0].as_constant(), args[1].as_constant())
            else {
                return Err(
                    TerminationError::user("check_memory_access requires constant args").into()
                );
            };
            let Some((object, _)) = state.address_space.resolve_one(address) else {
                return Err(TerminationError::ptr(
                    "check_memory_access: memory error",
                    Some(address),
                )
                .into());
            };
            let end = object.address + u64::from(object.size);
            if address.checked_add(size).is_none_or(|access_end| access_end > end) {
                return Err(TerminationError::ptr(
                    "check_memory_access: memory error",
                    Some(address),
                )
                .into());
            }
            Ok(())
        },
        GetValue => {
            expect_args(args, 1, "get_value")?;
            let value = if args[0].is_constant() {
                args[0].clone()
            } else {
                host.solver().get_value(&state.constraints, &args[0])?
            };
            bind_result(state, site, value);
            Ok(())
        },
        GetObjSize => {
            expect_args(args, 1, "get_obj_size")?;
            let address = constant_or_user(&args[0], "get_obj_size requires a concrete pointer")?;
            let Some((object, _)) = state.address_space.resolve_one(address) else {
                return Err(TerminationError::ptr("get_obj_size: memory error", Some(address)).into());
            };
            let size = u64::from(object.size);
            bind_result(state, site, Expr::constant(size, site.ret_width));
            Ok(())
        },
        GetErrno => {
            expect_args(args, 0, "get_errno")?;
            let address = host
                .errno_address(state)
                .ok_or_else(|| TerminationError::user("could not resolve address for errno"))?;
            let value = state.read_memory_chunk(address, WIDTH_32, false)?;
            bind_result(state, site, value);
            Ok(())
        },
        ErrnoLocation => {
            expect_args(args, 0, "errno_location")?;
            let address = host
                .errno_address(state)
                .ok_or_else(|| TerminationError::user("could not resolve address for errno"))?;
            bind_result(state, site, Expr::constant(address, site.ret_width));
            Ok(())
        },

        InterceptReads => {
            expect_args(args, 2, "intercept_reads")?;
            let address =
                constant_or_unhandled(&args[0], "symbolic address for intercept_reads")?;
            let reader = read_string_at(state, &args[1])?;
            state.add_reads_intercept(address, reader);
            Ok(())
        },
        InterceptWrites => {
            expect_args(args, 2, "intercept_writes")?;
            let address =
                constant_or_unhandled(&args[0], "symbolic address for intercept_writes")?;
            let writer = read_string_at(state, &args[1])?;
            state.add_writes_intercept(address, writer);
            Ok(())
        },

        IsSymbolic => {
            expect_args(args, 1, "is_symbolic")?;
            let value = u64::from(!args[0].is_constant());
            bind_result(state, site, Expr::constant(value, WIDTH_32));
            Ok(())
        },
        IsReplay => {
            bind_result(state, site, Expr::constant(0, WIDTH_32));
            Ok(())
        },

        MakeSymbolic => {
            if args.len() != 3 {
                return Err(TerminationError::user(
                    "incorrect number of arguments to make_symbolic(void*, size_t, char*)",
                )
                .into());
            }
            let mut name = if args[2].as_constant() == Some(0) {
                String::new()
            } else {
                read_string_at(state, &args[2])?
            };
            if name.is_empty() {
                name = String::from("unnamed");
                warn!("make_symbolic: renamed empty name to \"unnamed\"");
            }
            let address =
                constant_or_user(&args[0], "make_symbolic requires a concrete pointer")?;
            let Some((object, os)) = state.address_space.resolve_one(address) else {
                return Err(TerminationError::ptr("make_symbolic: memory error", Some(address)).into());
            };
            if object.size == 0 || args[1].as_constant() == Some(0) {
                return Err(
                    TerminationError::user("cannot make a size-zero object symbolic").into()
                );
            }
            if os.read_only {
                return Err(
                    TerminationError::user("cannot make readonly object symbolic").into()
                );
            }
            if !os.is_accessible() {
                return Err(TerminationError::inaccessible(format!(
                    "cannot make inaccessible object symbolic; the object was rendered \
                     inaccessible due to: {}",
                    os.inaccessible_message()
                ))
                .into());
            }
            let id = object.id();
            let declared = Expr::eq(
                Expr::zext(args[1].clone(), WIDTH_PTR),
                Expr::constant(u64::from(object.size), WIDTH_PTR),
            );
            if !host.solver().must_be_true(&state.constraints, &declared)? {
                return Err(TerminationError::user("wrong size given to make_symbolic").into());
            }
            state.make_symbolic_object(id, &name)?;
            Ok(())
        },
        MarkGlobal => {
            expect_args(args, 1, "mark_global")?;
            let address = constant_or_user(&args[0], "mark_global requires a concrete pointer")?;
            let Some((object, _)) = state.address_space.resolve_one(address) else {
                return Err(TerminationError::ptr("mark_global: memory error", Some(address)).into());
            };
            if object.is_local {
                return Err(
                    TerminationError::exec("cannot mark a stack allocation global").into()
                );
            }
            object.mark_global();
            Ok(())
        },

        OpenMerge => {
            if !options.use_merge {
                warning_once(None, "open_merge ignored, merging is disabled");
                return Ok(());
            }
            state.open_merge_stack.push(MergeGroup::new_ref());
            debug!(state = %state.id(), "open merge");
            Ok(())
        },
        CloseMerge => {
            if !options.use_merge {
                warning_once(None, "close_merge ignored, merging is disabled");
                return Ok(());
            }
            debug!(state = %state.id(), "close merge");
            match state.open_merge_stack.pop() {
                Some(group) => {
                    let id = state.id();
                    group.borrow_mut().close(id);
                },
                None => {
                    warn!(state = %state.id(), "ran into a close_merge without a preceding open_merge");
                },
            }
            Ok(())
        },

        PreferCex | PosixPreferCex => {
            if kind == IntrinsicKind::PosixPreferCex && !options.readable_posix {
                return Ok(());
            }
            expect_args(args, 2, "prefer_cex")?;
            let address = constant_or_user(&args[0], "prefer_cex requires a concrete pointer")?;
            let Some((object, _)) = state.address_space.resolve_one(address) else {
                return Err(TerminationError::user(
                    "prefer_cex target must resolve to precisely one object",
                )
                .into());
            };
            let condition = Expr::as_bool(args[1].clone());
            let object = object.clone();
            host.prefer_cex(&object, condition);
            Ok(())
        },

        PrintExpr => {
            expect_args(args, 2, "print_expr")?;
            let message = read_string_at(state, &args[0])?;
            info!("{message}:{}", args[1]);
            Ok(())
        },
        PrintRange => {
            expect_args(args, 2, "print_range")?;
            let message = read_string_at(state, &args[0])?;
            if args[1].is_constant() {
                info!("{message}:{}", args[1]);
                return Ok(());
            }
            let value = host.solver().get_value(&state.constraints, &args[1])?;
            let unique = host
                .solver()
                .must_be_true(&state.constraints, &Expr::eq(args[1].clone(), value.clone()))?;
            if unique {
                info!("{message}:{} == {value}", args[1]);
            } else {
                let (low, high) = host.solver().get_range(&state.constraints, &args[1])?;
                info!("{message}:{} ~= {value} (in [{low}, {high}])", args[1]);
            }
            Ok(())
        },
        SetForking => {
            expect_args(args, 1, "set_forking")?;
            let enable = constant_or_user(&args[0], "set_forking requires a constant arg")?;
            state.fork_disabled = enable == 0;
            Ok(())
        },
        StackTrace => {
            let _ = state.dump_stack(&mut std::io::stdout().lock());
            Ok(())
        },
        Warning => {
            expect_args(args, 1, "warning")?;
            let message = read_string_at(state, &args[0])?;
            warn!("{}: {message}", state.current_function().name());
            Ok(())
        },
        WarningOnce => {
            expect_args(args, 1, "warning_once")?;
            let message = read_string_at(state, &args[0])?;
            warning_once(None, &format!("{}: {message}", state.current_function().name()));
            Ok(())
        },

        AliasFunction => {
            expect_args(args, 2, "alias_function")?;
            let old_fn = read_string_at(state, &args[0])?;
            let new_fn = read_string_at(state, &args[1])?;
            // aliasing a function to itself undoes the alias
            if old_fn == new_fn {
                state.remove_fn_alias(&old_fn);
            } else {
                state.add_fn_alias(&old_fn, &new_fn);
            }
            Ok(())
        },
        AliasFunctionRegex => {
            expect_args(args, 2, "alias_function_regex")?;
            let fn_regex = read_string_at(state, &args[0])?;
            let new_fn = read_string_at(state, &args[1])?;
            state
                .add_fn_regex_alias(&fn_regex, &new_fn)
                .map_err(|e| TerminationError::user(format!("invalid alias regex: {e}")))?;
            Ok(())
        },
        AliasUndo => {
            expect_args(args, 1, "alias_undo")?;
            let alias = read_string_at(state, &args[0])?;
            state.remove_fn_alias(&alias);
            Ok(())
        },

        Range => {
            expect_args(args, 3, "range")?;
            let begin = constant_or_user(&args[0], "range requires constant bounds")?;
            let end = constant_or_user(&args[1], "range requires constant bounds")?;
            let name = read_string_at(state, &args[2])?;
            let (begin_s, end_s) = (begin as u32 as i32, end as u32 as i32);
            if begin_s >= end_s {
                return Err(TerminationError::user("invalid range").into());
            }
            if begin_s + 1 == end_s {
                bind_result(state, site, Expr::constant(begin, WIDTH_32));
                return Ok(());
            }
            let value = fresh_symbolic(state, &name, WIDTH_32);
            let begin_e = Expr::constant(begin, WIDTH_32);
            let end_e = Expr::constant(end, WIDTH_32);
            state.add_constraint(Expr::is_zero(Expr::slt(value.clone(), begin_e)));
            state.add_constraint(Expr::slt(value.clone(), end_e));
            bind_result(state, site, value);
            Ok(())
        },
        Int => {
            expect_args(args, 1, "int")?;
            let name = read_string_at(state, &args[0])?;
            let value = fresh_symbolic(state, &name, WIDTH_32);
            bind_result(state, site, value);
            Ok(())
        },
        Choose => {
            expect_args(args, 1, "choose")?;
            let value = fresh_symbolic(state, "choose", args[0].width());
            state.add_constraint(Expr::ult(value.clone(), args[0].clone()));
            bind_result(state, site, value);
            Ok(())
        },

        EhUnwindRaiseException => {
            expect_args(args, 1, "eh_Unwind_RaiseException_impl")?;
            if !args[0].is_constant() {
                return Err(TerminationError::unhandled(
                    "internal error: symbolic exception pointer",
                )
                .into());
            }
            if matches!(
                state.unwinding_information,
                Some(UnwindingInformation::SearchPhase { .. })
            ) {
                return Err(TerminationError::exec(
                    "unwinding restarted during an ongoing search phase",
                )
                .into());
            }
            let top = state.stack.len() - 1;
            state.unwinding_information =
                Some(UnwindingInformation::search(args[0].clone(), top));
            host.unwind_to_next_landing_pad(state)?;
            Ok(())
        },
        EhTypeid => {
            expect_args(args, 1, "eh_typeid_for")?;
            let id = host.eh_typeid_for(&args[0])?;
            bind_result(state, site, id);
            Ok(())
        },

        TraceParam => {
            let name = read_string_at(state, &args[1])?;
            state.trace_arg_value(args[0].clone(), &name);
            Ok(())
        },
        TraceVal => {
            let name = read_string_at(state, &args[1])?;
            let prefix = read_string_at(state, &args[2])?;
            state.trace_extra_value(args[0].clone(), &name, &prefix);
            Ok(())
        },
        TraceParamPtr => {
            let width = width_arg(&args[1])?;
            let name = read_string_at(state, &args[2])?;
            state.trace_arg_ptr(args[0].clone(), width, &name, "", true, true)?;
            Ok(())
        },
        TraceParamPtrDirected => {
            let width = width_arg(&args[1])?;
            let name = read_string_at(state, &args[2])?;
            let direction = direction_arg(&args[3])?;
            state.trace_arg_ptr(
                args[0].clone(),
                width,
                &name,
                "",
                direction.traces_in(),
                direction.traces_out(),
            )?;
            Ok(())
        },
        TraceParamTaggedPtr => {
            let width = width_arg(&args[1])?;
            let name = read_string_at(state, &args[2])?;
            let ty = read_string_at(state, &args[3])?;
            let direction = direction_arg(&args[4])?;
            state.trace_arg_ptr(
                args[0].clone(),
                width,
                &name,
                &ty,
                direction.traces_in(),
                direction.traces_out(),
            )?;
            Ok(())
        },
        TraceParamJustPtr => {
            let width = width_arg(&args[1])?;
            let name = read_string_at(state, &args[2])?;
            state.trace_arg_ptr(args[0].clone(), width, &name, "", false, false)?;
            Ok(())
        },
        TraceParamFPtr => {
            let name = read_string_at(state, &args[1])?;
            let address =
                constant_or_unhandled(&args[0], "symbolic traced function pointer")?;
            let function = host.function_at(address).ok_or_else(|| {
                TerminationError::unhandled("traced function pointer does not name a function")
            })?;
            state.trace_arg_fun_ptr(args[0].clone(), &name, function);
            Ok(())
        },
        TraceRet => {
            state.trace_ret();
            Ok(())
        },
        TraceRetPtr => {
            let width = width_arg(&args[0])?;
            state.trace_ret_ptr(width, true);
            Ok(())
        },
        TraceRetJustPtr => {
            let width = width_arg(&args[0])?;
            state.trace_ret_ptr(width, false);
            Ok(())
        },
        TraceParamPtrField => {
            let offset = offset_arg(&args[1])?;
            let width = width_arg(&args[2])?;
            let name = read_string_at(state, &args[3])?;
            state.trace_arg_ptr_field(&args[0], offset, width, &name, true, true)?;
            Ok(())
        },
        TraceParamPtrFieldDirected => {
            let offset = offset_arg(&args[1])?;
            let width = width_arg(&args[2])?;
            let name = read_string_at(state, &args[3])?;
            let direction = direction_arg(&args[4])?;
            state.trace_arg_ptr_field(
                &args[0],
                offset,
                width,
                &name,
                direction.traces_in(),
                direction.traces_out(),
            )?;
            Ok(())
        },
        TraceParamPtrFieldJustPtr => {
            let offset = offset_arg(&args[1])?;
            let width = width_arg(&args[2])?;
            let name = read_string_at(state, &args[3])?;
            state.trace_arg_ptr_field(&args[0], offset, width, &name, false, false)?;
            Ok(())
        },
        TraceRetPtrField => {
            let offset = offset_arg(&args[0])?;
            let width = width_arg(&args[1])?;
            let name = read_string_at(state, &args[2])?;
            state.trace_ret_ptr_field(offset, width, &name, true)?;
            Ok(())
        },
        TraceRetPtrFieldJustPtr => {
            let offset = offset_arg(&args[0])?;
            let width = width_arg(&args[1])?;
            let name = read_string_at(state, &args[2])?;
            state.trace_ret_ptr_field(offset, width, &name, false)?;
            Ok(())
        },
        TraceParamPtrNestedField => {
            let base_offset = offset_arg(&args[1])?;
            let offset = offset_arg(&args[2])?;
            let width = width_arg(&args[3])?;
            let name = read_string_at(state, &args[4])?;
            state.trace_arg_ptr_nested_field(
                &args[0],
                base_offset,
                offset,
                width,
                &name,
                true,
                true,
            )?;
            Ok(())
        },
        TraceParamPtrNestedFieldDirected => {
            let base_offset = offset_arg(&args[1])?;
            let offset = offset_arg(&args[2])?;
            let width = width_arg(&args[3])?;
            let name = read_string_at(state, &args[4])?;
            let direction = direction_arg(&args[5])?;
            state.trace_arg_ptr_nested_field(
                &args[0],
                base_offset,
                offset,
                width,
                &name,
                direction.traces_in(),
                direction.traces_out(),
            )?;
            Ok(())
        },
        TraceRetPtrNestedField => {
            let base_offset = offset_arg(&args[0])?;
            let offset = offset_arg(&args[1])?;
            let width = width_arg(&args[2])?;
            let name = read_string_at(state, &args[3])?;
            state.trace_ret_ptr_nested_field(base_offset, offset, width, &name)?;
            Ok(())
        },
        TraceExtraPtr => {
            let ptr = constant_or_unhandled(&args[0], "symbolic extra pointer")?;
            let width = width_arg(&args[1])?;
            let name = read_string_at(state, &args[2])?;
            let ty = read_string_at(state, &args[3])?;
            let prefix = read_string_at(state, &args[4])?;
            let direction = direction_arg(&args[5])?;
            state.trace_extra_ptr(
                ptr,
                width,
                &name,
                &ty,
                &prefix,
                direction.traces_in(),
                direction.traces_out(),
            )?;
            Ok(())
        },
        TraceExtraPtrField => {
            let ptr = constant_or_unhandled(&args[0], "symbolic extra pointer")?;
            let offset = offset_arg(&args[1])?;
            let width = width_arg(&args[2])?;
            let name = read_string_at(state, &args[3])?;
            let direction = direction_arg(&args[4])?;
            state.trace_extra_ptr_field(
                ptr,
                offset,
                width,
                &name,
                direction.traces_in(),
                direction.traces_out(),
            )?;
            Ok(())
        },
        TraceExtraPtrFieldJustPtr => {
            let ptr = constant_or_unhandled(&args[0], "symbolic extra pointer")?;
            let offset = offset_arg(&args[1])?;
            let width = width_arg(&args[2])?;
            let name = read_string_at(state, &args[3])?;
            state.trace_extra_ptr_field(ptr, offset, width, &name, false, false)?;
            Ok(())
        },
        TraceExtraPtrNestedField => {
            let ptr = constant_or_unhandled(&args[0], "symbolic extra pointer")?;
            let base_offset = offset_arg(&args[1])?;
            let offset = offset_arg(&args[2])?;
            let width = width_arg(&args[3])?;
            let name = read_string_at(state, &args[4])?;
            let direction = direction_arg(&args[5])?;
            state.trace_extra_ptr_nested_field(
                ptr,
                base_offset,
                offset,
                width,
                &name,
                direction.traces_in(),
                direction.traces_out(),
            )?;
            Ok(())
        },
        TraceExtraPtrNestedNestedField => {
            let ptr = constant_or_unhandled(&args[0], "symbolic extra pointer")?;
            let base_base_offset = offset_arg(&args[1])?;
            let base_offset = offset_arg(&args[2])?;
            let offset = offset_arg(&args[3])?;
            let width = width_arg(&args[4])?;
            let name = read_string_at(state, &args[5])?;
            let direction = direction_arg(&args[6])?;
            state.trace_extra_ptr_nested_nested_field(
                ptr,
                base_base_offset,
                base_offset,
                offset,
                width,
                &name,
                direction.traces_in(),
                direction.traces_out(),
            )?;
            Ok(())
        },
        TraceExtraFPtr => {
            let width = width_arg(&args[1])?;
            let name = read_string_at(state, &args[2])?;
            let ty = read_string_at(state, &args[3])?;
            let prefix = read_string_at(state, &args[4])?;
            direction_arg(&args[5])?;
            let address =
                constant_or_unhandled(&args[0], "symbolic traced function pointer")?;
            let function = host.function_at(address).ok_or_else(|| {
                TerminationError::unhandled("traced function pointer does not name a function")
            })?;
            state.trace_extra_fun_ptr(args[0].clone(), width, &name, &ty, &prefix, function)?;
            Ok(())
        },

        InduceInvariants => {
            state.induce_invariants_for_this_loop(site.dest)?;
            Ok(())
        },
        ForbidAccess => {
            expect_args(args, 3, "forbid_access")?;
            let address =
                constant_or_unhandled(&args[0], "symbolic address for forbid_access")?;
            let width = constant_or_unhandled(&args[1], "symbolic width for forbid_access")?;
            let message = read_string_at(state, &args[2])?;
            let Some((object, os)) = state.address_space.resolve_one(address) else {
                return Err(TerminationError::user("the address does not exist").into());
            };
            if u64::from(object.size) != width {
                return Err(TerminationError::user(
                    "the provided size does not match the size of the object",
                )
                .into());
            }
            if os.read_only {
                return Err(TerminationError::user(
                    "the object is readonly, cannot render it inaccessible",
                )
                .into());
            }
            if !os.is_accessible() {
                return Err(TerminationError::user("the object is already inaccessible").into());
            }
            let id = object.id();
            state
                .address_space
                .get_writeable(id)
                .expect("resolved above")
                .forbid_access(message);
            Ok(())
        },
        AllowAccess => {
            expect_args(args, 2, "allow_access")?;
            let address =
                constant_or_unhandled(&args[0], "symbolic address for allow_access")?;
            let width = constant_or_unhandled(&args[1], "symbolic width for allow_access")?;
            let Some((object, os)) = state.address_space.resolve_one(address) else {
                return Err(TerminationError::user("the address does not exist").into());
            };
            if u64::from(object.size) != width {
                return Err(TerminationError::user(
                    "the provided size does not match the size of the object",
                )
                .into());
            }
            if os.is_accessible() {
                return Err(TerminationError::user("the object is already accessible").into());
            }
            let id = object.id();
            let os = state.address_space.allow_access(id).expect("resolved above");
            os.clear_inaccessible_message();
            Ok(())
        },
        DumpConstraints => {
            static DUMP_COUNTER: AtomicU32 = AtomicU32::new(1);
            let n = DUMP_COUNTER.fetch_add(1, Ordering::Relaxed);
            let file_name = format!("constraints{n}.txt");
            match std::fs::File::create(&file_name) {
                Ok(mut file) => {
                    let _ = state.write_constraints(&mut file);
                },
                Err(err) => warn!("error opening file \"{file_name}\": {err}"),
            }
            Ok(())
        },
        PossiblyHavoc => {
            if args.len() != 3 {
                return Err(
                    TerminationError::user("incorrect number of arguments to possibly_havoc")
                        .into(),
                );
            }
            let address =
                constant_or_unhandled(&args[0], "symbolic address for possibly_havoc")?;
            let size = constant_or_unhandled(&args[1], "symbolic width for possibly_havoc")?;
            let name = read_string_at(state, &args[2])?;
            if name.is_empty() {
                return Err(TerminationError::user("empty name for possibly_havoc").into());
            }
            let Some((object, os)) = state.address_space.resolve_one(address) else {
                return Err(TerminationError::ptr("possibly_havoc: memory error", Some(address)).into());
            };
            if os.read_only {
                return Err(TerminationError::user("cannot havoc readonly object").into());
            }
            if u64::from(object.size) != size {
                return Err(TerminationError::user("wrong size given to possibly_havoc").into());
            }
            let id = object.id();
            state.add_havoc_info(id, &name)?;
            Ok(())
        },
        MapSymbolNames => {
            if args.len() != 4 {
                return Err(
                    TerminationError::user("incorrect number of arguments to map_symbol_names")
                        .into(),
                );
            }
            let symbol_name = read_string_at(state, &args[0])?;
            let occurrence =
                constant_or_user(&args[1], "map_symbol_names occurrence must be concrete")? as i32;
            let address =
                constant_or_unhandled(&args[2], "symbolic key pointer for map_symbol_names")?;
            let width = width_arg(&args[3])?;
            let key = state.read_memory_chunk(address, width, true)?;
            state
                .reused_symbols
                .insert(symbol_name, std::iter::once((occurrence, key)).collect());
            Ok(())
        },
        AddBpfCall => {
            state.bpf_calls += 1;
            Ok(())
        },

        AddOverflow => Err(TerminationError::Overflow { operation: "addition" }.into()),
        SubOverflow => Err(TerminationError::Overflow { operation: "subtraction" }.into()),
        MulOverflow => Err(TerminationError::Overflow { operation: "multiplication" }.into()),
        DivRemOverflow => {
            Err(TerminationError::Overflow { operation: "division or remainder" }.into())
        },
    }
}

// ARGUMENT HELPERS
// ================================================================================================

fn expect_args(args: &[Expr], n: usize, name: &str) -> Result<(), TerminationError> {
    if args.len() == n {
        Ok(())
    } else {
        Err(TerminationError::user(format!("invalid number of arguments to {name}")))
    }
}

fn constant_or_user(expr: &Expr, message: &str) -> Result<u64, TerminationError> {
    expr.as_constant().ok_or_else(|| TerminationError::user(message))
}

fn constant_or_unhandled(expr: &Expr, message: &str) -> Result<u64, TerminationError> {
    expr.as_constant()
        .ok_or_else(|| TerminationError::unhandled(format!("{message} is not supported")))
}

/// Width argument in bytes, converted to bits.
fn width_arg(expr: &Expr) -> Result<Width, TerminationError> {
    let bytes = expr
        .as_constant()
        .ok_or_else(|| TerminationError::user("width must be a static constant"))?;
    Ok((bytes as Width) * 8)
}

fn offset_arg(expr: &Expr) -> Result<i64, TerminationError> {
    let offset = expr
        .as_constant()
        .ok_or_else(|| TerminationError::user("field offset must be a static constant"))?;
    Ok(offset as i64)
}

fn direction_arg(expr: &Expr) -> Result<Direction, TerminationError> {
    let flag = expr
        .as_constant()
        .ok_or_else(|| TerminationError::user("direction must be a static constant"))?;
    Direction::from_flag(flag)
        .ok_or_else(|| TerminationError::user("unrecognized tracing direction"))
}

fn bind_result(state: &mut ExecutionState, site: &CallSite, value: Expr) {
    if let Some(dest) = site.dest {
        state.bind_local(dest, value);
    }
}

/// A fresh unconstrained symbolic value of `width` bits, backed by a new array named after
/// `base`.
fn fresh_symbolic(state: &mut ExecutionState, base: &str, width: Width) -> Expr {
    debug_assert!(width % 8 == 0);
    let name = state.unique_array_name(base);
    let array = Array::new(name, width / 8);
    let mut value = Expr::read8(&array, 0);
    for i in 1..width / 8 {
        value = Expr::concat(Expr::read8(&array, i), value);
    }
    value
}
