//! The modeling-intrinsic surface: the static table of known intrinsics, the per-module binding
//! from function identity to intrinsic kind, and the dispatcher the interpreter calls for every
//! external call it cannot resolve to program code.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, OnceLock},
};

use symbex_core::expr::Expr;
use tracing::warn;

use crate::{
    errors::{StateTermination, TerminationError},
    host::Host,
    module::{CallSite, FunctionId, KFunction, Module},
    options::EngineOptions,
    state::ExecutionState,
};

mod handlers;

// INTRINSIC KINDS
// ================================================================================================

/// Everything the engine models instead of executing as program code. Several table names map to
/// one kind (e.g. all `get_value_*` widths).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntrinsicKind {
    Abort,
    Exit,
    SilentExit,
    ReportError,
    AssertFail,
    Assert,
    Malloc,
    Calloc,
    Realloc,
    Memalign,
    Free,
    New,
    NewArray,
    Delete,
    DeleteArray,
    DefineFixedObject,
    Assume,
    CheckMemoryAccess,
    GetValue,
    GetObjSize,
    GetErrno,
    ErrnoLocation,
    InterceptReads,
    InterceptWrites,
    IsSymbolic,
    IsReplay,
    MakeSymbolic,
    MarkGlobal,
    OpenMerge,
    CloseMerge,
    PreferCex,
    PosixPreferCex,
    PrintExpr,
    PrintRange,
    SetForking,
    StackTrace,
    Warning,
    WarningOnce,
    AliasFunction,
    AliasFunctionRegex,
    AliasUndo,
    EhUnwindRaiseException,
    EhTypeid,
    TraceParam,
    TraceParamPtr,
    TraceParamPtrDirected,
    TraceParamTaggedPtr,
    TraceParamJustPtr,
    TraceParamFPtr,
    TraceVal,
    TraceRet,
    TraceRetPtr,
    TraceRetJustPtr,
    TraceParamPtrField,
    TraceParamPtrFieldDirected,
    TraceParamPtrFieldJustPtr,
    TraceRetPtrField,
    TraceRetPtrFieldJustPtr,
    TraceParamPtrNestedField,
    TraceParamPtrNestedFieldDirected,
    TraceRetPtrNestedField,
    TraceExtraPtr,
    TraceExtraPtrField,
    TraceExtraPtrFieldJustPtr,
    TraceExtraPtrNestedField,
    TraceExtraPtrNestedNestedField,
    TraceExtraFPtr,
    InduceInvariants,
    ForbidAccess,
    AllowAccess,
    DumpConstraints,
    PossiblyHavoc,
    MapSymbolNames,
    AddBpfCall,
    Range,
    Int,
    Choose,
    AddOverflow,
    SubOverflow,
    MulOverflow,
    DivRemOverflow,
}

/// One row of the intrinsic table.
#[derive(Clone, Copy, Debug)]
pub struct IntrinsicInfo {
    pub name: &'static str,
    pub kind: IntrinsicKind,
    pub does_not_return: bool,
    pub has_return_value: bool,
    pub do_not_override: bool,
}

const fn add(name: &'static str, kind: IntrinsicKind, has_return_value: bool) -> IntrinsicInfo {
    IntrinsicInfo { name, kind, does_not_return: false, has_return_value, do_not_override: false }
}

const fn add_dnr(name: &'static str, kind: IntrinsicKind) -> IntrinsicInfo {
    IntrinsicInfo { name, kind, does_not_return: true, has_return_value: false, do_not_override: false }
}

use IntrinsicKind::*;

#[rustfmt::skip]
pub static INTRINSIC_TABLE: &[IntrinsicInfo] = &[
    add_dnr("__assert_rtn", AssertFail),
    add_dnr("__assert_fail", AssertFail),
    add_dnr("__assert", AssertFail),
    add_dnr("_assert", Assert),
    add_dnr("abort", Abort),
    add_dnr("_exit", Exit),
    IntrinsicInfo { name: "exit", kind: Exit, does_not_return: true, has_return_value: false, do_not_override: true },
    add_dnr("symbex_abort", Abort),
    add_dnr("symbex_silent_exit", SilentExit),
    add_dnr("symbex_report_error", ReportError),
    add("calloc", Calloc, true),
    add("free", Free, false),
    add("symbex_assume", Assume, false),
    add("symbex_check_memory_access", CheckMemoryAccess, false),
    add("symbex_get_valuef", GetValue, true),
    add("symbex_get_valued", GetValue, true),
    add("symbex_get_valuel", GetValue, true),
    add("symbex_get_valuell", GetValue, true),
    add("symbex_get_value_i32", GetValue, true),
    add("symbex_get_value_i64", GetValue, true),
    add("symbex_get_value_u64", GetValue, true),
    add("symbex_define_fixed_object", DefineFixedObject, false),
    add("symbex_get_obj_size", GetObjSize, true),
    add("symbex_get_errno", GetErrno, true),
    add("__errno_location", ErrnoLocation, true),
    add("__error", ErrnoLocation, true),
    add("symbex_intercept_reads", InterceptReads, false),
    add("symbex_intercept_writes", InterceptWrites, false),
    add("symbex_is_symbolic", IsSymbolic, true),
    add("symbex_is_replay", IsReplay, true),
    add("symbex_make_symbolic", MakeSymbolic, false),
    add("symbex_mark_global", MarkGlobal, false),
    add("symbex_open_merge", OpenMerge, false),
    add("symbex_close_merge", CloseMerge, false),
    add("symbex_prefer_cex", PreferCex, false),
    add("symbex_posix_prefer_cex", PosixPreferCex, false),
    add("symbex_print_expr", PrintExpr, false),
    add("symbex_print_range", PrintRange, false),
    add("symbex_set_forking", SetForking, false),
    add("symbex_stack_trace", StackTrace, false),
    add("symbex_warning", Warning, false),
    add("symbex_warning_once", WarningOnce, false),
    add("symbex_alias_function", AliasFunction, false),
    add("symbex_alias_function_regex", AliasFunctionRegex, false),
    add("symbex_alias_undo", AliasUndo, false),
    add("symbex_range", Range, true),
    add("symbex_int", Int, true),
    add("symbex_choose", Choose, true),
    add("malloc", Malloc, true),
    add("memalign", Memalign, true),
    add("realloc", Realloc, true),
    add("_symbex_eh_Unwind_RaiseException_impl", EhUnwindRaiseException, false),
    add("symbex_trace_paramf", TraceParam, false),
    add("symbex_trace_paramd", TraceParam, false),
    add("symbex_trace_paraml", TraceParam, false),
    add("symbex_trace_paramll", TraceParam, false),
    add("symbex_trace_param_u16", TraceParam, false),
    add("symbex_trace_param_i32", TraceParam, false),
    add("symbex_trace_param_u32", TraceParam, false),
    add("symbex_trace_param_i64", TraceParam, false),
    add("symbex_trace_param_u64", TraceParam, false),
    add("symbex_trace_param_ptr", TraceParamPtr, false),
    add("symbex_trace_param_ptr_directed", TraceParamPtrDirected, false),
    add("symbex_trace_param_tagged_ptr", TraceParamTaggedPtr, false),
    add("symbex_trace_param_just_ptr", TraceParamJustPtr, false),
    add("symbex_trace_param_fptr", TraceParamFPtr, false),
    add("symbex_trace_extra_val_f", TraceVal, false),
    add("symbex_trace_extra_val_d", TraceVal, false),
    add("symbex_trace_extra_val_l", TraceVal, false),
    add("symbex_trace_extra_val_ll", TraceVal, false),
    add("symbex_trace_extra_val_u16", TraceVal, false),
    add("symbex_trace_extra_val_i32", TraceVal, false),
    add("symbex_trace_extra_val_u32", TraceVal, false),
    add("symbex_trace_extra_val_i64", TraceVal, false),
    add("symbex_trace_extra_val_u64", TraceVal, false),
    add("symbex_trace_ret", TraceRet, false),
    add("symbex_trace_ret_ptr", TraceRetPtr, false),
    add("symbex_trace_ret_just_ptr", TraceRetJustPtr, false),
    add("symbex_trace_param_ptr_field", TraceParamPtrField, false),
    add("symbex_trace_param_ptr_field_directed", TraceParamPtrFieldDirected, false),
    add("symbex_trace_param_ptr_field_just_ptr", TraceParamPtrFieldJustPtr, false),
    add("symbex_trace_ret_ptr_field", TraceRetPtrField, false),
    add("symbex_trace_ret_ptr_field_just_ptr", TraceRetPtrFieldJustPtr, false),
    add("symbex_trace_param_ptr_nested_field", TraceParamPtrNestedField, false),
    add("symbex_trace_param_ptr_nested_field_directed", TraceParamPtrNestedFieldDirected, false),
    add("symbex_trace_ret_ptr_nested_field", TraceRetPtrNestedField, false),
    add("symbex_trace_extra_ptr", TraceExtraPtr, false),
    add("symbex_trace_extra_ptr_field", TraceExtraPtrField, false),
    add("symbex_trace_extra_ptr_field_just_ptr", TraceExtraPtrFieldJustPtr, false),
    add("symbex_trace_extra_ptr_nested_field", TraceExtraPtrNestedField, false),
    add("symbex_trace_extra_ptr_nested_nested_field", TraceExtraPtrNestedNestedField, false),
    add("symbex_trace_extra_fptr", TraceExtraFPtr, false),
    add("symbex_induce_invariants", InduceInvariants, true),
    add("symbex_forbid_access", ForbidAccess, false),
    add("symbex_allow_access", AllowAccess, false),
    add("symbex_dump_constraints", DumpConstraints, false),
    add("symbex_possibly_havoc", PossiblyHavoc, false),
    add("symbex_map_symbol_names", MapSymbolNames, false),
    add("symbex_add_bpf_call", AddBpfCall, false),
    // operator delete[](void*)
    add("_ZdaPv", DeleteArray, false),
    // operator delete(void*)
    add("_ZdlPv", Delete, false),
    // operator new[](unsigned int)
    add("_Znaj", NewArray, true),
    // operator new(unsigned int)
    add("_Znwj", New, true),
    // operator new[](unsigned long)
    add("_Znam", NewArray, true),
    // operator new(unsigned long)
    add("_Znwm", New, true),
    add("__ubsan_handle_add_overflow", AddOverflow, false),
    add("__ubsan_handle_sub_overflow", SubOverflow, false),
    add("__ubsan_handle_mul_overflow", MulOverflow, false),
    add("__ubsan_handle_divrem_overflow", DivRemOverflow, false),
    add("symbex_eh_typeid_for", EhTypeid, true),
];

// REGISTRY
// ================================================================================================

/// The per-module binding of function identities to intrinsic kinds.
#[derive(Debug)]
pub struct Intrinsics {
    handlers: BTreeMap<FunctionId, (IntrinsicKind, bool)>,
    options: EngineOptions,
}

impl Intrinsics {
    pub fn new(options: EngineOptions) -> Self {
        Intrinsics { handlers: BTreeMap::new(), options }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Module preparation: every table function present in the module loses its body (so calls
    /// can only reach the engine-side handler), except `do_not_override` entries the program
    /// defines itself. Returns the names that were claimed.
    pub fn prepare(&self, module: &Module) -> Vec<&'static str> {
        let mut preserved = Vec::new();
        for info in INTRINSIC_TABLE {
            let Some(kf) = module.function(info.name) else {
                // nothing to claim if the function cannot be called
                continue;
            };
            if !info.do_not_override || kf.is_declaration() {
                preserved.push(info.name);
                if info.does_not_return {
                    kf.mark_no_return();
                }
                if !kf.is_declaration() {
                    kf.delete_body();
                }
            }
        }
        preserved
    }

    /// Builds the dispatch map from function identity to `(kind, has_return_value)`.
    pub fn bind(&mut self, module: &Module) {
        for info in INTRINSIC_TABLE {
            if let Some(kf) = module.function(info.name) {
                if !info.do_not_override || kf.is_declaration() {
                    self.handlers.insert(kf.id(), (info.kind, info.has_return_value));
                }
            }
        }
    }

    pub fn kind_of(&self, function: FunctionId) -> Option<IntrinsicKind> {
        self.handlers.get(&function).map(|(kind, _)| *kind)
    }

    /// Dispatches a call to `f`. Returns `Ok(false)` when `f` is not a bound intrinsic, and
    /// `Err` when the state must terminate.
    pub fn handle(
        &self,
        state: &mut ExecutionState,
        f: &Arc<KFunction>,
        site: &CallSite,
        args: &[Expr],
        host: &mut dyn Host,
    ) -> Result<bool, StateTermination> {
        let Some((kind, has_return_value)) = self.handlers.get(&f.id()).copied() else {
            return Ok(false);
        };
        if !has_return_value && site.dest.is_some() {
            return Err(TerminationError::exec(
                "expected return value from void modeling intrinsic",
            )
            .into());
        }
        handlers::dispatch(kind, state, site, args, host, &self.options)?;
        Ok(true)
    }
}

// STRING ARGUMENTS
// ================================================================================================

/// Reads a NUL-terminated concrete string through the address space. The pointer must be a
/// constant resolving into a single object; a symbolic character is a hard user error, a missing
/// terminator only a one-time warning.
pub(crate) fn read_string_at(
    state: &ExecutionState,
    address: &Expr,
) -> Result<String, TerminationError> {
    let addr = address.as_constant().ok_or_else(|| {
        TerminationError::user("symbolic string pointer passed to one of the modeling intrinsics")
    })?;
    let (object, os) = state.address_space.resolve_one(addr).ok_or_else(|| {
        TerminationError::user("invalid string pointer passed to one of the modeling intrinsics")
    })?;
    let mut buf = String::new();
    let mut terminated = false;
    for offset in object.offset_of(addr)..object.size {
        let byte = os.read8(offset, false)?;
        let c = byte.as_constant().ok_or_else(|| {
            TerminationError::user("hit symbolic character while reading a concrete string")
        })? as u8;
        if c == 0 {
            terminated = true;
            break;
        }
        buf.push(c as char);
    }
    if !terminated {
        warning_once(
            None,
            "string not terminated by \\0 passed to one of the modeling intrinsics",
        );
    }
    Ok(buf)
}

// ONE-SHOT WARNINGS
// ================================================================================================

static WARNED_ONCE: OnceLock<Mutex<BTreeSet<(Option<String>, String)>>> = OnceLock::new();

/// Emits `message` at warn level at most once per process for a given (callsite, text) pair.
pub fn warning_once(callsite: Option<&str>, message: &str) {
    let set = WARNED_ONCE.get_or_init(|| Mutex::new(BTreeSet::new()));
    let fresh = set
        .lock()
        .expect("warning-once set poisoned")
        .insert((callsite.map(str::to_string), message.to_string()));
    if fresh {
        match callsite {
            Some(site) => warn!(%site, "{message}"),
            None => warn!("{message}"),
        }
    }
}
