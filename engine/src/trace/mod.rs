//! The typed call trace: one [`CallInfo`] per API boundary crossing, with directional
//! argument/return/extra-pointer observations and the relevant-constraint contexts recorded at
//! call entry and at return.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use symbex_core::expr::{Expr, SymbolSet, Width, symbols_of};

use crate::{
    errors::TerminationError,
    module::{InstRef, KFunction},
    state::ExecutionState,
};

mod callpath;
pub use callpath::{CallPathError, CallPathSummary, LoadedCall, load_call_path, write_call_path};

// TRACE DIRECTIONS
// ================================================================================================

/// Direction of a traced pointer observation, decoded from the 2-bit flag the tracing intrinsics
/// take.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    None,
    In,
    Out,
    Both,
}

impl Direction {
    pub fn from_flag(flag: u64) -> Option<Direction> {
        match flag {
            0 => Some(Direction::None),
            1 => Some(Direction::In),
            2 => Some(Direction::Out),
            3 => Some(Direction::Both),
            _ => None,
        }
    }

    pub fn traces_in(&self) -> bool {
        matches!(self, Direction::In | Direction::Both)
    }

    pub fn traces_out(&self) -> bool {
        matches!(self, Direction::Out | Direction::Both)
    }
}

// FIELD DESCRIPTORS
// ================================================================================================

/// Description of a traced pointee or one of its (possibly nested) fields.
#[derive(Clone, Debug, Default)]
pub struct FieldDescr {
    /// Width of the pointee in bits.
    pub width: Width,
    pub ty: String,
    pub name: String,
    /// Absolute address of the field; 0 for return-value fields whose base is only known at
    /// return time.
    pub addr: u64,
    pub trace_in: bool,
    pub trace_out: bool,
    pub in_val: Option<Expr>,
    pub out_val: Option<Expr>,
    /// Nested fields keyed by byte offset.
    pub fields: BTreeMap<i64, FieldDescr>,
}

fn opt_expr_eq(a: &Option<Expr>, b: &Option<Expr>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

impl FieldDescr {
    pub fn eq(&self, other: &FieldDescr) -> bool {
        let self_eq = self.width == other.width
            && self.name == other.name
            && self.ty == other.ty
            && self.trace_in == other.trace_in
            && self.trace_out == other.trace_out
            && (!self.trace_in || opt_expr_eq(&self.in_val, &other.in_val))
            && (!self.trace_out || opt_expr_eq(&self.out_val, &other.out_val));
        if !self_eq {
            return false;
        }
        if !self.trace_in && !self.trace_out {
            return true;
        }
        self.fields.len() == other.fields.len()
            && self.fields.iter().all(|(offset, field)| {
                other.fields.get(offset).is_some_and(|o| o.eq(field))
            })
    }

    /// Entry-only equality: out-values are ignored.
    pub fn same_invocation_value(&self, other: &FieldDescr) -> bool {
        let self_same = self.width == other.width
            && self.name == other.name
            && self.ty == other.ty
            && self.trace_in == other.trace_in
            && (!self.trace_in || opt_expr_eq(&self.in_val, &other.in_val));
        if !self_same {
            return false;
        }
        if !self.trace_in {
            return true;
        }
        self.fields.len() == other.fields.len()
            && self.fields.iter().all(|(offset, field)| {
                other.fields.get(offset).is_some_and(|o| o.same_invocation_value(field))
            })
    }
}

// CALL RECORD COMPONENTS
// ================================================================================================

#[derive(Clone, Debug)]
pub struct CallArg {
    pub expr: Option<Expr>,
    pub is_ptr: bool,
    pub fun_ptr: Option<Arc<KFunction>>,
    pub name: String,
    pub pointee: FieldDescr,
}

impl CallArg {
    pub fn eq(&self, other: &CallArg) -> bool {
        opt_expr_eq(&self.expr, &other.expr)
            && self.is_ptr == other.is_ptr
            && (!self.is_ptr || self.pointee.eq(&other.pointee))
    }

    pub fn same_invocation_value(&self, other: &CallArg) -> bool {
        opt_expr_eq(&self.expr, &other.expr)
            && self.is_ptr == other.is_ptr
            && (!self.is_ptr || self.pointee.same_invocation_value(&other.pointee))
    }
}

#[derive(Clone, Debug, Default)]
pub struct RetVal {
    pub expr: Option<Expr>,
    pub is_ptr: bool,
    pub fun_ptr: Option<Arc<KFunction>>,
    pub pointee: FieldDescr,
}

impl RetVal {
    pub fn eq(&self, other: &RetVal) -> bool {
        opt_expr_eq(&self.expr, &other.expr)
            && self.is_ptr == other.is_ptr
            && (!self.is_ptr || self.pointee.eq(&other.pointee))
    }
}

#[derive(Clone, Debug)]
pub struct CallExtraVal {
    pub expr: Expr,
    pub name: String,
    pub prefix: String,
}

#[derive(Clone, Debug)]
pub struct CallExtraPtr {
    pub ptr: u64,
    pub pointee: FieldDescr,
    pub accessible_in: bool,
    pub accessible_out: bool,
    pub name: String,
    pub prefix: String,
}

impl CallExtraPtr {
    pub fn eq(&self, other: &CallExtraPtr) -> bool {
        self.ptr == other.ptr
            && self.accessible_in == other.accessible_in
            && self.accessible_out == other.accessible_out
            && self.pointee.eq(&other.pointee)
            && self.name == other.name
    }

    pub fn same_invocation_value(&self, other: &CallExtraPtr) -> bool {
        self.ptr == other.ptr
            && self.accessible_in == other.accessible_in
            && self.pointee.same_invocation_value(&other.pointee)
            && self.name == other.name
    }
}

#[derive(Clone, Debug)]
pub struct CallExtraFPtr {
    pub ptr: u64,
    pub in_val: Option<Expr>,
    pub out_val: Option<Expr>,
    pub width: Width,
    pub fun_ptr: Arc<KFunction>,
    pub name: String,
    pub prefix: String,
}

// CALL INFO
// ================================================================================================

/// One traced call: the callee, its observed arguments, return value, extra in/out observations,
/// and the relevant path predicates at entry and at return.
#[derive(Clone, Debug)]
pub struct CallInfo {
    pub f: Arc<KFunction>,
    pub args: Vec<CallArg>,
    pub extra_ptrs: BTreeMap<u64, CallExtraPtr>,
    pub extra_vals: Vec<CallExtraVal>,
    pub extra_fptrs: Vec<CallExtraFPtr>,
    pub ret: RetVal,
    pub returned: bool,
    pub call_context: Vec<Expr>,
    pub return_context: Vec<Expr>,
    /// Cursor of the call instruction, when known.
    pub call_place: Option<InstRef>,
}

fn equal_contexts(a: &[Expr], b: &[Expr]) -> bool {
    let a_set: BTreeSet<&Expr> = a.iter().collect();
    let b_set: BTreeSet<&Expr> = b.iter().collect();
    a_set == b_set
}

impl CallInfo {
    fn new(f: Arc<KFunction>, call_context: Vec<Expr>, call_place: Option<InstRef>) -> Self {
        CallInfo {
            f,
            args: Vec::new(),
            extra_ptrs: BTreeMap::new(),
            extra_vals: Vec::new(),
            extra_fptrs: Vec::new(),
            ret: RetVal::default(),
            returned: false,
            call_context,
            return_context: Vec::new(),
            call_place,
        }
    }

    /// The traced pointer argument whose value is structurally equal to `ptr`.
    pub fn get_call_arg_ptr(&self, ptr: &Expr) -> Option<&CallArg> {
        self.args.iter().find(|a| a.is_ptr && a.expr.as_ref() == Some(ptr))
    }

    pub fn get_call_arg_ptr_mut(&mut self, ptr: &Expr) -> Option<&mut CallArg> {
        self.args.iter_mut().find(|a| a.is_ptr && a.expr.as_ref() == Some(ptr))
    }

    /// Full equality, including out-values and the return context.
    pub fn eq(&self, other: &CallInfo) -> bool {
        self.args.len() == other.args.len()
            && self.args.iter().zip(other.args.iter()).all(|(a, b)| a.eq(b))
            && self.f.id() == other.f.id()
            && self.ret.eq(&other.ret)
            && equal_contexts(&self.call_context, &other.call_context)
            && equal_contexts(&self.return_context, &other.return_context)
            && self.returned == other.returned
    }

    /// Entry-only equality: same callee, same argument values at entry, same call context.
    /// Extra pointers are deliberately not compared: whether one is observed can depend on the
    /// result value.
    pub fn same_invocation(&self, other: &CallInfo) -> bool {
        self.args.len() == other.args.len()
            && self.f.id() == other.f.id()
            && self
                .args
                .iter()
                .zip(other.args.iter())
                .all(|(a, b)| a.same_invocation_value(b))
            && equal_contexts(&self.call_context, &other.call_context)
    }

    /// Symbols observable by the caller after the call returned: the return expression plus
    /// every out-traced pointee.
    pub fn compute_ret_symbol_set(&self) -> SymbolSet {
        let mut symbols = SymbolSet::new();
        if let Some(expr) = &self.ret.expr {
            symbols.extend(symbols_of(expr));
        }
        if self.ret.is_ptr && self.ret.fun_ptr.is_none() && self.ret.pointee.trace_out {
            if let Some(out) = &self.ret.pointee.out_val {
                symbols.extend(symbols_of(out));
            }
        }
        for arg in &self.args {
            if arg.is_ptr && arg.fun_ptr.is_none() && arg.pointee.trace_out {
                if let Some(out) = &arg.pointee.out_val {
                    symbols.extend(symbols_of(out));
                }
            }
        }
        for extra in self.extra_ptrs.values() {
            if extra.pointee.trace_out {
                if let Some(out) = &extra.pointee.out_val {
                    symbols.extend(symbols_of(out));
                }
            }
        }
        symbols
    }
}

// FUNCTION-POINTER CANONICALIZATION
// ================================================================================================

/// Maps a recognized function-pointer name class to a small identifier, so structurally equal
/// hash/equality callbacks compare equal downstream.
pub(crate) fn canonical_fn_pointer_id(class: &str, fn_name: &str) -> Option<u32> {
    match class {
        "map_hash" => match fn_name {
            "FlowId_hash" | "fw_flow_hash" => Some(1),
            "ether_addr_hash" => Some(2),
            "lb_flow_hash" => Some(3),
            "lb_ip_hash" => Some(4),
            "policer_flow_hash" | "natasha_flow_hash" => Some(5),
            _ => None,
        },
        "map_key_eq" => match fn_name {
            "FlowId_eq" | "fw_flow_eq" => Some(1),
            "ether_addr_eq" => Some(2),
            "lb_flow_equality" => Some(3),
            "lb_ip_equality" => Some(4),
            "policer_flow_eq" | "natasha_flow_eq" => Some(5),
            _ => None,
        },
        _ => None,
    }
}

// TRACE OPERATIONS
// ================================================================================================

impl ExecutionState {
    /// The relevant-constraint closure: starting from `symbols`, repeatedly pulls in every path
    /// predicate that mentions an already-relevant symbol, widening the symbol set with each
    /// predicate added. Returns the predicates in path order.
    pub fn relevant_constraints(&self, mut symbols: SymbolSet) -> Vec<Expr> {
        let mut relevant = Vec::new();
        let mut inserted: BTreeSet<Expr> = BTreeSet::new();
        loop {
            let mut new_symbols = false;
            for constraint in self.constraints.iter() {
                if inserted.contains(constraint) {
                    continue;
                }
                let constrained = symbols_of(constraint);
                if constrained.iter().any(|s| symbols.contains(s)) {
                    for symbol in constrained {
                        new_symbols |= symbols.insert(symbol);
                    }
                    relevant.push(constraint.clone());
                    inserted.insert(constraint.clone());
                }
            }
            if !new_symbols {
                break;
            }
        }
        relevant
    }

    /// Ensures the call-path tail describes the currently active call, pushing a fresh record if
    /// the previous one has returned or belongs to a different callee. The symbols of the
    /// previous call's results feed into the new call's relevant-constraint seed.
    pub fn trace_ret(&mut self) {
        let current = self.current_function().clone();
        let needs_new = match self.call_path.last() {
            None => true,
            Some(info) => info.returned || info.f.id() != current.id(),
        };
        if !needs_new {
            return;
        }
        if let Some(prev) = self.call_path.last() {
            let symbols = prev.compute_ret_symbol_set();
            self.relevant_symbols.extend(symbols);
        }
        let context = self.relevant_constraints(self.relevant_symbols.clone());
        let call_place = self.stack.last().and_then(|f| f.caller);
        self.call_path.push(CallInfo::new(current, context, call_place));
    }

    pub fn trace_ret_ptr(&mut self, width: Width, trace_pointee: bool) {
        self.trace_ret();
        let ret = &mut self.call_path.last_mut().expect("trace_ret pushed a call").ret;
        ret.is_ptr = true;
        ret.pointee.trace_in = trace_pointee;
        ret.pointee.trace_out = trace_pointee;
        ret.pointee.width = width;
    }

    pub fn trace_arg_value(&mut self, value: Expr, name: &str) {
        self.trace_ret();
        let context = self.relevant_constraints(symbols_of(&value));
        let info = self.call_path.last_mut().expect("trace_ret pushed a call");
        info.args.push(CallArg {
            expr: Some(value),
            is_ptr: false,
            fun_ptr: None,
            name: name.to_string(),
            pointee: FieldDescr::default(),
        });
        info.call_context.extend(context);
    }

    pub fn trace_arg_ptr(
        &mut self,
        arg: Expr,
        width: Width,
        name: &str,
        ty: &str,
        trace_in: bool,
        trace_out: bool,
    ) -> Result<(), TerminationError> {
        self.trace_arg_value(arg.clone(), name);

        let mut symbols = symbols_of(&arg);
        let in_val = if trace_in {
            let address = concrete_pointer(&arg)?;
            let value = self.read_memory_chunk(address, width, true)?;
            symbols.extend(symbols_of(&value));
            Some(value)
        } else {
            None
        };
        let context = self.relevant_constraints(symbols);

        let info = self.call_path.last_mut().expect("trace_ret pushed a call");
        let arg_info = info.args.last_mut().expect("pushed by trace_arg_value");
        arg_info.is_ptr = true;
        arg_info.fun_ptr = None;
        arg_info.pointee.width = width;
        arg_info.pointee.ty = ty.to_string();
        arg_info.pointee.trace_in = trace_in;
        arg_info.pointee.trace_out = trace_out;
        arg_info.pointee.in_val = in_val;
        info.call_context.extend(context);
        Ok(())
    }

    pub fn trace_arg_fun_ptr(&mut self, arg: Expr, name: &str, function: Arc<KFunction>) {
        self.trace_arg_value(arg, name);
        let info = self.call_path.last_mut().expect("trace_ret pushed a call");
        let arg_info = info.args.last_mut().expect("pushed by trace_arg_value");
        arg_info.is_ptr = true;
        arg_info.fun_ptr = Some(function);
    }

    fn check_active_call(&self) -> Result<(), TerminationError> {
        let active = self
            .call_path
            .last()
            .is_some_and(|info| info.f.id() == self.current_function().id());
        if active {
            Ok(())
        } else {
            Err(TerminationError::user(
                "must trace the function itself before tracing a particular field",
            ))
        }
    }

    fn new_field(
        &self,
        addr: u64,
        width: Width,
        name: &str,
        trace_in: bool,
        trace_out: bool,
    ) -> Result<FieldDescr, TerminationError> {
        let in_val =
            if trace_in { Some(self.read_memory_chunk(addr, width, true)?) } else { None };
        Ok(FieldDescr {
            width,
            ty: String::new(),
            name: name.to_string(),
            addr,
            trace_in,
            trace_out,
            in_val,
            out_val: None,
            fields: BTreeMap::new(),
        })
    }

    pub fn trace_arg_ptr_field(
        &mut self,
        arg: &Expr,
        offset: i64,
        width: Width,
        name: &str,
        trace_in: bool,
        trace_out: bool,
    ) -> Result<(), TerminationError> {
        self.check_active_call()?;
        {
            let info = self.call_path.last().expect("checked by check_active_call");
            let arg_info = info.get_call_arg_ptr(arg).ok_or_else(|| {
                TerminationError::user("must first trace the pointer argument to trace a field")
            })?;
            check_field_slot(&arg_info.pointee, offset, trace_in, trace_out)?;
        }
        let base = concrete_pointer(arg)?;
        let addr = base.wrapping_add_signed(offset);
        let descr = self.new_field(addr, width, name, trace_in, trace_out)?;
        let info = self.call_path.last_mut().expect("checked above");
        let arg_info = info.get_call_arg_ptr_mut(arg).expect("checked above");
        arg_info.pointee.fields.insert(offset, descr);
        Ok(())
    }

    pub fn trace_arg_ptr_nested_field(
        &mut self,
        arg: &Expr,
        base_offset: i64,
        offset: i64,
        width: Width,
        name: &str,
        trace_in: bool,
        trace_out: bool,
    ) -> Result<(), TerminationError> {
        self.check_active_call()?;
        {
            let info = self.call_path.last().expect("checked by check_active_call");
            let arg_info = info.get_call_arg_ptr(arg).ok_or_else(|| {
                TerminationError::user("must first trace the pointer argument to trace a field")
            })?;
            if arg_info.pointee.width == 0 {
                return Err(TerminationError::user("cannot fit a field into zero bytes"));
            }
            if trace_in && !arg_info.pointee.trace_in {
                return Err(TerminationError::user(
                    "must trace the whole pointee to trace a single field",
                ));
            }
            if trace_out && !arg_info.pointee.trace_out {
                return Err(TerminationError::user(
                    "must trace the whole pointee to trace a single field",
                ));
            }
            let base_field = arg_info.pointee.fields.get(&base_offset).ok_or_else(|| {
                TerminationError::user("must first trace the base field itself")
            })?;
            if base_field.fields.contains_key(&offset) {
                return Err(TerminationError::user("conflicting nested field"));
            }
        }
        let base = concrete_pointer(arg)?;
        let addr = base.wrapping_add_signed(base_offset + offset);
        let descr = self.new_field(addr, width, name, trace_in, trace_out)?;
        let info = self.call_path.last_mut().expect("checked above");
        let arg_info = info.get_call_arg_ptr_mut(arg).expect("checked above");
        arg_info
            .pointee
            .fields
            .get_mut(&base_offset)
            .expect("checked above")
            .fields
            .insert(offset, descr);
        Ok(())
    }

    pub fn trace_ret_ptr_field(
        &mut self,
        offset: i64,
        width: Width,
        name: &str,
        trace_value: bool,
    ) -> Result<(), TerminationError> {
        self.check_active_call()?;
        let info = self.call_path.last_mut().expect("checked by check_active_call");
        let ret = &mut info.ret;
        if !ret.is_ptr {
            return Err(TerminationError::user("only a pointer can have fields traced"));
        }
        if !ret.pointee.trace_in {
            return Err(TerminationError::user(
                "must trace the whole pointee to trace a single field",
            ));
        }
        check_field_slot(&ret.pointee, offset, trace_value, trace_value)?;
        // the return value is unknown until the call returns, so the address stays unset
        ret.pointee.fields.insert(offset, FieldDescr {
            width,
            ty: String::new(),
            name: name.to_string(),
            addr: 0,
            trace_in: trace_value,
            trace_out: trace_value,
            in_val: None,
            out_val: None,
            fields: BTreeMap::new(),
        });
        Ok(())
    }

    pub fn trace_ret_ptr_nested_field(
        &mut self,
        base_offset: i64,
        offset: i64,
        width: Width,
        name: &str,
    ) -> Result<(), TerminationError> {
        self.check_active_call()?;
        let info = self.call_path.last_mut().expect("checked by check_active_call");
        let ret = &mut info.ret;
        if !ret.is_ptr {
            return Err(TerminationError::user("only a pointer can have fields traced"));
        }
        if !ret.pointee.trace_in {
            return Err(TerminationError::user(
                "must trace the whole pointee to trace a single field",
            ));
        }
        let base_field = ret
            .pointee
            .fields
            .get_mut(&base_offset)
            .ok_or_else(|| TerminationError::user("must first trace the base field itself"))?;
        if base_field.fields.contains_key(&offset) {
            return Err(TerminationError::user("conflicting nested field"));
        }
        base_field.fields.insert(offset, FieldDescr {
            width,
            ty: String::new(),
            name: name.to_string(),
            addr: 0,
            trace_in: true,
            trace_out: true,
            in_val: None,
            out_val: None,
            fields: BTreeMap::new(),
        });
        Ok(())
    }

    pub fn trace_extra_value(&mut self, value: Expr, name: &str, prefix: &str) {
        self.trace_ret();
        let info = self.call_path.last_mut().expect("trace_ret pushed a call");
        info.extra_vals.push(CallExtraVal {
            expr: value,
            name: name.to_string(),
            prefix: prefix.to_string(),
        });
    }

    pub fn trace_extra_ptr(
        &mut self,
        ptr: u64,
        width: Width,
        name: &str,
        ty: &str,
        prefix: &str,
        trace_in: bool,
        trace_out: bool,
    ) -> Result<(), TerminationError> {
        self.trace_ret();
        let accessible_in = trace_in && self.is_accessible_addr(ptr)?;
        let in_val =
            if trace_in { Some(self.read_memory_chunk(ptr, width, true)?) } else { None };
        let symbols = in_val.as_ref().map(symbols_of).unwrap_or_default();
        let context = self.relevant_constraints(symbols);

        let info = self.call_path.last_mut().expect("trace_ret pushed a call");
        info.extra_ptrs.insert(ptr, CallExtraPtr {
            ptr,
            pointee: FieldDescr {
                width,
                ty: ty.to_string(),
                name: String::new(),
                addr: ptr,
                trace_in,
                trace_out,
                in_val,
                out_val: None,
                fields: BTreeMap::new(),
            },
            accessible_in,
            accessible_out: trace_out,
            name: name.to_string(),
            prefix: prefix.to_string(),
        });
        info.call_context.extend(context);
        Ok(())
    }

    pub fn trace_extra_ptr_field(
        &mut self,
        ptr: u64,
        offset: i64,
        width: Width,
        name: &str,
        trace_in: bool,
        trace_out: bool,
    ) -> Result<(), TerminationError> {
        self.check_active_call()?;
        {
            let info = self.call_path.last().expect("checked by check_active_call");
            let extra = info.extra_ptrs.get(&ptr).ok_or_else(|| {
                TerminationError::user("must first trace the extra pointer to trace a field")
            })?;
            check_field_slot(&extra.pointee, offset, trace_in, trace_out)?;
        }
        let addr = ptr.wrapping_add_signed(offset);
        let descr = self.new_field(addr, width, name, trace_in, trace_out)?;
        let info = self.call_path.last_mut().expect("checked above");
        let extra = info.extra_ptrs.get_mut(&ptr).expect("checked above");
        extra.pointee.fields.insert(offset, descr);
        Ok(())
    }

    pub fn trace_extra_ptr_nested_field(
        &mut self,
        ptr: u64,
        base_offset: i64,
        offset: i64,
        width: Width,
        name: &str,
        trace_in: bool,
        trace_out: bool,
    ) -> Result<(), TerminationError> {
        self.trace_extra_ptr_nested_path(ptr, &[base_offset], offset, width, name, trace_in, trace_out)
    }

    pub fn trace_extra_ptr_nested_nested_field(
        &mut self,
        ptr: u64,
        base_base_offset: i64,
        base_offset: i64,
        offset: i64,
        width: Width,
        name: &str,
        trace_in: bool,
        trace_out: bool,
    ) -> Result<(), TerminationError> {
        self.trace_extra_ptr_nested_path(
            ptr,
            &[base_base_offset, base_offset],
            offset,
            width,
            name,
            trace_in,
            trace_out,
        )
    }

    fn trace_extra_ptr_nested_path(
        &mut self,
        ptr: u64,
        base_path: &[i64],
        offset: i64,
        width: Width,
        name: &str,
        trace_in: bool,
        trace_out: bool,
    ) -> Result<(), TerminationError> {
        self.check_active_call()?;
        let total_base: i64 = base_path.iter().sum();
        {
            let info = self.call_path.last().expect("checked by check_active_call");
            let extra = info.extra_ptrs.get(&ptr).ok_or_else(|| {
                TerminationError::user("must first trace the extra pointer to trace a field")
            })?;
            if u64::from(extra.pointee.width) / 8 <= (total_base + offset) as u64 {
                return Err(TerminationError::user("field does not fit into the traced pointee"));
            }
            let mut cursor = &extra.pointee;
            for step in base_path {
                cursor = cursor.fields.get(step).ok_or_else(|| {
                    TerminationError::user("must first trace the base field itself")
                })?;
            }
            if cursor.fields.contains_key(&offset) {
                return Err(TerminationError::user("conflicting nested field"));
            }
        }
        let addr = ptr.wrapping_add_signed(total_base + offset);
        let descr = self.new_field(addr, width, name, trace_in, trace_out)?;
        let info = self.call_path.last_mut().expect("checked above");
        let extra = info.extra_ptrs.get_mut(&ptr).expect("checked above");
        let mut cursor = &mut extra.pointee;
        for step in base_path {
            cursor = cursor.fields.get_mut(step).expect("checked above");
        }
        cursor.fields.insert(offset, descr);
        Ok(())
    }

    pub fn trace_extra_fun_ptr(
        &mut self,
        ptr: Expr,
        width: Width,
        name: &str,
        _ty: &str,
        prefix: &str,
        function: Arc<KFunction>,
    ) -> Result<(), TerminationError> {
        self.trace_ret();
        let address = concrete_pointer(&ptr)?;
        let fn_id = canonical_fn_pointer_id(name, function.name()).ok_or_else(|| {
            TerminationError::user(format!(
                "unrecognized function pointer class '{name}' for {}",
                function.name()
            ))
        })?;
        let canonical = Expr::constant(u64::from(fn_id), width);
        let info = self.call_path.last_mut().expect("trace_ret pushed a call");
        info.extra_fptrs.push(CallExtraFPtr {
            ptr: address,
            in_val: Some(canonical.clone()),
            out_val: Some(canonical),
            width,
            fun_ptr: function,
            name: name.to_string(),
            prefix: prefix.to_string(),
        });
        Ok(())
    }

    /// Appends the relevant-constraint closure of the call's result symbols to its return
    /// context.
    pub fn record_ret_constraints(&self, info: &mut CallInfo) {
        debug_assert!(info.f.id() == self.current_function().id());
        let symbols = info.compute_ret_symbol_set();
        let constraints = self.relevant_constraints(symbols);
        info.return_context.extend(constraints);
    }

    /// Completes the active call at function return: records the return expression, captures
    /// every out-traced pointee (and field) through the address space, and records the return
    /// context.
    pub fn trace_function_return(
        &mut self,
        ret_expr: Option<Expr>,
    ) -> Result<(), TerminationError> {
        let Some(mut info) = self.call_path.pop() else {
            return Ok(());
        };
        if info.returned {
            self.call_path.push(info);
            return Ok(());
        }

        info.ret.expr = ret_expr;
        if info.ret.is_ptr && info.ret.fun_ptr.is_none() && info.ret.pointee.trace_out {
            if let Some(base) = info.ret.expr.as_ref().and_then(|e| e.as_constant()) {
                info.ret.pointee.out_val =
                    Some(self.read_memory_chunk(base, info.ret.pointee.width, true)?);
                self.capture_out_fields(base, &mut info.ret.pointee)?;
            }
        }
        for arg in &mut info.args {
            if arg.is_ptr && arg.fun_ptr.is_none() && arg.pointee.trace_out {
                let base = arg
                    .expr
                    .as_ref()
                    .and_then(|e| e.as_constant())
                    .ok_or_else(|| TerminationError::unhandled("symbolic traced pointer"))?;
                arg.pointee.out_val =
                    Some(self.read_memory_chunk(base, arg.pointee.width, true)?);
                self.capture_out_fields(base, &mut arg.pointee)?;
            }
        }
        for extra in info.extra_ptrs.values_mut() {
            if extra.pointee.trace_out {
                extra.accessible_out = self.is_accessible_addr(extra.ptr)?;
                extra.pointee.out_val =
                    Some(self.read_memory_chunk(extra.ptr, extra.pointee.width, true)?);
                self.capture_out_fields(extra.ptr, &mut extra.pointee)?;
            }
        }

        info.returned = true;
        self.record_ret_constraints(&mut info);
        self.call_path.push(info);
        Ok(())
    }

    fn capture_out_fields(
        &self,
        base: u64,
        pointee: &mut FieldDescr,
    ) -> Result<(), TerminationError> {
        for (offset, field) in pointee.fields.iter_mut() {
            let addr = base.wrapping_add_signed(*offset);
            if field.trace_out {
                field.out_val = Some(self.read_memory_chunk(addr, field.width, true)?);
            }
            self.capture_out_fields(addr, field)?;
        }
        Ok(())
    }
}

// HELPERS
// ================================================================================================

fn concrete_pointer(expr: &Expr) -> Result<u64, TerminationError> {
    expr.as_constant()
        .ok_or_else(|| TerminationError::unhandled("traced pointer must be concrete"))
}

fn check_field_slot(
    pointee: &FieldDescr,
    offset: i64,
    trace_in: bool,
    trace_out: bool,
) -> Result<(), TerminationError> {
    if pointee.width == 0 {
        return Err(TerminationError::user("cannot fit a field into zero bytes"));
    }
    if offset < 0 || (offset as u64) >= u64::from(pointee.width) / 8 {
        return Err(TerminationError::user("field offset is outside the traced pointee"));
    }
    if trace_in && !pointee.trace_in {
        return Err(TerminationError::user(
            "must trace the whole pointee to trace a single field",
        ));
    }
    if trace_out && !pointee.trace_out {
        return Err(TerminationError::user(
            "must trace the whole pointee to trace a single field",
        ));
    }
    if pointee.fields.contains_key(&offset) {
        return Err(TerminationError::user("conflicting field"));
    }
    Ok(())
}
