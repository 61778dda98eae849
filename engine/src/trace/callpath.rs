//! The call-path text artifact.
//!
//! Three sections: `;;-- kQuery --` (array declarations plus a query whose value list carries
//! the in/out observations), `;;-- Calls --` (one call per logical line, spanning lines while
//! parentheses are unbalanced, with `extra : NAME & …` lines attaching the next two query values
//! to the most recent call), and `;;-- Constraints --`. The loader mirrors the state machine of
//! the downstream compatibility checker; expression text is kept opaque but balanced.

use std::{
    collections::BTreeMap,
    fmt::Write as _,
    io::{self, BufRead, Write},
};

use miette::Diagnostic;
use symbex_core::expr::{Expr, SymbolSet, symbols_of};

use crate::{state::ExecutionState, trace::CallInfo};

const KQUERY_HEADER: &str = ";;-- kQuery --";
const CALLS_HEADER: &str = ";;-- Calls --";
const CONSTRAINTS_HEADER: &str = ";;-- Constraints --";

// WRITER
// ================================================================================================

/// Serializes the recorded call path of `state`.
pub fn write_call_path(state: &ExecutionState, out: &mut dyn Write) -> io::Result<()> {
    let mut arrays = SymbolSet::new();
    for constraint in state.constraints.iter() {
        arrays.extend(symbols_of(constraint));
    }
    let mut values: Vec<Expr> = Vec::new();
    let mut extra_lines: Vec<Vec<String>> = Vec::new();
    for info in &state.call_path {
        let mut lines = Vec::new();
        for extra in info.extra_ptrs.values() {
            let zero = Expr::constant(0, extra.pointee.width.max(8));
            values.push(extra.pointee.in_val.clone().unwrap_or_else(|| zero.clone()));
            values.push(extra.pointee.out_val.clone().unwrap_or(zero));
            lines.push(format!("extra : {} & {}", extra.name, extra.prefix));
        }
        for fptr in &info.extra_fptrs {
            let zero = Expr::constant(0, fptr.width.max(8));
            values.push(fptr.in_val.clone().unwrap_or_else(|| zero.clone()));
            values.push(fptr.out_val.clone().unwrap_or(zero));
            lines.push(format!("extra : {} & {}", fptr.name, fptr.prefix));
        }
        for val in &info.extra_vals {
            values.push(val.expr.clone());
            values.push(val.expr.clone());
            lines.push(format!("extra : {} & {}", val.name, val.prefix));
        }
        for expr in info
            .args
            .iter()
            .filter_map(|a| a.expr.as_ref())
            .chain(info.ret.expr.as_ref())
            .chain(&info.call_context)
            .chain(&info.return_context)
        {
            arrays.extend(symbols_of(expr));
        }
        for value in values.iter().rev().take(2 * lines.len()) {
            arrays.extend(symbols_of(value));
        }
        extra_lines.push(lines);
    }

    writeln!(out, "{KQUERY_HEADER}")?;
    for array in &arrays {
        writeln!(out, "array {}[{}] : w32 -> w8 = symbolic", array.name(), array.size())?;
    }
    let mut query = String::from("(query [");
    for (i, constraint) in state.constraints.iter().enumerate() {
        if i > 0 {
            query.push(' ');
        }
        let _ = write!(query, "{constraint}");
    }
    query.push_str("]\n       false\n       [");
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            query.push(' ');
        }
        let _ = write!(query, "{value}");
    }
    query.push_str("])");
    writeln!(out, "{query}")?;

    writeln!(out, "{CALLS_HEADER}")?;
    for (info, lines) in state.call_path.iter().zip(extra_lines) {
        writeln!(out, "{}", format_call_line(info))?;
        for line in lines {
            writeln!(out, "{line}")?;
        }
    }

    writeln!(out, "{CONSTRAINTS_HEADER}")?;
    for constraint in state.constraints.iter() {
        writeln!(out, "{constraint}")?;
    }
    Ok(())
}

fn format_call_line(info: &CallInfo) -> String {
    let mut line = format!("{}(", info.f.name());
    for (i, arg) in info.args.iter().enumerate() {
        if i > 0 {
            line.push_str(", ");
        }
        match &arg.expr {
            Some(expr) => {
                let _ = write!(line, "{expr}");
            },
            None => line.push('?'),
        }
    }
    line.push(')');
    if let Some(ret) = &info.ret.expr {
        let _ = write!(line, " -> {ret}");
    }
    line
}

// LOADER
// ================================================================================================

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum CallPathError {
    #[error("i/o error")]
    Io(#[from] io::Error),
    #[error("missing section header {0}")]
    MissingSection(&'static str),
    #[error("malformed array declaration: {0}")]
    MalformedArrayDecl(String),
    #[error("malformed call line: {0}")]
    MalformedCallLine(String),
    #[error("`extra` line before any call")]
    ExtraBeforeCall,
    #[error("not enough expressions in the kQuery value list")]
    NotEnoughValues,
    #[error("unbalanced parentheses")]
    UnbalancedParens,
}

/// One call reconstructed from a call-path file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedCall {
    pub function: String,
    /// The full (possibly multi-line) call text.
    pub text: String,
    /// Extra observations: name → (in, out) expression text.
    pub extra_vars: BTreeMap<String, (String, String)>,
}

/// The loaded form of a call-path file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallPathSummary {
    /// Declared arrays as (name, size).
    pub arrays: Vec<(String, u32)>,
    pub calls: Vec<LoadedCall>,
    /// Constraint lines, verbatim.
    pub constraints: Vec<String>,
    /// First observed in-value per extra name.
    pub initial_extra_vars: BTreeMap<String, String>,
}

enum LoadState {
    Init,
    KQuery,
    Calls,
    CallsMultiline,
    Done,
}

/// Parses a call-path file produced by [`write_call_path`].
pub fn load_call_path(reader: impl BufRead) -> Result<CallPathSummary, CallPathError> {
    let mut summary = CallPathSummary::default();
    let mut state = LoadState::Init;
    let mut kquery = String::new();
    let mut values: Vec<String> = Vec::new();
    let mut parenthesis_level: i32 = 0;

    for line in reader.lines() {
        let line = line?;
        match state {
            LoadState::Init => {
                if line == KQUERY_HEADER {
                    state = LoadState::KQuery;
                }
            },
            LoadState::KQuery => {
                if line == CALLS_HEADER {
                    values = parse_query_values(&kquery)?;
                    state = LoadState::Calls;
                } else {
                    if let Some(decl) = line.strip_prefix("array ") {
                        let (name, rest) = decl
                            .split_once('[')
                            .ok_or_else(|| CallPathError::MalformedArrayDecl(line.clone()))?;
                        let size = rest
                            .split_once(']')
                            .and_then(|(s, _)| s.parse().ok())
                            .ok_or_else(|| CallPathError::MalformedArrayDecl(line.clone()))?;
                        summary.arrays.push((name.to_string(), size));
                    }
                    kquery.push('\n');
                    kquery.push_str(&line);
                }
            },
            LoadState::Calls => {
                if line == CONSTRAINTS_HEADER {
                    state = LoadState::Done;
                    continue;
                }
                if let Some(rest) = line.strip_prefix("extra") {
                    let rest = rest
                        .trim_start()
                        .strip_prefix(':')
                        .ok_or_else(|| CallPathError::MalformedCallLine(line.clone()))?;
                    let name = rest
                        .split_once('&')
                        .map(|(n, _)| n.trim())
                        .ok_or_else(|| CallPathError::MalformedCallLine(line.clone()))?;
                    let call =
                        summary.calls.last_mut().ok_or(CallPathError::ExtraBeforeCall)?;
                    if values.len() < 2 {
                        return Err(CallPathError::NotEnoughValues);
                    }
                    let in_val = values.remove(0);
                    let out_val = values.remove(0);
                    summary
                        .initial_extra_vars
                        .entry(name.to_string())
                        .or_insert_with(|| in_val.clone());
                    call.extra_vars.insert(name.to_string(), (in_val, out_val));
                } else {
                    let function = line
                        .split_once('(')
                        .map(|(f, _)| f.trim().to_string())
                        .ok_or_else(|| CallPathError::MalformedCallLine(line.clone()))?;
                    summary.calls.push(LoadedCall {
                        function,
                        text: line.clone(),
                        extra_vars: BTreeMap::new(),
                    });
                    parenthesis_level += balance_of(&line);
                    if parenthesis_level > 0 {
                        state = LoadState::CallsMultiline;
                    }
                }
            },
            LoadState::CallsMultiline => {
                let call = summary.calls.last_mut().expect("multiline implies a call");
                call.text.push('\n');
                call.text.push_str(&line);
                parenthesis_level += balance_of(&line);
                if parenthesis_level == 0 {
                    state = LoadState::Calls;
                }
            },
            LoadState::Done => {
                summary.constraints.push(line);
            },
        }
    }

    match state {
        LoadState::Done => Ok(summary),
        LoadState::Init => Err(CallPathError::MissingSection(KQUERY_HEADER)),
        LoadState::KQuery => Err(CallPathError::MissingSection(CALLS_HEADER)),
        _ => Err(CallPathError::MissingSection(CONSTRAINTS_HEADER)),
    }
}

fn balance_of(line: &str) -> i32 {
    line.chars().fold(0i32, |level, c| match c {
        '(' => level + 1,
        ')' => level - 1,
        _ => level,
    })
}

/// Extracts the value list of the `(query [constraints] false [values])` form as balanced
/// expression tokens.
fn parse_query_values(kquery: &str) -> Result<Vec<String>, CallPathError> {
    let Some(start) = kquery.find("(query") else {
        return Ok(Vec::new());
    };
    let query = &kquery[start..];
    let mut lists = Vec::new();
    let mut expr_depth = 0i32;
    let mut current = None::<String>;
    for c in query.chars() {
        match (c, current.as_mut()) {
            ('[', None) => current = Some(String::new()),
            (']', Some(_)) if expr_depth == 0 => {
                lists.push(current.take().expect("checked above"));
            },
            ('(', Some(buf)) => {
                expr_depth += 1;
                buf.push(c);
            },
            (')', Some(buf)) => {
                expr_depth -= 1;
                if expr_depth < 0 {
                    return Err(CallPathError::UnbalancedParens);
                }
                buf.push(c);
            },
            (_, Some(buf)) => buf.push(c),
            _ => {},
        }
    }
    // lists[0] = constraints, lists[1] = values
    match lists.get(1) {
        Some(values) => split_balanced(values),
        None => Ok(Vec::new()),
    }
}

/// Splits a token sequence on whitespace at parenthesis depth zero.
fn split_balanced(text: &str) -> Result<Vec<String>, CallPathError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    for c in text.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            },
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(CallPathError::UnbalancedParens);
                }
                current.push(c);
            },
            c if c.is_whitespace() && depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            },
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(CallPathError::UnbalancedParens);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}
