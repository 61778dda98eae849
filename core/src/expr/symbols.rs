use alloc::{
    collections::BTreeSet,
    string::{String, ToString},
    sync::Arc,
};
use core::{
    cmp::Ordering,
    fmt,
    sync::atomic::{AtomicU64, Ordering as MemOrdering},
};

use super::{Expr, ExprKind};

// SYMBOLIC ARRAYS
// ================================================================================================

/// Process-unique identity of a symbolic array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArrayId(u64);

impl fmt::Display for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_ARRAY_ID: AtomicU64 = AtomicU64::new(1);

/// A named symbolic byte array.
///
/// Arrays are the roots of all symbolic values: a fresh array is created whenever an allocation is
/// made symbolic or loop-invariant analysis forgets object bytes. Identity is the allocation-order
/// id; the name is what test-case emission and constraint dumps use.
#[derive(Clone)]
pub struct Array(Arc<ArrayInner>);

struct ArrayInner {
    id: ArrayId,
    name: String,
    size: u32,
}

impl Array {
    pub fn new(name: impl Into<String>, size: u32) -> Self {
        let id = ArrayId(NEXT_ARRAY_ID.fetch_add(1, MemOrdering::Relaxed));
        Array(Arc::new(ArrayInner { id, name: name.into(), size }))
    }

    pub fn id(&self) -> ArrayId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Size of the array in bytes.
    pub fn size(&self) -> u32 {
        self.0.size
    }
}

impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Array {}

impl PartialOrd for Array {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Array {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.id.cmp(&other.0.id)
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.0.name, self.0.size)
    }
}

// SYMBOL EXTRACTION
// ================================================================================================

/// The set of symbolic arrays an expression (or a constraint) mentions.
pub type SymbolSet = BTreeSet<Array>;

/// Collects every symbolic array mentioned anywhere in `expr`.
pub fn symbols_of(expr: &Expr) -> SymbolSet {
    let mut symbols = SymbolSet::new();
    collect(expr, &mut symbols);
    symbols
}

fn collect(expr: &Expr, out: &mut SymbolSet) {
    match expr.kind() {
        ExprKind::Constant(_) => {},
        ExprKind::Read { array, .. } => {
            out.insert(array.clone());
        },
        ExprKind::Concat { high, low } => {
            collect(high, out);
            collect(low, out);
        },
        ExprKind::Extract { expr, .. } | ExprKind::ZExt(expr) => collect(expr, out),
        ExprKind::Select { cond, on_true, on_false } => {
            collect(cond, out);
            collect(on_true, out);
            collect(on_false, out);
        },
        ExprKind::And(a, b)
        | ExprKind::Or(a, b)
        | ExprKind::Eq(a, b)
        | ExprKind::Ne(a, b)
        | ExprKind::Mul(a, b)
        | ExprKind::Ult(a, b)
        | ExprKind::Slt(a, b) => {
            collect(a, out);
            collect(b, out);
        },
    }
}

/// Returns a unique array name derived from `base`, recording the returned name in `used`.
pub fn unique_array_name(used: &mut BTreeSet<String>, base: &str) -> String {
    if used.insert(base.to_string()) {
        return base.to_string();
    }
    let mut n = 1u32;
    loop {
        let candidate = alloc::format!("{base}_{n}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::WIDTH_8;

    #[test]
    fn symbols_reach_through_select_trees() {
        let a = Array::new("a", 4);
        let b = Array::new("b", 4);
        let cond = Expr::is_zero(Expr::read8(&a, 0));
        let sel = Expr::select(cond, Expr::read8(&b, 1), Expr::constant(0, WIDTH_8));
        let symbols = symbols_of(&sel);
        assert!(symbols.contains(&a));
        assert!(symbols.contains(&b));
        assert_eq!(symbols.len(), 2);
    }

    #[test]
    fn unique_names_get_suffixed() {
        let mut used = BTreeSet::new();
        assert_eq!(unique_array_name(&mut used, "x"), "x");
        assert_eq!(unique_array_name(&mut used, "x"), "x_1");
        assert_eq!(unique_array_name(&mut used, "x"), "x_2");
        assert_eq!(unique_array_name(&mut used, "y"), "y");
    }
}
