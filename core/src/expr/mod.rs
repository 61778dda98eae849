use alloc::sync::Arc;
use core::{
    cmp::Ordering,
    fmt::{self, Display},
    hash::{Hash, Hasher},
};

mod symbols;
pub use symbols::{Array, ArrayId, SymbolSet, symbols_of, unique_array_name};

// EXPRESSION WIDTHS
// ================================================================================================

/// Width of an expression in bits.
pub type Width = u32;

pub const WIDTH_BOOL: Width = 1;
pub const WIDTH_8: Width = 8;
pub const WIDTH_16: Width = 16;
pub const WIDTH_32: Width = 32;
pub const WIDTH_64: Width = 64;

/// Width of a pointer expression. The engine models a 64-bit target.
pub const WIDTH_PTR: Width = 64;

// EXPRESSIONS
// ================================================================================================

/// A reference-counted handle to an immutable expression node.
///
/// Handles compare structurally ([`Expr::compare`]) with a pointer-equality fast path; cloning a
/// handle is a reference-count bump. Constructors fold constant operands but never rewrite
/// symbolic structure, so the shape of a `Select` tree built during state merging is preserved
/// exactly.
#[derive(Clone)]
pub struct Expr(Arc<ExprNode>);

#[derive(Debug)]
struct ExprNode {
    kind: ExprKind,
    width: Width,
}

/// The operator of an expression node.
#[derive(Debug)]
pub enum ExprKind {
    /// A constant, truncated to the node width.
    Constant(u64),
    /// A single byte read out of a symbolic array.
    Read { array: Array, offset: u32 },
    /// `high` concatenated above `low`; the result width is the sum of both widths.
    Concat { high: Expr, low: Expr },
    /// Bits `[bit_offset, bit_offset + width)` of the operand.
    Extract { expr: Expr, bit_offset: u32 },
    /// If-then-else on a boolean condition; both arms have equal width.
    Select { cond: Expr, on_true: Expr, on_false: Expr },
    And(Expr, Expr),
    Or(Expr, Expr),
    Eq(Expr, Expr),
    Ne(Expr, Expr),
    Mul(Expr, Expr),
    /// Unsigned `<`; result is boolean.
    Ult(Expr, Expr),
    /// Signed `<`; result is boolean.
    Slt(Expr, Expr),
    /// Zero extension to the node width.
    ZExt(Expr),
}

fn truncate(value: u64, width: Width) -> u64 {
    if width >= 64 { value } else { value & ((1u64 << width) - 1) }
}

fn sign_extend(value: u64, width: Width) -> i64 {
    if width >= 64 {
        value as i64
    } else {
        let shift = 64 - width;
        ((value << shift) as i64) >> shift
    }
}

impl Expr {
    fn new(kind: ExprKind, width: Width) -> Self {
        Expr(Arc::new(ExprNode { kind, width }))
    }

    // CONSTRUCTORS
    // --------------------------------------------------------------------------------------------

    pub fn constant(value: u64, width: Width) -> Self {
        debug_assert!(width > 0, "zero-width constant");
        Self::new(ExprKind::Constant(truncate(value, width)), width)
    }

    pub fn true_bool() -> Self {
        Self::constant(1, WIDTH_BOOL)
    }

    pub fn false_bool() -> Self {
        Self::constant(0, WIDTH_BOOL)
    }

    /// A single byte read from a symbolic array.
    pub fn read8(array: &Array, offset: u32) -> Self {
        debug_assert!(offset < array.size(), "read offset out of array bounds");
        Self::new(ExprKind::Read { array: array.clone(), offset }, WIDTH_8)
    }

    pub fn concat(high: Expr, low: Expr) -> Self {
        let width = high.width() + low.width();
        if let (Some(h), Some(l)) = (high.as_constant(), low.as_constant())
            && width <= 64
        {
            return Self::constant((h << low.width()) | l, width);
        }
        Self::new(ExprKind::Concat { high, low }, width)
    }

    pub fn extract(expr: Expr, bit_offset: u32, width: Width) -> Self {
        debug_assert!(bit_offset + width <= expr.width(), "extract out of bounds");
        if bit_offset == 0 && width == expr.width() {
            return expr;
        }
        if let Some(v) = expr.as_constant() {
            return Self::constant(v >> bit_offset, width);
        }
        Self::new(ExprKind::Extract { expr, bit_offset }, width)
    }

    pub fn select(cond: Expr, on_true: Expr, on_false: Expr) -> Self {
        debug_assert_eq!(cond.width(), WIDTH_BOOL, "select condition must be boolean");
        debug_assert_eq!(on_true.width(), on_false.width(), "select arm widths differ");
        match cond.as_constant() {
            Some(0) => on_false,
            Some(_) => on_true,
            None => {
                let width = on_true.width();
                Self::new(ExprKind::Select { cond, on_true, on_false }, width)
            },
        }
    }

    pub fn and(lhs: Expr, rhs: Expr) -> Self {
        debug_assert_eq!(lhs.width(), rhs.width(), "operand widths differ");
        let width = lhs.width();
        if let (Some(a), Some(b)) = (lhs.as_constant(), rhs.as_constant()) {
            return Self::constant(a & b, width);
        }
        if width == WIDTH_BOOL {
            match (lhs.as_constant(), rhs.as_constant()) {
                (Some(1), None) => return rhs,
                (None, Some(1)) => return lhs,
                (Some(0), None) | (None, Some(0)) => return Self::false_bool(),
                _ => {},
            }
        }
        Self::new(ExprKind::And(lhs, rhs), width)
    }

    pub fn or(lhs: Expr, rhs: Expr) -> Self {
        debug_assert_eq!(lhs.width(), rhs.width(), "operand widths differ");
        let width = lhs.width();
        if let (Some(a), Some(b)) = (lhs.as_constant(), rhs.as_constant()) {
            return Self::constant(a | b, width);
        }
        if width == WIDTH_BOOL {
            match (lhs.as_constant(), rhs.as_constant()) {
                (Some(0), None) => return rhs,
                (None, Some(0)) => return lhs,
                (Some(1), None) | (None, Some(1)) => return Self::true_bool(),
                _ => {},
            }
        }
        Self::new(ExprKind::Or(lhs, rhs), width)
    }

    pub fn eq(lhs: Expr, rhs: Expr) -> Self {
        debug_assert_eq!(lhs.width(), rhs.width(), "operand widths differ");
        if let (Some(a), Some(b)) = (lhs.as_constant(), rhs.as_constant()) {
            return Self::constant((a == b) as u64, WIDTH_BOOL);
        }
        if lhs.compare(&rhs) == Ordering::Equal {
            return Self::true_bool();
        }
        Self::new(ExprKind::Eq(lhs, rhs), WIDTH_BOOL)
    }

    pub fn ne(lhs: Expr, rhs: Expr) -> Self {
        debug_assert_eq!(lhs.width(), rhs.width(), "operand widths differ");
        if let (Some(a), Some(b)) = (lhs.as_constant(), rhs.as_constant()) {
            return Self::constant((a != b) as u64, WIDTH_BOOL);
        }
        if lhs.compare(&rhs) == Ordering::Equal {
            return Self::false_bool();
        }
        Self::new(ExprKind::Ne(lhs, rhs), WIDTH_BOOL)
    }

    pub fn mul(lhs: Expr, rhs: Expr) -> Self {
        debug_assert_eq!(lhs.width(), rhs.width(), "operand widths differ");
        let width = lhs.width();
        if let (Some(a), Some(b)) = (lhs.as_constant(), rhs.as_constant()) {
            return Self::constant(a.wrapping_mul(b), width);
        }
        Self::new(ExprKind::Mul(lhs, rhs), width)
    }

    pub fn ult(lhs: Expr, rhs: Expr) -> Self {
        debug_assert_eq!(lhs.width(), rhs.width(), "operand widths differ");
        if let (Some(a), Some(b)) = (lhs.as_constant(), rhs.as_constant()) {
            return Self::constant((a < b) as u64, WIDTH_BOOL);
        }
        Self::new(ExprKind::Ult(lhs, rhs), WIDTH_BOOL)
    }

    pub fn slt(lhs: Expr, rhs: Expr) -> Self {
        debug_assert_eq!(lhs.width(), rhs.width(), "operand widths differ");
        let width = lhs.width();
        if let (Some(a), Some(b)) = (lhs.as_constant(), rhs.as_constant()) {
            return Self::constant((sign_extend(a, width) < sign_extend(b, width)) as u64, WIDTH_BOOL);
        }
        Self::new(ExprKind::Slt(lhs, rhs), WIDTH_BOOL)
    }

    pub fn zext(expr: Expr, width: Width) -> Self {
        debug_assert!(width >= expr.width(), "zext must widen");
        if width == expr.width() {
            return expr;
        }
        if let Some(v) = expr.as_constant() {
            return Self::constant(v, width);
        }
        Self::new(ExprKind::ZExt(expr), width)
    }

    /// `e == 0` at the operand's width, yielding a boolean.
    pub fn is_zero(expr: Expr) -> Self {
        let zero = Self::constant(0, expr.width());
        Self::eq(zero, expr)
    }

    /// Coerces an arbitrary-width expression to a boolean via `e != 0`.
    pub fn as_bool(expr: Expr) -> Self {
        if expr.width() == WIDTH_BOOL {
            return expr;
        }
        let zero = Self::constant(0, expr.width());
        Self::ne(expr, zero)
    }

    // ACCESSORS
    // --------------------------------------------------------------------------------------------

    pub fn width(&self) -> Width {
        self.0.width
    }

    pub fn kind(&self) -> &ExprKind {
        &self.0.kind
    }

    pub fn as_constant(&self) -> Option<u64> {
        match self.0.kind {
            ExprKind::Constant(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.0.kind, ExprKind::Constant(_))
    }

    pub fn is_true(&self) -> bool {
        self.width() == WIDTH_BOOL && self.as_constant() == Some(1)
    }

    pub fn is_false(&self) -> bool {
        self.width() == WIDTH_BOOL && self.as_constant() == Some(0)
    }

    // STRUCTURAL COMPARISON
    // --------------------------------------------------------------------------------------------

    /// Total structural order over expressions; `Ordering::Equal` iff the trees are structurally
    /// identical.
    pub fn compare(&self, other: &Expr) -> Ordering {
        if Arc::ptr_eq(&self.0, &other.0) {
            return Ordering::Equal;
        }
        self.0.width.cmp(&other.0.width).then_with(|| {
            let (a, b) = (&self.0.kind, &other.0.kind);
            discriminant_rank(a).cmp(&discriminant_rank(b)).then_with(|| compare_same_kind(a, b))
        })
    }

    fn children(&self) -> [Option<&Expr>; 3] {
        match &self.0.kind {
            ExprKind::Constant(_) | ExprKind::Read { .. } => [None, None, None],
            ExprKind::Concat { high, low } => [Some(high), Some(low), None],
            ExprKind::Extract { expr, .. } | ExprKind::ZExt(expr) => [Some(expr), None, None],
            ExprKind::Select { cond, on_true, on_false } => {
                [Some(cond), Some(on_true), Some(on_false)]
            },
            ExprKind::And(a, b)
            | ExprKind::Or(a, b)
            | ExprKind::Eq(a, b)
            | ExprKind::Ne(a, b)
            | ExprKind::Mul(a, b)
            | ExprKind::Ult(a, b)
            | ExprKind::Slt(a, b) => [Some(a), Some(b), None],
        }
    }
}

fn discriminant_rank(kind: &ExprKind) -> u8 {
    match kind {
        ExprKind::Constant(_) => 0,
        ExprKind::Read { .. } => 1,
        ExprKind::Concat { .. } => 2,
        ExprKind::Extract { .. } => 3,
        ExprKind::Select { .. } => 4,
        ExprKind::And(..) => 5,
        ExprKind::Or(..) => 6,
        ExprKind::Eq(..) => 7,
        ExprKind::Ne(..) => 8,
        ExprKind::Mul(..) => 9,
        ExprKind::Ult(..) => 10,
        ExprKind::Slt(..) => 11,
        ExprKind::ZExt(..) => 12,
    }
}

fn compare_same_kind(a: &ExprKind, b: &ExprKind) -> Ordering {
    use ExprKind::*;
    match (a, b) {
        (Constant(x), Constant(y)) => x.cmp(y),
        (Read { array: aa, offset: ao }, Read { array: ba, offset: bo }) => {
            aa.id().cmp(&ba.id()).then(ao.cmp(bo))
        },
        (Concat { high: ah, low: al }, Concat { high: bh, low: bl }) => {
            ah.compare(bh).then_with(|| al.compare(bl))
        },
        (Extract { expr: ae, bit_offset: ab }, Extract { expr: be, bit_offset: bb }) => {
            ab.cmp(bb).then_with(|| ae.compare(be))
        },
        (
            Select { cond: ac, on_true: at, on_false: af },
            Select { cond: bc, on_true: bt, on_false: bf },
        ) => ac.compare(bc).then_with(|| at.compare(bt)).then_with(|| af.compare(bf)),
        (And(a0, a1), And(b0, b1))
        | (Or(a0, a1), Or(b0, b1))
        | (Eq(a0, a1), Eq(b0, b1))
        | (Ne(a0, a1), Ne(b0, b1))
        | (Mul(a0, a1), Mul(b0, b1))
        | (Ult(a0, a1), Ult(b0, b1))
        | (Slt(a0, a1), Slt(b0, b1)) => a0.compare(b0).then_with(|| a1.compare(b1)),
        (ZExt(ae), ZExt(be)) => ae.compare(be),
        _ => unreachable!("compared nodes of different kinds"),
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Expr {}

impl PartialOrd for Expr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for Expr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.width.hash(state);
        discriminant_rank(&self.0.kind).hash(state);
        match &self.0.kind {
            ExprKind::Constant(v) => v.hash(state),
            ExprKind::Read { array, offset } => {
                array.id().hash(state);
                offset.hash(state);
            },
            ExprKind::Extract { bit_offset, .. } => bit_offset.hash(state),
            _ => {},
        }
        for child in self.children().into_iter().flatten() {
            child.hash(state);
        }
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

// TEXT FORM
// ================================================================================================

// The textual form is what `dump_constraints` and the call-path artifact emit. Every non-constant
// node prints as a parenthesized s-expression, so a printed expression is always a balanced token.
impl Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            ExprKind::Constant(v) => write!(f, "{v}:w{}", self.0.width),
            ExprKind::Read { array, offset } => {
                write!(f, "(Read w8 {offset} {})", array.name())
            },
            ExprKind::Concat { high, low } => {
                write!(f, "(Concat w{} {high} {low})", self.0.width)
            },
            ExprKind::Extract { expr, bit_offset } => {
                write!(f, "(Extract w{} {bit_offset} {expr})", self.0.width)
            },
            ExprKind::Select { cond, on_true, on_false } => {
                write!(f, "(Select w{} {cond} {on_true} {on_false})", self.0.width)
            },
            ExprKind::And(a, b) => write!(f, "(And w{} {a} {b})", self.0.width),
            ExprKind::Or(a, b) => write!(f, "(Or w{} {a} {b})", self.0.width),
            ExprKind::Eq(a, b) => write!(f, "(Eq {a} {b})"),
            ExprKind::Ne(a, b) => write!(f, "(Ne {a} {b})"),
            ExprKind::Mul(a, b) => write!(f, "(Mul w{} {a} {b})", self.0.width),
            ExprKind::Ult(a, b) => write!(f, "(Ult {a} {b})"),
            ExprKind::Slt(a, b) => write!(f, "(Slt {a} {b})"),
            ExprKind::ZExt(e) => write!(f, "(ZExt w{} {e})", self.0.width),
        }
    }
}
