use alloc::{collections::BTreeSet, vec::Vec};
use core::fmt;

use crate::expr::Expr;

// CONSTRAINT SET
// ================================================================================================

/// The ordered set of path predicates of an execution state.
///
/// Predicates are boolean expressions. Insertion order is preserved (it drives constraint dumps
/// and call-context recording), while a structural index keeps membership and whole-set
/// comparison logarithmic.
#[derive(Clone, Default)]
pub struct ConstraintSet {
    ordered: Vec<Expr>,
    index: BTreeSet<Expr>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a predicate unless it is a literal `true` or already present. Returns whether the set
    /// changed.
    pub fn add(&mut self, constraint: Expr) -> bool {
        debug_assert_eq!(constraint.width(), crate::expr::WIDTH_BOOL, "constraint must be boolean");
        if constraint.is_true() {
            return false;
        }
        if !self.index.insert(constraint.clone()) {
            return false;
        }
        self.ordered.push(constraint);
        true
    }

    pub fn contains(&self, constraint: &Expr) -> bool {
        self.index.contains(constraint)
    }

    /// Iterates predicates in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Expr> {
        self.ordered.iter()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// The structural (order-insensitive) view of the set.
    pub fn as_set(&self) -> &BTreeSet<Expr> {
        &self.index
    }
}

impl FromIterator<Expr> for ConstraintSet {
    fn from_iter<T: IntoIterator<Item = Expr>>(iter: T) -> Self {
        let mut set = Self::new();
        for c in iter {
            set.add(c);
        }
        set
    }
}

impl PartialEq for ConstraintSet {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for ConstraintSet {}

impl fmt::Debug for ConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ordered.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Array, Expr};

    fn symbolic_bool(name: &str) -> Expr {
        let array = Array::new(name, 1);
        Expr::is_zero(Expr::read8(&array, 0))
    }

    #[test]
    fn insertion_order_is_preserved() {
        let (a, b, c) = (symbolic_bool("a"), symbolic_bool("b"), symbolic_bool("c"));
        let mut set = ConstraintSet::new();
        set.add(c.clone());
        set.add(a.clone());
        set.add(b.clone());
        let order: Vec<_> = set.iter().cloned().collect();
        assert_eq!(order, vec![c, a, b]);
    }

    #[test]
    fn duplicates_and_literal_true_are_dropped() {
        let a = symbolic_bool("a");
        let mut set = ConstraintSet::new();
        assert!(set.add(a.clone()));
        assert!(!set.add(a));
        assert!(!set.add(Expr::true_bool()));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn equality_ignores_insertion_order() {
        let (a, b) = (symbolic_bool("a"), symbolic_bool("b"));
        let fwd: ConstraintSet = [a.clone(), b.clone()].into_iter().collect();
        let rev: ConstraintSet = [b, a].into_iter().collect();
        assert_eq!(fwd, rev);
    }
}
