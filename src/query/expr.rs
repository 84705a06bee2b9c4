//! Expression Module
//!
//! Source form of a query filter, before compilation.

use crate::index::{AttrValue, CompareOp};

// == Expr ==
/// A node of a query filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value
    Const(AttrValue),
    /// Value supplied at evaluation time
    Param(String),
    /// The entry key itself
    Identity,
    /// An indexed attribute of the entry
    Member(String),
    /// `subject op operands`
    Compare {
        subject: Box<Expr>,
        op: CompareOp,
        operands: Vec<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    /// Matches nothing
    AlwaysFalse,
}

impl Expr {
    // == Leaves ==
    pub fn constant(value: impl Into<AttrValue>) -> Self {
        Expr::Const(value.into())
    }

    pub fn param(name: impl Into<String>) -> Self {
        Expr::Param(name.into())
    }

    pub fn member(attribute: impl Into<String>) -> Self {
        Expr::Member(attribute.into())
    }

    pub fn identity() -> Self {
        Expr::Identity
    }

    // == Combinators ==
    pub fn and(children: Vec<Expr>) -> Self {
        Expr::And(children)
    }

    pub fn or(children: Vec<Expr>) -> Self {
        Expr::Or(children)
    }

    pub fn negate(self) -> Self {
        Expr::Not(Box::new(self))
    }

    // == Comparisons ==
    pub fn compare(self, op: CompareOp, operands: Vec<Expr>) -> Self {
        Expr::Compare {
            subject: Box::new(self),
            op,
            operands,
        }
    }

    pub fn equals(self, operand: Expr) -> Self {
        self.compare(CompareOp::Eq, vec![operand])
    }

    pub fn not_equals(self, operand: Expr) -> Self {
        self.compare(CompareOp::Ne, vec![operand])
    }

    pub fn less_than(self, operand: Expr) -> Self {
        self.compare(CompareOp::Lt, vec![operand])
    }

    pub fn at_most(self, operand: Expr) -> Self {
        self.compare(CompareOp::Le, vec![operand])
    }

    pub fn greater_than(self, operand: Expr) -> Self {
        self.compare(CompareOp::Gt, vec![operand])
    }

    pub fn at_least(self, operand: Expr) -> Self {
        self.compare(CompareOp::Ge, vec![operand])
    }

    pub fn between(self, lo: Expr, hi: Expr) -> Self {
        self.compare(CompareOp::Between, vec![lo, hi])
    }

    pub fn one_of(self, operands: Vec<Expr>) -> Self {
        self.compare(CompareOp::In, operands)
    }

    pub fn like(self, pattern: impl Into<String>) -> Self {
        self.compare(CompareOp::Like, vec![Expr::Const(AttrValue::Str(pattern.into()))])
    }
}
