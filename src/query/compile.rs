//! Compile Module
//!
//! Turns an [`Expr`] into an immutable [`CompiledPredicate`], rejecting
//! malformed trees up front so evaluation never sees them.

use std::sync::Arc;

use super::expr::Expr;
use crate::error::{CacheError, Result};
use crate::index::{AttrType, AttrValue, CompareOp, IndexStore};

// == Compiled Nodes ==
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Target {
    Member { attribute: String },
    Identity,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    Const(AttrValue),
    Param { name: String, attr_type: AttrType },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    AlwaysFalse,
    Clause {
        target: Target,
        op: CompareOp,
        operands: Vec<Operand>,
    },
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
}

// == Compiled Predicate ==
/// A checked, immutable filter tree. Cloning shares the tree.
#[derive(Debug, Clone)]
pub struct CompiledPredicate {
    root: Arc<Node>,
}

impl CompiledPredicate {
    pub(crate) fn root(&self) -> &Node {
        &self.root
    }

    /// Returns true if the predicate was proven to match nothing.
    pub fn is_always_false(&self) -> bool {
        matches!(*self.root, Node::AlwaysFalse)
    }
}

// == Compile ==
/// Checks `expr` against the index schema and folds provable no-matches
/// into `AlwaysFalse`.
///
/// # Errors
/// `InvalidPredicate` for a non-boolean root, an unindexed attribute, wrong
/// operand count, an operator unsupported by the attribute type, or a
/// literal of the wrong type.
pub fn compile(expr: &Expr, store: &IndexStore) -> Result<CompiledPredicate> {
    let root = compile_node(expr, store)?;
    Ok(CompiledPredicate {
        root: Arc::new(root),
    })
}

fn compile_node(expr: &Expr, store: &IndexStore) -> Result<Node> {
    match expr {
        Expr::AlwaysFalse => Ok(Node::AlwaysFalse),
        Expr::Compare {
            subject,
            op,
            operands,
        } => compile_clause(subject, *op, operands, store),
        Expr::And(children) => {
            let mut nodes = Vec::with_capacity(children.len());
            for child in children {
                match compile_node(child, store)? {
                    Node::AlwaysFalse => return Ok(Node::AlwaysFalse),
                    node => nodes.push(node),
                }
            }
            Ok(collapse(nodes, Node::And))
        }
        Expr::Or(children) => {
            let mut nodes = Vec::with_capacity(children.len());
            for child in children {
                match compile_node(child, store)? {
                    Node::AlwaysFalse => {}
                    node => nodes.push(node),
                }
            }
            Ok(collapse(nodes, Node::Or))
        }
        Expr::Not(child) => Ok(Node::Not(Box::new(compile_node(child, store)?))),
        Expr::Const(_) | Expr::Param(_) | Expr::Identity | Expr::Member(_) => Err(
            CacheError::InvalidPredicate(format!("{:?} is not a boolean expression", expr)),
        ),
    }
}

fn collapse(mut nodes: Vec<Node>, combine: fn(Vec<Node>) -> Node) -> Node {
    match nodes.len() {
        0 => Node::AlwaysFalse,
        1 => nodes.pop().unwrap_or(Node::AlwaysFalse),
        _ => combine(nodes),
    }
}

fn compile_clause(
    subject: &Expr,
    op: CompareOp,
    operands: &[Expr],
    store: &IndexStore,
) -> Result<Node> {
    let (target, attr_type) = match subject {
        Expr::Member(attribute) => {
            let attr_type = store.attr_type(attribute).ok_or_else(|| {
                CacheError::InvalidPredicate(format!("attribute '{}' is not indexed", attribute))
            })?;
            (
                Target::Member {
                    attribute: attribute.clone(),
                },
                attr_type,
            )
        }
        Expr::Identity => (Target::Identity, AttrType::Str),
        other => {
            return Err(CacheError::InvalidPredicate(format!(
                "{:?} cannot be the subject of a comparison",
                other
            )))
        }
    };

    if !op.accepts_arity(operands.len()) {
        return Err(CacheError::InvalidPredicate(format!(
            "{:?} cannot take {} operand(s)",
            op,
            operands.len()
        )));
    }
    if !op.supports(attr_type) {
        return Err(CacheError::InvalidPredicate(format!(
            "{:?} is not supported on {} values",
            op, attr_type
        )));
    }

    let operands = operands
        .iter()
        .map(|operand| match operand {
            Expr::Const(value) if value.attr_type() == attr_type => Ok(Operand::Const(value.clone())),
            Expr::Const(value) => Err(CacheError::InvalidPredicate(format!(
                "literal {} does not match {} subject",
                value, attr_type
            ))),
            Expr::Param(name) => Ok(Operand::Param {
                name: name.clone(),
                attr_type,
            }),
            other => Err(CacheError::InvalidPredicate(format!(
                "{:?} cannot be a comparison operand",
                other
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    // provable no-match
    let degenerate = match (op, operands.as_slice()) {
        (CompareOp::In, []) => true,
        (CompareOp::Between, [Operand::Const(lo), Operand::Const(hi)]) => lo > hi,
        _ => false,
    };
    if degenerate {
        return Ok(Node::AlwaysFalse);
    }

    Ok(Node::Clause {
        target,
        op,
        operands,
    })
}
