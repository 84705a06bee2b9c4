//! Evaluation Module
//!
//! A single recursive evaluator over compiled nodes, plus deterministic
//! ordering and paging of result sets.

use std::collections::BTreeSet;

use super::compile::{CompiledPredicate, Node, Operand, Target};
use super::{Direction, OrderBy, QueryParams};
use crate::error::{CacheError, Result};
use crate::index::{AttrValue, Comparison, IndexStore};

// == Evaluate ==
/// Resolves a compiled predicate to the matching keys, in natural key order.
///
/// Same predicate, same index state and same parameters always give the
/// same result.
///
/// # Errors
/// `InvalidPredicate` if a parameter is unbound or has the wrong type, or
/// if an attribute index was dropped after compilation.
pub fn evaluate(
    predicate: &CompiledPredicate,
    store: &IndexStore,
    params: &QueryParams,
) -> Result<BTreeSet<String>> {
    eval_node(predicate.root(), store, params)
}

fn eval_node(node: &Node, store: &IndexStore, params: &QueryParams) -> Result<BTreeSet<String>> {
    match node {
        Node::AlwaysFalse => Ok(BTreeSet::new()),
        Node::Clause {
            target,
            op,
            operands,
        } => {
            let values = operands
                .iter()
                .map(|operand| resolve(operand, params))
                .collect::<Result<Vec<_>>>()?;
            let comparison = Comparison::new(*op, values)?;
            match target {
                Target::Member { attribute } => store.lookup(attribute, &comparison),
                Target::Identity => Ok(store
                    .keys()
                    .into_iter()
                    .filter(|key| comparison.matches(&AttrValue::Str(key.clone())))
                    .collect()),
            }
        }
        Node::And(children) => {
            let mut children = children.iter();
            let mut acc = match children.next() {
                Some(first) => eval_node(first, store, params)?,
                None => return Ok(BTreeSet::new()),
            };
            for child in children {
                if acc.is_empty() {
                    break;
                }
                let next = eval_node(child, store, params)?;
                acc.retain(|key| next.contains(key));
            }
            Ok(acc)
        }
        Node::Or(children) => {
            let mut acc = BTreeSet::new();
            for child in children {
                acc.extend(eval_node(child, store, params)?);
            }
            Ok(acc)
        }
        Node::Not(child) => {
            let excluded = eval_node(child, store, params)?;
            let mut universe = store.keys();
            universe.retain(|key| !excluded.contains(key));
            Ok(universe)
        }
    }
}

fn resolve(operand: &Operand, params: &QueryParams) -> Result<AttrValue> {
    match operand {
        Operand::Const(value) => Ok(value.clone()),
        Operand::Param { name, attr_type } => {
            let value = params.get(name).ok_or_else(|| {
                CacheError::InvalidPredicate(format!("parameter '{}' is unbound", name))
            })?;
            if value.attr_type() != *attr_type {
                return Err(CacheError::InvalidPredicate(format!(
                    "parameter '{}' must be {}, got {}",
                    name,
                    attr_type,
                    value.attr_type()
                )));
            }
            Ok(value.clone())
        }
    }
}

// == Order Keys ==
/// Sorts `keys` by an indexed attribute.
///
/// Ties keep natural key order in both directions; keys without a value for
/// the attribute come last, also in natural order.
///
/// # Errors
/// `InvalidPredicate` if the attribute is not indexed.
pub fn order_keys(
    keys: &BTreeSet<String>,
    order: &OrderBy,
    store: &IndexStore,
) -> Result<Vec<String>> {
    let index = store.attribute(&order.attribute).ok_or_else(|| {
        CacheError::InvalidPredicate(format!(
            "cannot order by unindexed attribute '{}'",
            order.attribute
        ))
    })?;

    let descending = order.direction == Direction::Descending;
    let mut seen = BTreeSet::new();
    let mut ordered: Vec<String> = index
        .ordered_keys(descending)
        .into_iter()
        .filter(|key| keys.contains(key) && seen.insert(key.clone()))
        .collect();
    ordered.extend(keys.iter().filter(|key| !seen.contains(*key)).cloned());
    Ok(ordered)
}
