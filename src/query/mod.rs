//! Query Module
//!
//! Predicate compilation and evaluation against the attribute index store.
//!
//! A filter is written as an [`Expr`], checked once by [`compile`], and then
//! evaluated any number of times with different [`QueryParams`].

mod compile;
mod eval;
mod expr;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::index::AttrValue;

pub use compile::{compile, CompiledPredicate};
pub use eval::{evaluate, order_keys};
pub use expr::Expr;

// == Query Params ==
/// Runtime values for `Expr::Param` placeholders.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    values: HashMap<String, AttrValue>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` to `value`, replacing any previous binding.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.values.get(name)
    }
}

// == Ordering ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ascending,
    Descending,
}

/// Sort order for query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub attribute: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn ascending(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            direction: Direction::Ascending,
        }
    }

    pub fn descending(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            direction: Direction::Descending,
        }
    }
}

// == Page ==
/// A window over an ordered result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items.into_iter().skip(self.offset).take(self.limit).collect()
    }
}
