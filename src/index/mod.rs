//! Index Module
//!
//! Secondary attribute indexes: attribute value to the keys holding it.

mod store;
mod value;

pub use store::{AttributeIndex, CompareOp, Comparison, IndexStore};
pub use value::{wildcard_match, AttrType, AttrValue, Attributes};
