//! Attribute Value Module
//!
//! Typed attribute values with a total order, so they can key an ordered
//! bucket map.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named attributes attached to an entry.
pub type Attributes = BTreeMap<String, AttrValue>;

// == Attribute Type ==
/// Declared type of an indexed attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrType {
    Int,
    Float,
    #[serde(rename = "string")]
    Str,
    Bool,
    Time,
}

impl AttrType {
    /// Returns true if values of this type have a meaningful order for
    /// range comparisons.
    pub fn is_ordered(self) -> bool {
        !matches!(self, AttrType::Bool)
    }
}

impl FromStr for AttrType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "int" | "integer" | "long" => Ok(AttrType::Int),
            "float" | "double" => Ok(AttrType::Float),
            "string" | "str" => Ok(AttrType::Str),
            "bool" | "boolean" => Ok(AttrType::Bool),
            "time" | "datetime" => Ok(AttrType::Time),
            other => Err(format!("unknown attribute type '{}'", other)),
        }
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttrType::Int => "int",
            AttrType::Float => "float",
            AttrType::Str => "string",
            AttrType::Bool => "bool",
            AttrType::Time => "time",
        };
        f.write_str(name)
    }
}

// == Attribute Value ==
/// A single attribute value.
///
/// Values of different types order by type first; floats use IEEE total
/// order so NaN has a stable place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    #[serde(rename = "string")]
    Str(String),
    Bool(bool),
    Time(DateTime<Utc>),
}

impl AttrValue {
    pub fn attr_type(&self) -> AttrType {
        match self {
            AttrValue::Int(_) => AttrType::Int,
            AttrValue::Float(_) => AttrType::Float,
            AttrValue::Str(_) => AttrType::Str,
            AttrValue::Bool(_) => AttrType::Bool,
            AttrValue::Time(_) => AttrType::Time,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            AttrValue::Int(_) => 0,
            AttrValue::Float(_) => 1,
            AttrValue::Str(_) => 2,
            AttrValue::Bool(_) => 3,
            AttrValue::Time(_) => 4,
        }
    }
}

impl Ord for AttrValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (AttrValue::Int(a), AttrValue::Int(b)) => a.cmp(b),
            (AttrValue::Float(a), AttrValue::Float(b)) => a.total_cmp(b),
            (AttrValue::Str(a), AttrValue::Str(b)) => a.cmp(b),
            (AttrValue::Bool(a), AttrValue::Bool(b)) => a.cmp(b),
            (AttrValue::Time(a), AttrValue::Time(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for AttrValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for AttrValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for AttrValue {}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::Float(v) => write!(f, "{}", v),
            AttrValue::Str(v) => write!(f, "'{}'", v),
            AttrValue::Bool(v) => write!(f, "{}", v),
            AttrValue::Time(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(v.into())
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<DateTime<Utc>> for AttrValue {
    fn from(v: DateTime<Utc>) -> Self {
        AttrValue::Time(v)
    }
}

// == Wildcard Match ==
/// Matches `text` against a pattern where `*` is any run of characters and
/// `?` is exactly one character.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            // backtrack: let the last star swallow one more character
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}
