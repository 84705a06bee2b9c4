//! Index Store Module
//!
//! Per-attribute ordered bucket maps from value to entry keys.
//!
//! Locking is two-level: the bucket map of an attribute is behind an
//! `RwLock` that is held shared by traversals and by in-place bucket
//! mutation, and exclusively only when a bucket is created or pruned. Each
//! bucket has its own `RwLock`, so writers on different buckets do not
//! contend and a traversal blocks only writers of the buckets it is reading.
//! Whenever more than one bucket lock is held they are taken in value order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::value::{wildcard_match, AttrType, AttrValue, Attributes};
use crate::error::{CacheError, Result};

type Bucket = RwLock<BTreeSet<String>>;

// == Compare Op ==
/// Comparison operator of a query clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Inclusive on both ends
    Between,
    In,
    /// `*` and `?` wildcards, strings only
    Like,
}

impl CompareOp {
    /// Checks the operand count for this operator.
    pub fn accepts_arity(self, operands: usize) -> bool {
        match self {
            CompareOp::Between => operands == 2,
            CompareOp::In => true,
            _ => operands == 1,
        }
    }

    /// Checks that the operator makes sense for values of `ty`.
    pub fn supports(self, ty: AttrType) -> bool {
        match self {
            CompareOp::Eq | CompareOp::Ne | CompareOp::In => true,
            CompareOp::Like => ty == AttrType::Str,
            CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge | CompareOp::Between => {
                ty.is_ordered()
            }
        }
    }
}

// == Comparison ==
/// An operator with its resolved operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    Eq(AttrValue),
    Ne(AttrValue),
    Lt(AttrValue),
    Le(AttrValue),
    Gt(AttrValue),
    Ge(AttrValue),
    Between(AttrValue, AttrValue),
    In(Vec<AttrValue>),
    Like(String),
}

impl Comparison {
    /// Builds a comparison from an operator and operand list.
    ///
    /// # Errors
    /// `InvalidPredicate` on wrong arity or a non-string `Like` pattern.
    pub fn new(op: CompareOp, operands: Vec<AttrValue>) -> Result<Self> {
        if !op.accepts_arity(operands.len()) {
            return Err(CacheError::InvalidPredicate(format!(
                "{:?} cannot take {} operand(s)",
                op,
                operands.len()
            )));
        }

        let mut operands = operands.into_iter();
        let mut next = || {
            operands
                .next()
                .ok_or_else(|| CacheError::InvalidPredicate(format!("{:?} is missing an operand", op)))
        };

        Ok(match op {
            CompareOp::Eq => Comparison::Eq(next()?),
            CompareOp::Ne => Comparison::Ne(next()?),
            CompareOp::Lt => Comparison::Lt(next()?),
            CompareOp::Le => Comparison::Le(next()?),
            CompareOp::Gt => Comparison::Gt(next()?),
            CompareOp::Ge => Comparison::Ge(next()?),
            CompareOp::Between => {
                let lo = next()?;
                Comparison::Between(lo, next()?)
            }
            CompareOp::In => {
                let mut values = Vec::new();
                while let Ok(v) = next() {
                    values.push(v);
                }
                Comparison::In(values)
            }
            CompareOp::Like => match next()? {
                AttrValue::Str(pattern) => Comparison::Like(pattern),
                other => {
                    return Err(CacheError::InvalidPredicate(format!(
                        "LIKE needs a string pattern, got {}",
                        other
                    )))
                }
            },
        })
    }

    /// Operand values, for type checking.
    pub fn operands(&self) -> Vec<&AttrValue> {
        match self {
            Comparison::Eq(v)
            | Comparison::Ne(v)
            | Comparison::Lt(v)
            | Comparison::Le(v)
            | Comparison::Gt(v)
            | Comparison::Ge(v) => vec![v],
            Comparison::Between(lo, hi) => vec![lo, hi],
            Comparison::In(values) => values.iter().collect(),
            Comparison::Like(_) => Vec::new(),
        }
    }

    pub fn op(&self) -> CompareOp {
        match self {
            Comparison::Eq(_) => CompareOp::Eq,
            Comparison::Ne(_) => CompareOp::Ne,
            Comparison::Lt(_) => CompareOp::Lt,
            Comparison::Le(_) => CompareOp::Le,
            Comparison::Gt(_) => CompareOp::Gt,
            Comparison::Ge(_) => CompareOp::Ge,
            Comparison::Between(..) => CompareOp::Between,
            Comparison::In(_) => CompareOp::In,
            Comparison::Like(_) => CompareOp::Like,
        }
    }

    /// Evaluates the comparison against a single value.
    pub fn matches(&self, value: &AttrValue) -> bool {
        match self {
            Comparison::Eq(v) => value == v,
            Comparison::Ne(v) => value != v,
            Comparison::Lt(v) => value < v,
            Comparison::Le(v) => value <= v,
            Comparison::Gt(v) => value > v,
            Comparison::Ge(v) => value >= v,
            Comparison::Between(lo, hi) => lo <= value && value <= hi,
            Comparison::In(values) => values.contains(value),
            Comparison::Like(pattern) => value
                .as_str()
                .is_some_and(|s| wildcard_match(pattern, s)),
        }
    }

    fn check_type(&self, attribute: &str, ty: AttrType) -> Result<()> {
        if !self.op().supports(ty) {
            return Err(CacheError::InvalidPredicate(format!(
                "{:?} is not supported on {} attribute '{}'",
                self.op(),
                ty,
                attribute
            )));
        }
        match self.operands().into_iter().find(|v| v.attr_type() != ty) {
            Some(v) => Err(CacheError::InvalidPredicate(format!(
                "operand {} does not match {} attribute '{}'",
                v, ty, attribute
            ))),
            None => Ok(()),
        }
    }
}

// == Attribute Index ==
/// Ordered value-to-keys mapping for one attribute.
#[derive(Debug)]
pub struct AttributeIndex {
    name: String,
    attr_type: AttrType,
    buckets: RwLock<BTreeMap<AttrValue, Bucket>>,
}

impl AttributeIndex {
    pub fn new(name: impl Into<String>, attr_type: AttrType) -> Self {
        Self {
            name: name.into(),
            attr_type,
            buckets: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attr_type(&self) -> AttrType {
        self.attr_type
    }

    fn check_value(&self, value: &AttrValue) -> Result<()> {
        if value.attr_type() == self.attr_type {
            Ok(())
        } else {
            Err(CacheError::InvalidRequest(format!(
                "attribute '{}' is {}, got {}",
                self.name,
                self.attr_type,
                value.attr_type()
            )))
        }
    }

    // == Insert ==
    /// Adds `key` to the bucket for `value`.
    pub fn insert(&self, key: &str, value: &AttrValue) -> Result<()> {
        self.check_value(value)?;
        {
            let map = self.buckets.read();
            if let Some(bucket) = map.get(value) {
                bucket.write().insert(key.to_string());
                return Ok(());
            }
        }

        let mut map = self.buckets.write();
        map.entry(value.clone())
            .or_default()
            .get_mut()
            .insert(key.to_string());
        Ok(())
    }

    // == Remove ==
    /// Removes `key` from the bucket for `value`, pruning the bucket if it
    /// becomes empty. Returns whether the key was present.
    pub fn remove(&self, key: &str, value: &AttrValue) -> bool {
        let (removed, now_empty) = {
            let map = self.buckets.read();
            match map.get(value) {
                Some(bucket) => {
                    let mut keys = bucket.write();
                    let removed = keys.remove(key);
                    (removed, keys.is_empty())
                }
                None => (false, false),
            }
        };

        if now_empty {
            self.prune(value);
        }
        removed
    }

    fn prune(&self, value: &AttrValue) {
        let mut map = self.buckets.write();
        if map.get_mut(value).is_some_and(|b| b.get_mut().is_empty()) {
            map.remove(value);
        }
    }

    // == Update ==
    /// Moves `key` from the `old` bucket to the `new` bucket in one step.
    ///
    /// Both bucket locks are held across the move so no traversal can see
    /// the key in neither or both buckets.
    pub fn update(&self, key: &str, old: &AttrValue, new: &AttrValue) -> Result<()> {
        self.check_value(new)?;
        if old == new {
            return self.insert(key, new);
        }

        let prune_old = {
            let map = self.buckets.read();
            match (map.get(old), map.get(new)) {
                (Some(from), Some(to)) => {
                    let (mut from, mut to) = if old < new {
                        let from = from.write();
                        (from, to.write())
                    } else {
                        let to = to.write();
                        (from.write(), to)
                    };
                    from.remove(key);
                    to.insert(key.to_string());
                    Some(from.is_empty())
                }
                _ => None,
            }
        };

        match prune_old {
            Some(true) => self.prune(old),
            Some(false) => {}
            None => {
                // a bucket has to be created or is missing: move under the
                // exclusive map lock instead
                let mut map = self.buckets.write();
                if let Some(bucket) = map.get_mut(old) {
                    let keys = bucket.get_mut();
                    keys.remove(key);
                    if keys.is_empty() {
                        map.remove(old);
                    }
                }
                map.entry(new.clone())
                    .or_default()
                    .get_mut()
                    .insert(key.to_string());
            }
        }
        Ok(())
    }

    // == Lookup ==
    /// Returns the keys whose value satisfies `comparison`, in natural key
    /// order.
    ///
    /// All buckets involved are read-locked together for the duration of
    /// the traversal.
    pub fn lookup(&self, comparison: &Comparison) -> Result<BTreeSet<String>> {
        comparison.check_type(&self.name, self.attr_type)?;

        let map = self.buckets.read();
        let guards: Vec<RwLockReadGuard<'_, BTreeSet<String>>> = match comparison {
            Comparison::Eq(v) => map.get(v).map(|b| b.read()).into_iter().collect(),
            Comparison::In(values) => {
                let wanted: BTreeSet<&AttrValue> = values.iter().collect();
                wanted
                    .into_iter()
                    .filter_map(|v| map.get(v))
                    .map(|b| b.read())
                    .collect()
            }
            Comparison::Between(lo, hi) if lo > hi => Vec::new(),
            Comparison::Between(lo, hi) => map
                .range((Bound::Included(lo), Bound::Included(hi)))
                .map(|(_, b)| b.read())
                .collect(),
            Comparison::Lt(v) => map.range(..v).map(|(_, b)| b.read()).collect(),
            Comparison::Le(v) => map.range(..=v).map(|(_, b)| b.read()).collect(),
            Comparison::Gt(v) => map
                .range((Bound::Excluded(v), Bound::Unbounded))
                .map(|(_, b)| b.read())
                .collect(),
            Comparison::Ge(v) => map.range(v..).map(|(_, b)| b.read()).collect(),
            Comparison::Ne(_) | Comparison::Like(_) => map
                .iter()
                .filter(|(value, _)| comparison.matches(value))
                .map(|(_, b)| b.read())
                .collect(),
        };

        Ok(guards.iter().flat_map(|keys| keys.iter().cloned()).collect())
    }

    // == Ordered Keys ==
    /// Every indexed key, bucket by bucket in value order (ascending or
    /// descending), keys within a bucket in natural order.
    pub fn ordered_keys(&self, descending: bool) -> Vec<String> {
        let map = self.buckets.read();
        let guards: Vec<RwLockReadGuard<'_, BTreeSet<String>>> =
            map.values().map(|b| b.read()).collect();

        let mut ordered = Vec::new();
        if descending {
            for keys in guards.iter().rev() {
                ordered.extend(keys.iter().cloned());
            }
        } else {
            for keys in &guards {
                ordered.extend(keys.iter().cloned());
            }
        }
        ordered
    }

    /// Returns true if `key` sits in the bucket for `value`.
    pub fn contains(&self, key: &str, value: &AttrValue) -> bool {
        self.buckets
            .read()
            .get(value)
            .is_some_and(|b| b.read().contains(key))
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    // == Rebuild ==
    /// Replaces every bucket with the given placements. Values of the wrong
    /// type are skipped.
    fn rebuild(&self, pairs: Vec<(String, AttrValue)>) -> Vec<String> {
        let mut fresh: BTreeMap<AttrValue, Bucket> = BTreeMap::new();
        let mut placed = Vec::new();
        for (key, value) in pairs {
            if self.check_value(&value).is_err() {
                debug!(attribute = %self.name, key, "Skipping mistyped value during rebuild");
                continue;
            }
            fresh.entry(value).or_default().get_mut().insert(key.clone());
            placed.push(key);
        }
        *self.buckets.write() = fresh;
        placed
    }
}

// == Index Store ==
/// All attribute indexes plus the live-key universe.
#[derive(Debug, Default)]
pub struct IndexStore {
    indexes: RwLock<HashMap<String, Arc<AttributeIndex>>>,
    keys: RwLock<BTreeSet<String>>,
}

impl IndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    // == Schema ==
    /// Declares an indexed attribute. Redefining with the same type returns
    /// the existing index.
    ///
    /// # Errors
    /// `InvalidRequest` if the attribute is already indexed with another type.
    pub fn define(&self, name: &str, attr_type: AttrType) -> Result<Arc<AttributeIndex>> {
        let mut indexes = self.indexes.write();
        if let Some(existing) = indexes.get(name) {
            if existing.attr_type() != attr_type {
                return Err(CacheError::InvalidRequest(format!(
                    "attribute '{}' is already indexed as {}",
                    name,
                    existing.attr_type()
                )));
            }
            return Ok(existing.clone());
        }

        let index = Arc::new(AttributeIndex::new(name, attr_type));
        indexes.insert(name.to_string(), index.clone());
        info!(attribute = name, %attr_type, "Attribute index defined");
        Ok(index)
    }

    pub fn attribute(&self, name: &str) -> Option<Arc<AttributeIndex>> {
        self.indexes.read().get(name).cloned()
    }

    pub fn attr_type(&self, name: &str) -> Option<AttrType> {
        self.indexes.read().get(name).map(|i| i.attr_type())
    }

    fn require(&self, name: &str) -> Result<Arc<AttributeIndex>> {
        self.attribute(name)
            .ok_or_else(|| CacheError::InvalidRequest(format!("attribute '{}' is not indexed", name)))
    }

    // == Single Attribute ==
    pub fn index(&self, key: &str, attribute: &str, value: &AttrValue) -> Result<()> {
        self.require(attribute)?.insert(key, value)
    }

    pub fn remove(&self, key: &str, attribute: &str, old_value: &AttrValue) -> Result<bool> {
        Ok(self.require(attribute)?.remove(key, old_value))
    }

    /// Looks up keys of one attribute.
    ///
    /// # Errors
    /// `InvalidPredicate` for an unknown attribute or a comparison that does
    /// not fit its type.
    pub fn lookup(&self, attribute: &str, comparison: &Comparison) -> Result<BTreeSet<String>> {
        let index = self.attribute(attribute).ok_or_else(|| {
            CacheError::InvalidPredicate(format!("attribute '{}' is not indexed", attribute))
        })?;
        index.lookup(comparison)
    }

    // == Entry Level ==
    fn validate(&self, attributes: &Attributes) -> Result<Vec<(Arc<AttributeIndex>, AttrValue)>> {
        let indexes = self.indexes.read();
        attributes
            .iter()
            .filter_map(|(name, value)| indexes.get(name).map(|i| (i.clone(), value.clone())))
            .map(|(index, value)| index.check_value(&value).map(|_| (index, value)))
            .collect()
    }

    /// Registers a new entry and indexes its attributes. Attributes without
    /// an index are ignored.
    ///
    /// # Errors
    /// `InvalidRequest` if any indexed attribute has the wrong type; nothing
    /// is indexed in that case.
    pub fn add_entry(&self, key: &str, attributes: &Attributes) -> Result<()> {
        let placements = self.validate(attributes)?;
        self.keys.write().insert(key.to_string());
        for (index, value) in placements {
            index.insert(key, &value)?;
        }
        Ok(())
    }

    /// Unregisters an entry and drops it from every bucket it occupied.
    pub fn remove_entry(&self, key: &str, attributes: &Attributes) {
        let indexes: Vec<Arc<AttributeIndex>> = self.indexes.read().values().cloned().collect();
        for index in indexes {
            if let Some(value) = attributes.get(index.name()) {
                index.remove(key, value);
            }
        }
        self.keys.write().remove(key);
    }

    /// Re-indexes an entry whose attributes changed from `old` to `new`.
    ///
    /// # Errors
    /// `InvalidRequest` if any new indexed attribute has the wrong type; the
    /// old placement is kept in that case.
    pub fn update_entry(&self, key: &str, old: &Attributes, new: &Attributes) -> Result<()> {
        self.validate(new)?;
        let indexes: Vec<Arc<AttributeIndex>> = self.indexes.read().values().cloned().collect();
        for index in indexes {
            match (old.get(index.name()), new.get(index.name())) {
                (Some(before), Some(after)) => index.update(key, before, after)?,
                (Some(before), None) => {
                    index.remove(key, before);
                }
                (None, Some(after)) => index.insert(key, after)?,
                (None, None) => {}
            }
        }
        self.keys.write().insert(key.to_string());
        Ok(())
    }

    /// Snapshot of every live key, in natural order.
    pub fn keys(&self) -> BTreeSet<String> {
        self.keys.read().clone()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.keys.read().contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    // == Rebuild ==
    /// Rebuilds an attribute's buckets from scratch, returning the keys that
    /// were placed.
    pub fn rebuild(
        &self,
        attribute: &str,
        pairs: impl IntoIterator<Item = (String, AttrValue)>,
    ) -> Result<Vec<String>> {
        let index = self.require(attribute)?;
        let placed = index.rebuild(pairs.into_iter().collect());
        info!(attribute, placed = placed.len(), "Attribute index rebuilt");
        Ok(placed)
    }
}
