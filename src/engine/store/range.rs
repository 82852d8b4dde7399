//! Range builder
//!
//! Turns a comparison query (`eq`, `gt`, `gte`, `lt`, `lte`) into the
//! single key range a cursor scans.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::engine::adapter::Key;

/// One end of a range. `open` excludes the key itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    pub key: Key,
    pub open: bool,
}

impl Bound {
    pub fn inclusive(key: Key) -> Self {
        Self { key, open: false }
    }

    pub fn exclusive(key: Key) -> Self {
        Self { key, open: true }
    }
}

/// Interval over a key space
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyRange {
    /// Single key
    Only(Key),
    Bound { lower: Bound, upper: Bound },
    Lower(Bound),
    Upper(Bound),
    /// Every key
    #[default]
    Unbounded,
}

impl KeyRange {
    pub fn only(key: impl Into<Key>) -> Self {
        KeyRange::Only(key.into())
    }

    pub fn contains(&self, key: &Key) -> bool {
        match self {
            KeyRange::Only(only) => key == only,
            KeyRange::Bound { lower, upper } => above(key, lower) && below(key, upper),
            KeyRange::Lower(lower) => above(key, lower),
            KeyRange::Upper(upper) => below(key, upper),
            KeyRange::Unbounded => true,
        }
    }

    /// Smallest key a scan has to start from
    pub fn lower(&self) -> Option<&Bound> {
        match self {
            KeyRange::Bound { lower, .. } | KeyRange::Lower(lower) => Some(lower),
            _ => None,
        }
    }

    /// Largest key a scan may reach
    pub fn upper(&self) -> Option<&Bound> {
        match self {
            KeyRange::Bound { upper, .. } | KeyRange::Upper(upper) => Some(upper),
            _ => None,
        }
    }
}

fn above(key: &Key, bound: &Bound) -> bool {
    match key.cmp(&bound.key) {
        Ordering::Greater => true,
        Ordering::Equal => !bound.open,
        Ordering::Less => false,
    }
}

fn below(key: &Key, bound: &Bound) -> bool {
    match key.cmp(&bound.key) {
        Ordering::Less => true,
        Ordering::Equal => !bound.open,
        Ordering::Greater => false,
    }
}

/// Declarative comparison query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eq: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<Key>,
}

impl RangeQuery {
    pub fn eq(key: impl Into<Key>) -> Self {
        Self { eq: Some(key.into()), ..Self::default() }
    }

    pub fn gt(mut self, key: impl Into<Key>) -> Self {
        self.gt = Some(key.into());
        self
    }

    pub fn gte(mut self, key: impl Into<Key>) -> Self {
        self.gte = Some(key.into());
        self
    }

    pub fn lt(mut self, key: impl Into<Key>) -> Self {
        self.lt = Some(key.into());
        self
    }

    pub fn lte(mut self, key: impl Into<Key>) -> Self {
        self.lte = Some(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.eq.is_none()
            && self.gt.is_none()
            && self.gte.is_none()
            && self.lt.is_none()
            && self.lte.is_none()
    }
}

/// Build the range for a query.
///
/// Conflicting fields never fail: `eq` wins outright, then the paired
/// bounds in the order `gte+lte`, `gte+lt`, `gt+lt`, `gt+lte`, then the
/// single bounds `gt`, `gte`, `lt`, `lte`. No field at all is a full scan.
pub fn build_range(query: &RangeQuery) -> KeyRange {
    let RangeQuery { eq, gt, gte, lt, lte } = query.clone();

    if let Some(key) = eq {
        return KeyRange::Only(key);
    }

    let lower = gte.map(Bound::inclusive).or_else(|| gt.map(Bound::exclusive));
    let upper = lte.map(Bound::inclusive).or_else(|| lt.map(Bound::exclusive));

    match (lower, upper) {
        (Some(lower), Some(upper)) => KeyRange::Bound { lower, upper },
        (Some(lower), None) => KeyRange::Lower(lower),
        (None, Some(upper)) => KeyRange::Upper(upper),
        (None, None) => KeyRange::Unbounded,
    }
}
