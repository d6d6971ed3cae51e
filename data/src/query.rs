//! Conditions for selecting tuples.
//!
//! [`Conditions`] describe which tuples of a space an operation applies to. They consist of an
//! optional query on an index, any number of conditions on individual fields, and a window (limit,
//! offset and direction) applied to the results. Conditions are interpreted by the
//! [`Client`](crate::client::Client) that receives them; clients which cannot push some part of the
//! conditions to the server evaluate the rest locally with [`Conditions::filter`].

use crate::client::{Error, ErrorKind, SpaceMetadata, Tuple};
use itertools::Itertools;
use rmpv::Value;
use std::cmp::Ordering;
use strum::{Display, EnumString};

/// A comparison operator.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Hash)]
pub enum Operator {
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
}

impl Operator {
    /// Check whether `ord`, the result of comparing a stored value with a parameter, satisfies this
    /// operator.
    pub fn test(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Lt => ord == Ordering::Less,
            Self::Le => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::Ge => ord != Ordering::Less,
        }
    }
}

/// A condition on a single field.
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    /// The name of the field.
    pub field: String,
    /// The comparison.
    pub op: Operator,
    /// The value to compare the field against.
    pub value: Value,
}

/// A query on an index.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexQuery {
    /// The name of the index. `primary` always refers to the primary index.
    pub index: String,
    /// The comparison.
    pub op: Operator,
    /// Key to compare against. May be a prefix of the full index key.
    pub key: Vec<Value>,
}

/// Conditions selecting tuples from a space.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Conditions {
    index: Option<IndexQuery>,
    filters: Vec<Condition>,
    limit: Option<usize>,
    offset: usize,
    descending: bool,
}

impl Conditions {
    /// Conditions matching every tuple.
    pub fn any() -> Self {
        Self::default()
    }

    /// Conditions matching tuples whose key in `index` equals `key`.
    pub fn index_equals(index: impl Into<String>, key: Vec<Value>) -> Self {
        Self::any().and_index(index, Operator::Eq, key)
    }

    /// Conditions matching the tuple with primary key `key`.
    pub fn primary_key(key: Vec<Value>) -> Self {
        Self::index_equals("primary", key)
    }

    /// Restrict to tuples whose key in `index` compares to `key` according to `op`.
    ///
    /// Only one index query is allowed; a second call replaces the first.
    pub fn and_index(mut self, index: impl Into<String>, op: Operator, key: Vec<Value>) -> Self {
        self.index = Some(IndexQuery {
            index: index.into(),
            op,
            key,
        });
        self
    }

    /// Add a condition on a field.
    pub fn and(mut self, field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        self.filters.push(Condition {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Require `field == value`.
    pub fn and_equals(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(field, Operator::Eq, value)
    }

    /// Require `field > value`.
    pub fn and_greater_than(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(field, Operator::Gt, value)
    }

    /// Require `field >= value`.
    pub fn and_greater_or_equals(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(field, Operator::Ge, value)
    }

    /// Require `field < value`.
    pub fn and_less_than(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(field, Operator::Lt, value)
    }

    /// Require `field <= value`.
    pub fn and_less_or_equals(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(field, Operator::Le, value)
    }

    /// Return at most `limit` tuples.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first `offset` matching tuples.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Return tuples in primary key order.
    pub fn ascending(mut self) -> Self {
        self.descending = false;
        self
    }

    /// Return tuples in reverse primary key order.
    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// The index query, if any.
    pub fn index(&self) -> Option<&IndexQuery> {
        self.index.as_ref()
    }

    /// Conditions on individual fields.
    pub fn filters(&self) -> &[Condition] {
        &self.filters
    }

    /// The maximum number of tuples to return.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// The number of matching tuples to skip.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether tuples are returned in reverse primary key order.
    pub fn is_descending(&self) -> bool {
        self.descending
    }

    /// Whether the result window (offset, limit, direction) is the default one.
    pub fn has_default_window(&self) -> bool {
        self.offset == 0 && !self.descending
    }

    /// Test whether `tuple` satisfies the index query and every field condition.
    ///
    /// # Errors
    ///
    /// This method will fail if the conditions refer to an index or field which does not exist in
    /// `space`.
    pub fn matches<E: Error>(&self, tuple: &[Value], space: &SpaceMetadata) -> Result<bool, E> {
        if let Some(query) = &self.index {
            let index = space.index(&query.index).ok_or_else(|| {
                E::new(
                    ErrorKind::NoSuchIndex,
                    format!("index {} not found in space {}", query.index, space.name),
                )
            })?;
            let key = index.key_of(tuple);
            let prefix = &key[..query.key.len().min(key.len())];
            if !query.op.test(compare_keys(prefix, &query.key)) {
                return Ok(false);
            }
        }
        for cond in &self.filters {
            let pos = space.field_position(&cond.field).ok_or_else(|| {
                E::new(
                    ErrorKind::NoSuchField,
                    format!("field {} not found in space {}", cond.field, space.name),
                )
            })?;
            let value = tuple.get(pos).unwrap_or(&Value::Nil);
            if !cond.op.test(compare_values(value, &cond.value)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Select the tuples matching these conditions from `tuples`, which must be in primary key
    /// order, and apply the result window.
    pub fn filter<E: Error>(
        &self,
        tuples: impl IntoIterator<Item = Tuple>,
        space: &SpaceMetadata,
    ) -> Result<Vec<Tuple>, E> {
        let mut selected = vec![];
        for tuple in tuples {
            if self.matches::<E>(&tuple, space)? {
                selected.push(tuple);
            }
        }
        Ok(self.window(selected))
    }

    /// Apply direction, offset and limit to `tuples`, which must be in primary key order.
    pub fn window(&self, mut tuples: Vec<Tuple>) -> Vec<Tuple> {
        if self.descending {
            tuples.reverse();
        }
        tuples
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

impl std::fmt::Display for Conditions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = vec![];
        if let Some(q) = &self.index {
            parts.push(format!("{} {} [{}]", q.index, q.op, q.key.iter().join(", ")));
        }
        parts.extend(
            self.filters
                .iter()
                .map(|c| format!("{} {} {}", c.field, c.op, c.value)),
        );
        if parts.is_empty() {
            write!(f, "any")?;
        } else {
            write!(f, "{}", parts.iter().join(" and "))?;
        }
        if let Some(limit) = self.limit {
            write!(f, " limit {limit}")?;
        }
        if self.offset > 0 {
            write!(f, " offset {}", self.offset)?;
        }
        if self.descending {
            write!(f, " desc")?;
        }
        Ok(())
    }
}

/// Order of results by primary key.
#[derive(Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq, Hash)]
#[strum(ascii_case_insensitive)]
pub enum Sort {
    #[default]
    Asc,
    Desc,
}

impl Sort {
    /// Apply this order to `conditions`.
    pub fn apply(self, conditions: Conditions) -> Conditions {
        match self {
            Self::Asc => conditions.ascending(),
            Self::Desc => conditions.descending(),
        }
    }
}

/// A query against a space.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    conditions: Conditions,
}

impl Query {
    /// A query matching every tuple.
    pub fn new() -> Self {
        Self::default()
    }

    /// A query returning at most `limit` tuples.
    pub fn limited(limit: usize) -> Self {
        Self {
            conditions: Conditions::any().with_limit(limit),
        }
    }

    /// The conditions of this query.
    pub fn conditions(&self) -> &Conditions {
        &self.conditions
    }

    /// Refine the conditions of this query.
    pub fn map(self, f: impl FnOnce(Conditions) -> Conditions) -> Self {
        Self {
            conditions: f(self.conditions),
        }
    }

    /// Consume the query, returning its conditions.
    pub fn into_conditions(self) -> Conditions {
        self.conditions
    }
}

impl From<Conditions> for Query {
    fn from(conditions: Conditions) -> Self {
        Self { conditions }
    }
}

/// Compare two values using Tarantool's scalar ordering.
///
/// Values of different classes order as nil < boolean < number < string < binary < array < map <
/// extension. Integers and floating point numbers compare numerically.
pub fn compare_values(l: &Value, r: &Value) -> Ordering {
    fn class(v: &Value) -> u8 {
        match v {
            Value::Nil => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::F32(_) | Value::F64(_) => 2,
            Value::String(_) => 3,
            Value::Binary(_) => 4,
            Value::Array(_) => 5,
            Value::Map(_) => 6,
            Value::Ext(..) => 7,
        }
    }

    match (l, r) {
        (Value::Boolean(l), Value::Boolean(r)) => l.cmp(r),
        (Value::Integer(l), Value::Integer(r)) => {
            let l = l.as_i64().map(i128::from).or(l.as_u64().map(i128::from));
            let r = r.as_i64().map(i128::from).or(r.as_u64().map(i128::from));
            l.cmp(&r)
        }
        (l, r) if class(l) == 2 && class(r) == 2 => {
            let l = l.as_f64().unwrap_or(f64::NAN);
            let r = r.as_f64().unwrap_or(f64::NAN);
            l.partial_cmp(&r).unwrap_or(Ordering::Equal)
        }
        (Value::String(l), Value::String(r)) => l.as_bytes().cmp(r.as_bytes()),
        (Value::Binary(l), Value::Binary(r)) => l.cmp(r),
        (Value::Array(l), Value::Array(r)) => compare_keys(l, r),
        (Value::Map(l), Value::Map(r)) => l.len().cmp(&r.len()),
        (Value::Ext(lt, l), Value::Ext(rt, r)) => (lt, l).cmp(&(rt, r)),
        (l, r) => class(l).cmp(&class(r)),
    }
}

/// Compare two keys lexicographically with [`compare_values`].
pub fn compare_keys(l: &[Value], r: &[Value]) -> Ordering {
    for (l, r) in l.iter().zip(r) {
        match compare_values(l, r) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }
    l.len().cmp(&r.len())
}
