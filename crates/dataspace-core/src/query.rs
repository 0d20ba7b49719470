// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Composable query filters.
//!
//! A filter is a list of [`Criterion`] values that are ANDed together. The
//! left operand is a dotted path into the entity's serde JSON form
//! (`state`, `stateTimestamp`, `properties.region`), so every store evaluates
//! the same criteria against the same document shape: the in-memory store
//! walks the JSON value, the SQL store translates paths to `json_extract`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default page size of a [`QuerySpec`].
pub const DEFAULT_QUERY_LIMIT: usize = 50;

/// Comparison operator of a criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    /// `=`
    #[serde(rename = "=")]
    Eq,
    /// `!=`
    #[serde(rename = "!=")]
    NotEq,
    /// `<`
    #[serde(rename = "<")]
    Lt,
    /// `<=`
    #[serde(rename = "<=")]
    Le,
    /// `>`
    #[serde(rename = ">")]
    Gt,
    /// `>=`
    #[serde(rename = ">=")]
    Ge,
    /// Right operand is an array containing the left value.
    #[serde(rename = "in")]
    In,
    /// SQL `LIKE` with `%` and `_` wildcards.
    #[serde(rename = "like")]
    Like,
    /// Left value is an array containing the right operand, or a string
    /// containing it as a substring.
    #[serde(rename = "contains")]
    Contains,
}

impl Operator {
    /// Operator as written in query strings.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "in",
            Self::Like => "like",
            Self::Contains => "contains",
        }
    }

    /// Parse an operator string, case-insensitive for the word operators.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "=" => Some(Self::Eq),
            "!=" | "<>" => Some(Self::NotEq),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            "in" => Some(Self::In),
            "like" => Some(Self::Like),
            "contains" => Some(Self::Contains),
            _ => None,
        }
    }
}

/// One `left operator right` condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criterion {
    /// Dotted path into the entity document.
    pub operand_left: String,
    /// Comparison operator.
    pub operator: Operator,
    /// Literal to compare against.
    pub operand_right: Value,
}

impl Criterion {
    /// Build a criterion.
    pub fn new(left: impl Into<String>, operator: Operator, right: impl Into<Value>) -> Self {
        Self {
            operand_left: left.into(),
            operator,
            operand_right: right.into(),
        }
    }

    /// `left = right`
    pub fn eq(left: impl Into<String>, right: impl Into<Value>) -> Self {
        Self::new(left, Operator::Eq, right)
    }

    /// `state = code`, the filter every state processor uses.
    pub fn state_is(code: i32) -> Self {
        Self::eq("state", code)
    }

    /// `state in codes`
    pub fn state_in(codes: &[i32]) -> Self {
        Self::new("state", Operator::In, codes.to_vec())
    }

    /// Evaluate against an entity document.
    pub fn matches(&self, document: &Value) -> bool {
        let left = lookup(document, &self.operand_left).unwrap_or(&Value::Null);
        let right = &self.operand_right;
        match self.operator {
            Operator::Eq => values_equal(left, right),
            Operator::NotEq => !values_equal(left, right),
            Operator::Lt => compare(left, right) == Some(Ordering::Less),
            Operator::Le => matches!(compare(left, right), Some(Ordering::Less | Ordering::Equal)),
            Operator::Gt => compare(left, right) == Some(Ordering::Greater),
            Operator::Ge => matches!(
                compare(left, right),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::In => match right {
                Value::Array(items) => items.iter().any(|item| values_equal(left, item)),
                _ => false,
            },
            Operator::Like => match (left, right) {
                (Value::String(value), Value::String(pattern)) => like(value, pattern),
                _ => false,
            },
            Operator::Contains => match (left, right) {
                (Value::Array(items), _) => items.iter().any(|item| values_equal(item, right)),
                (Value::String(value), Value::String(needle)) => value.contains(needle.as_str()),
                _ => false,
            },
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    /// Smallest first (default).
    #[default]
    Asc,
    /// Largest first.
    Desc,
}

/// Filtered, sorted, paginated query over one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    /// ANDed criteria.
    #[serde(default)]
    pub filter: Vec<Criterion>,
    /// Results to skip.
    #[serde(default)]
    pub offset: usize,
    /// Maximum results.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Path to sort by; unsorted results follow the store's natural order.
    #[serde(default)]
    pub sort_field: Option<String>,
    /// Sort direction.
    #[serde(default)]
    pub sort_order: SortOrder,
}

fn default_limit() -> usize {
    DEFAULT_QUERY_LIMIT
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            filter: Vec::new(),
            offset: 0,
            limit: DEFAULT_QUERY_LIMIT,
            sort_field: None,
            sort_order: SortOrder::Asc,
        }
    }
}

impl QuerySpec {
    /// Query returning everything up to the default limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a criterion.
    pub fn filter(mut self, criterion: Criterion) -> Self {
        self.filter.push(criterion);
        self
    }

    /// Set the page size.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Set the number of results to skip.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Sort by `field`.
    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_field = Some(field.into());
        self.sort_order = order;
        self
    }

    /// Whether every criterion matches.
    pub fn matches(&self, document: &Value) -> bool {
        all_match(&self.filter, document)
    }

    /// Ordering of two documents by the sort field.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let Some(field) = &self.sort_field else {
            return Ordering::Equal;
        };
        let left = lookup(a, field).unwrap_or(&Value::Null);
        let right = lookup(b, field).unwrap_or(&Value::Null);
        let ordering = compare(left, right).unwrap_or(Ordering::Equal);
        match self.sort_order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

/// Whether every criterion matches `document`.
pub fn all_match(criteria: &[Criterion], document: &Value) -> bool {
    criteria.iter().all(|criterion| criterion.matches(document))
}

/// Whether `path` is a safe dotted field path (`[A-Za-z0-9_]` segments).
pub fn is_valid_path(path: &str) -> bool {
    !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

/// Resolve a dotted path inside a JSON document.
pub fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn like(value: &str, pattern: &str) -> bool {
    fn matches(value: &[char], pattern: &[char]) -> bool {
        match pattern.split_first() {
            None => value.is_empty(),
            Some((&'%', rest)) => (0..=value.len()).any(|skip| matches(&value[skip..], rest)),
            Some((&'_', rest)) => !value.is_empty() && matches(&value[1..], rest),
            Some((c, rest)) => value
                .first()
                .is_some_and(|v| v.eq_ignore_ascii_case(c))
                && matches(&value[1..], rest),
        }
    }
    let value: Vec<char> = value.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    matches(&value, &pattern)
}
