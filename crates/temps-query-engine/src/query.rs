//! In-memory representation of an analytical query.
//!
//! A [`Query`] is a plain value: the optimizer never mutates its input, it
//! builds a new `Query`. Filter trees are immutable tagged unions so rewrite
//! passes stay pure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::types::{AggregateFunction, Operator};

/// Argument of `COUNT(*)`
pub const STAR: &str = "*";

/// Reference to a field declared on the queried data source
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldRef(String);

impl FieldRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FieldRef {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for FieldRef {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggregate applied to a field, e.g. `SUM(amount)`
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct AggregateExpr {
    pub function: AggregateFunction,
    /// Field name, or `*` for `COUNT(*)`
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl AggregateExpr {
    pub fn new(function: AggregateFunction, field: impl Into<String>) -> Self {
        Self {
            function,
            field: field.into(),
            alias: None,
        }
    }

    pub fn count_star() -> Self {
        Self::new(AggregateFunction::Count, STAR)
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn is_star(&self) -> bool {
        self.field == STAR
    }

    /// Column name of the aggregate in result rows
    pub fn output_name(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None if self.is_star() => self.function.name().to_string(),
            None => format!("{}_{}", self.function.name(), self.field.to_lowercase()),
        }
    }
}

impl fmt::Display for AggregateExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.function, self.field)
    }
}

/// One entry of the select list
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectItem {
    Field(FieldRef),
    Aggregate(AggregateExpr),
}

impl SelectItem {
    pub fn field(name: impl Into<String>) -> Self {
        SelectItem::Field(FieldRef::new(name))
    }

    pub fn aggregate(function: AggregateFunction, field: impl Into<String>) -> Self {
        SelectItem::Aggregate(AggregateExpr::new(function, field))
    }

    pub fn output_name(&self) -> String {
        match self {
            SelectItem::Field(field) => field.as_str().to_string(),
            SelectItem::Aggregate(agg) => agg.output_name(),
        }
    }
}

/// Left-hand side of a predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Field { field: FieldRef },
    Literal { literal: Value },
}

/// A single `subject <operator> value` comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    #[serde(flatten)]
    pub subject: Operand,
    pub operator: Operator,
    pub value: Value,
}

impl Predicate {
    pub fn new(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self {
            subject: Operand::Field {
                field: FieldRef::new(field),
            },
            operator,
            value,
        }
    }

    /// Predicate comparing two literals, e.g. `1 = 1`
    pub fn literal(literal: Value, operator: Operator, value: Value) -> Self {
        Self {
            subject: Operand::Literal { literal },
            operator,
            value,
        }
    }

    /// Field referenced by the predicate, if any
    pub fn field(&self) -> Option<&FieldRef> {
        match &self.subject {
            Operand::Field { field } => Some(field),
            Operand::Literal { .. } => None,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subject {
            Operand::Field { field } => write!(f, "{} {} {}", field, self.operator, self.value),
            Operand::Literal { literal } => {
                write!(f, "{} {} {}", literal, self.operator, self.value)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOp::And => write!(f, "AND"),
            LogicalOp::Or => write!(f, "OR"),
            LogicalOp::Not => write!(f, "NOT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compound {
    pub op: LogicalOp,
    pub children: Vec<FilterNode>,
}

/// Recursive filter tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterNode {
    Predicate(Predicate),
    Compound(Compound),
}

impl FilterNode {
    pub fn predicate(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        FilterNode::Predicate(Predicate::new(field, operator, value))
    }

    pub fn literal(literal: Value, operator: Operator, value: Value) -> Self {
        FilterNode::Predicate(Predicate::literal(literal, operator, value))
    }

    pub fn and(children: Vec<FilterNode>) -> Self {
        FilterNode::Compound(Compound {
            op: LogicalOp::And,
            children,
        })
    }

    pub fn or(children: Vec<FilterNode>) -> Self {
        FilterNode::Compound(Compound {
            op: LogicalOp::Or,
            children,
        })
    }

    pub fn not(child: FilterNode) -> Self {
        FilterNode::Compound(Compound {
            op: LogicalOp::Not,
            children: vec![child],
        })
    }

    /// Nesting depth; a lone predicate has depth 1
    pub fn depth(&self) -> usize {
        match self {
            FilterNode::Predicate(_) => 1,
            FilterNode::Compound(c) => 1 + c.children.iter().map(Self::depth).max().unwrap_or(0),
        }
    }

    pub fn predicate_count(&self) -> usize {
        match self {
            FilterNode::Predicate(_) => 1,
            FilterNode::Compound(c) => c.children.iter().map(Self::predicate_count).sum(),
        }
    }

    /// Visit every predicate leaf in depth-first order
    pub fn for_each_predicate<'a>(&'a self, visit: &mut impl FnMut(&'a Predicate)) {
        match self {
            FilterNode::Predicate(p) => visit(p),
            FilterNode::Compound(c) => {
                for child in &c.children {
                    child.for_each_predicate(visit);
                }
            }
        }
    }
}

impl fmt::Display for FilterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterNode::Predicate(p) => write!(f, "{}", p),
            FilterNode::Compound(c) if c.op == LogicalOp::Not => match c.children.first() {
                Some(child) => write!(f, "NOT ({})", child),
                None => write!(f, "NOT ()"),
            },
            FilterNode::Compound(c) => {
                let parts: Vec<String> = c.children.iter().map(|n| format!("({})", n)).collect();
                write!(f, "{}", parts.join(&format!(" {} ", c.op)))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    /// Source field, or output column of an aggregate
    pub field: FieldRef,
    #[serde(default)]
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: FieldRef::new(field),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: FieldRef::new(field),
            direction: SortDirection::Desc,
        }
    }
}

/// Structured, data-source-agnostic analytical query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub data_source_id: String,
    pub select: Vec<SelectItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterNode>,
    #[serde(default)]
    pub group_by: Vec<FieldRef>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    /// Signed so out-of-range requests survive deserialization and are
    /// reported by validation instead of a parse failure
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl Query {
    pub fn new(data_source_id: impl Into<String>) -> Self {
        Self {
            data_source_id: data_source_id.into(),
            select: Vec::new(),
            filters: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn select_field(mut self, name: impl Into<String>) -> Self {
        self.select.push(SelectItem::field(name));
        self
    }

    pub fn select_aggregate(mut self, aggregate: AggregateExpr) -> Self {
        self.select.push(SelectItem::Aggregate(aggregate));
        self
    }

    pub fn with_filters(mut self, filters: FilterNode) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn group_by(mut self, name: impl Into<String>) -> Self {
        self.group_by.push(FieldRef::new(name));
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn aggregates(&self) -> impl Iterator<Item = &AggregateExpr> {
        self.select.iter().filter_map(|item| match item {
            SelectItem::Aggregate(agg) => Some(agg),
            SelectItem::Field(_) => None,
        })
    }

    /// Non-aggregated fields of the select list
    pub fn plain_fields(&self) -> impl Iterator<Item = &FieldRef> {
        self.select.iter().filter_map(|item| match item {
            SelectItem::Field(field) => Some(field),
            SelectItem::Aggregate(_) => None,
        })
    }

    pub fn has_aggregates(&self) -> bool {
        self.aggregates().next().is_some()
    }

    /// Whether rows are collapsed into groups
    pub fn is_grouped(&self) -> bool {
        self.has_aggregates() || !self.group_by.is_empty()
    }

    /// Column names of result rows, in select order without duplicates
    pub fn output_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::with_capacity(self.select.len());
        for item in &self.select {
            let name = item.output_name();
            if !columns.contains(&name) {
                columns.push(name);
            }
        }
        columns
    }
}
