//! Equivalence-preserving rewrite of a validated query.
//!
//! The rewrite is a single bottom-up fold over the filter tree that
//! - replaces caller predicates on the tenant field with their truth value
//!   under the caller's tenant, then injects the real tenant predicate at
//!   the root,
//! - evaluates literal-only predicates and folds constant children,
//! - flattens nested AND/OR, collapses double NOT and duplicate children,
//! - turns `f = a AND f = b` (a != b) into `false`,
//! - orders AND children so access-path predicates run first.
//!
//! A filter folding to `false` marks the query statically empty.

use serde::Serialize;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::debug;

use crate::query::{Compound, FilterNode, LogicalOp, Operand, Predicate, Query};
use crate::types::{DataSourceDescriptor, Operator, TenantContext};
use crate::value::{self, Collation};

/// Rewrite rules that fired while optimizing a query
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rewrite {
    TenantFilterInjected,
    TenantPredicateReplaced,
    ConstantFolded,
    Contradiction,
    DuplicateRemoved,
    Flattened,
    PredicatesReordered,
    ProjectionPruned,
}

/// Output of [`Optimizer::optimize`]
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizedQuery {
    /// Query as the caller submitted it
    pub original: Query,
    /// Rewritten query handed to the executor
    pub query: Query,
    /// Columns fetched from the data source and returned to the caller
    pub projection: Vec<String>,
    /// The filter can never match; cache and data source are skipped
    pub statically_empty: bool,
    pub rewrites: Vec<Rewrite>,
    /// Schema the query was optimized against
    pub source: Arc<DataSourceDescriptor>,
}

impl OptimizedQuery {
    pub fn data_source_id(&self) -> &str {
        &self.query.data_source_id
    }
}

enum Folded {
    Const(bool),
    Node(FilterNode),
}

struct Rewriter<'a> {
    source: &'a DataSourceDescriptor,
    tenant: &'a TenantContext,
    rewrites: Vec<Rewrite>,
}

impl Rewriter<'_> {
    fn note(&mut self, rewrite: Rewrite) {
        if !self.rewrites.contains(&rewrite) {
            self.rewrites.push(rewrite);
        }
    }

    fn fold(&mut self, node: &FilterNode) -> Folded {
        match node {
            FilterNode::Predicate(p) => self.fold_predicate(p),
            FilterNode::Compound(c) => match c.op {
                LogicalOp::And => self.fold_junction(LogicalOp::And, &c.children),
                LogicalOp::Or => self.fold_junction(LogicalOp::Or, &c.children),
                LogicalOp::Not => self.fold_not(&c.children),
            },
        }
    }

    fn fold_predicate(&mut self, predicate: &Predicate) -> Folded {
        match &predicate.subject {
            Operand::Literal { literal } => {
                self.note(Rewrite::ConstantFolded);
                Folded::Const(value::matches(
                    literal,
                    predicate.operator,
                    &predicate.value,
                    Collation::Text,
                ))
            }
            Operand::Field { field } if field.as_str() == self.source.tenant_field => {
                self.note(Rewrite::TenantPredicateReplaced);
                Folded::Const(value::matches(
                    &self.tenant.as_value(),
                    predicate.operator,
                    &predicate.value,
                    self.source.collation(field.as_str()),
                ))
            }
            Operand::Field { .. } => Folded::Node(FilterNode::Predicate(predicate.clone())),
        }
    }

    fn fold_not(&mut self, children: &[FilterNode]) -> Folded {
        // Validation guarantees exactly one child
        let Some(child) = children.first() else {
            return Folded::Const(true);
        };

        match self.fold(child) {
            Folded::Const(b) => {
                self.note(Rewrite::ConstantFolded);
                Folded::Const(!b)
            }
            Folded::Node(FilterNode::Compound(Compound {
                op: LogicalOp::Not,
                mut children,
            })) if children.len() == 1 => {
                self.note(Rewrite::Flattened);
                Folded::Node(children.remove(0))
            }
            Folded::Node(inner) => Folded::Node(FilterNode::not(inner)),
        }
    }

    /// Fold an AND (absorbing element `false`) or an OR (absorbing `true`)
    fn fold_junction(&mut self, op: LogicalOp, children: &[FilterNode]) -> Folded {
        let absorbing = op == LogicalOp::Or;
        let mut kept: Vec<FilterNode> = Vec::with_capacity(children.len());

        for child in children {
            match self.fold(child) {
                Folded::Const(b) if b == absorbing => {
                    self.note(Rewrite::ConstantFolded);
                    return Folded::Const(absorbing);
                }
                Folded::Const(_) => self.note(Rewrite::ConstantFolded),
                Folded::Node(FilterNode::Compound(Compound {
                    op: child_op,
                    children: grandchildren,
                })) if child_op == op => {
                    self.note(Rewrite::Flattened);
                    for grandchild in grandchildren {
                        self.keep_unique(&mut kept, grandchild);
                    }
                }
                Folded::Node(node) => self.keep_unique(&mut kept, node),
            }
        }

        if op == LogicalOp::And {
            if has_conflicting_equalities(self.source, &kept) {
                self.note(Rewrite::Contradiction);
                return Folded::Const(false);
            }
            self.push_down(&mut kept);
        }

        match kept.len() {
            0 => Folded::Const(!absorbing),
            1 => Folded::Node(kept.remove(0)),
            _ => Folded::Node(FilterNode::Compound(Compound { op, children: kept })),
        }
    }

    fn keep_unique(&mut self, kept: &mut Vec<FilterNode>, node: FilterNode) {
        if kept.contains(&node) {
            self.note(Rewrite::DuplicateRemoved);
        } else {
            kept.push(node);
        }
    }

    /// Stable reorder: tenant predicate, access-path predicates in path
    /// order, other predicates, then compounds
    fn push_down(&mut self, children: &mut [FilterNode]) {
        let rank = |node: &FilterNode| -> (u8, usize) {
            match node {
                FilterNode::Predicate(p) => match p.field() {
                    Some(f) if f.as_str() == self.source.tenant_field => (0, 0),
                    Some(f) => match self.source.access_rank(f.as_str()) {
                        Some(i) => (1, i),
                        None => (2, 0),
                    },
                    None => (2, 0),
                },
                FilterNode::Compound(_) => (3, 0),
            }
        };

        let already_sorted = children.windows(2).all(|w| rank(&w[0]) <= rank(&w[1]));
        if !already_sorted {
            children.sort_by_key(|node| rank(node));
            self.note(Rewrite::PredicatesReordered);
        }
    }
}

/// Whether an AND's direct children pin one field to two different values
fn has_conflicting_equalities(source: &DataSourceDescriptor, children: &[FilterNode]) -> bool {
    let equalities: Vec<(&str, &serde_json::Value)> = children
        .iter()
        .filter_map(|node| match node {
            FilterNode::Predicate(p) if p.operator == Operator::Eq => {
                p.field().map(|f| (f.as_str(), &p.value))
            }
            _ => None,
        })
        .collect();

    equalities.iter().enumerate().any(|(i, (field, v))| {
        equalities[i + 1..]
            .iter()
            .any(|(other, w)| other == field && !value::equal(v, w, source.collation(field)))
    })
}

/// Stateless query rewriter
#[derive(Debug, Clone, Copy, Default)]
pub struct Optimizer;

impl Optimizer {
    pub fn new() -> Self {
        Self
    }

    /// Rewrite a validated query for execution on behalf of `tenant`
    pub fn optimize(
        &self,
        query: &Query,
        source: &DataSourceDescriptor,
        tenant: &TenantContext,
    ) -> OptimizedQuery {
        let mut rewriter = Rewriter {
            source,
            tenant,
            rewrites: Vec::new(),
        };

        let folded = match &query.filters {
            Some(filter) => rewriter.fold(filter),
            None => Folded::Const(true),
        };

        let tenant_predicate =
            FilterNode::predicate(source.tenant_field.clone(), Operator::Eq, tenant.as_value());

        let (filter, statically_empty) = match folded {
            Folded::Const(false) => (FilterNode::and(vec![tenant_predicate]), true),
            Folded::Const(true) => (FilterNode::and(vec![tenant_predicate]), false),
            Folded::Node(FilterNode::Compound(Compound {
                op: LogicalOp::And,
                children,
            })) => {
                let mut all = Vec::with_capacity(children.len() + 1);
                all.push(tenant_predicate);
                all.extend(children);
                (FilterNode::and(all), false)
            }
            Folded::Node(node) => (FilterNode::and(vec![tenant_predicate, node]), false),
        };
        rewriter.note(Rewrite::TenantFilterInjected);

        let projection = query.output_columns();
        if referenced_fields(query).iter().any(|f| !projection.contains(f)) {
            rewriter.note(Rewrite::ProjectionPruned);
        }

        let mut rewrites = rewriter.rewrites;
        rewrites.sort_by_key(|r| Reverse(*r == Rewrite::TenantFilterInjected));

        let optimized = Query {
            filters: Some(filter),
            ..query.clone()
        };

        if statically_empty {
            debug!(
                "Query on {} folded to an empty result for tenant {}",
                query.data_source_id, tenant
            );
        }

        OptimizedQuery {
            original: query.clone(),
            query: optimized,
            projection,
            statically_empty,
            rewrites,
            source: Arc::new(source.clone()),
        }
    }
}

/// Source fields a query touches anywhere
fn referenced_fields(query: &Query) -> Vec<String> {
    let mut fields: Vec<String> = query
        .plain_fields()
        .chain(query.group_by.iter())
        .chain(query.order_by.iter().map(|o| &o.field))
        .map(|f| f.as_str().to_string())
        .collect();

    if let Some(filter) = &query.filters {
        filter.for_each_predicate(&mut |p| {
            if let Some(f) = p.field() {
                fields.push(f.as_str().to_string());
            }
        });
    }

    fields.sort();
    fields.dedup();
    fields
}
