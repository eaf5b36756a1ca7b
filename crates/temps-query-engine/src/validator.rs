//! Structural and semantic checks of a query against its data source schema.
//!
//! Validation never fails fast: every applicable problem is collected so the
//! caller sees them all at once.

use serde_json::Value;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{ValidationError, ValidationErrorCode, ValidationResult};
use crate::query::{AggregateExpr, FilterNode, LogicalOp, Operand, Predicate, Query, SelectItem};
use crate::types::{AggregateFunction, DataSourceDescriptor, Field, FieldType, Operator};
use crate::value::{self, ValueKind};

/// Limits enforced on every query
#[derive(Debug, Clone, Copy)]
struct Limits {
    max_limit: u64,
    max_filter_depth: usize,
    max_filter_breadth: usize,
    max_filter_predicates: usize,
}

pub struct Validator {
    limits: Limits,
}

impl Validator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            limits: Limits {
                max_limit: config.max_limit,
                max_filter_depth: config.max_filter_depth,
                max_filter_breadth: config.max_filter_breadth,
                max_filter_predicates: config.max_filter_predicates,
            },
        }
    }

    /// Validate a query. `source` is `None` when the registry has no schema
    /// for `query.data_source_id`.
    pub fn validate(&self, query: &Query, source: Option<&DataSourceDescriptor>) -> ValidationResult {
        let mut checker = Checker {
            errors: Vec::new(),
            limits: self.limits,
        };

        checker.check_page(query);
        let filter_ok = match &query.filters {
            Some(filter) => checker.check_filter_shape(filter),
            None => true,
        };

        match source {
            None => checker.push(ValidationError::new(
                ValidationErrorCode::UnknownDataSource,
                format!("Unknown data source '{}'", query.data_source_id),
            )),
            Some(source) => {
                checker.check_select(query, source);
                checker.check_grouping(query, source);
                checker.check_order(query, source);
                if let (Some(filter), true) = (&query.filters, filter_ok) {
                    filter.for_each_predicate(&mut |p| checker.check_predicate(p, source));
                }
            }
        }

        if !checker.errors.is_empty() {
            debug!(
                "Query on {} failed validation with {} error(s)",
                query.data_source_id,
                checker.errors.len()
            );
        }

        ValidationResult::from_errors(checker.errors)
    }
}

struct Checker {
    errors: Vec<ValidationError>,
    limits: Limits,
}

impl Checker {
    fn push(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    fn fail(&mut self, code: ValidationErrorCode, field: &str, message: String) {
        self.push(ValidationError::for_field(code, field, message));
    }

    /// Resolve a field, recording `UNKNOWN_FIELD` when it is not declared
    fn resolve<'s>(&mut self, source: &'s DataSourceDescriptor, name: &str) -> Option<&'s Field> {
        let field = source.field(name);
        if field.is_none() {
            self.fail(
                ValidationErrorCode::UnknownField,
                name,
                format!("Unknown field '{}' on data source '{}'", name, source.id),
            );
        }
        field
    }

    fn check_page(&mut self, query: &Query) {
        if let Some(limit) = query.limit {
            let in_range = u64::try_from(limit)
                .map(|l| l >= 1 && l <= self.limits.max_limit)
                .unwrap_or(false);
            if !in_range {
                self.push(ValidationError::new(
                    ValidationErrorCode::LimitOutOfRange,
                    format!(
                        "limit must be between 1 and {}, got {}",
                        self.limits.max_limit, limit
                    ),
                ));
            }
        }

        if let Some(offset) = query.offset {
            if offset < 0 {
                self.push(ValidationError::new(
                    ValidationErrorCode::LimitOutOfRange,
                    format!("offset must be non-negative, got {}", offset),
                ));
            }
        }
    }

    fn check_select(&mut self, query: &Query, source: &DataSourceDescriptor) {
        if query.select.is_empty() {
            self.push(ValidationError::new(
                ValidationErrorCode::UnknownField,
                "select list must name at least one field or aggregate",
            ));
        }

        for field in query.plain_fields() {
            self.resolve(source, field.as_str());
        }

        for agg in query.aggregates() {
            self.check_aggregate(agg, source);
        }

        self.check_output_names(query);
    }

    /// Two different select items must not produce the same result column
    fn check_output_names(&mut self, query: &Query) {
        let mut seen: Vec<(String, &SelectItem)> = Vec::with_capacity(query.select.len());
        let mut reported: Vec<String> = Vec::new();

        for item in &query.select {
            let name = item.output_name();
            let clash = seen
                .iter()
                .any(|(other, earlier)| *other == name && *earlier != item);
            if clash && !reported.contains(&name) {
                self.fail(
                    ValidationErrorCode::UngroupedField,
                    &name,
                    format!("Output column '{}' is produced by more than one select item", name),
                );
                reported.push(name.clone());
            }
            seen.push((name, item));
        }
    }

    fn check_aggregate(&mut self, agg: &AggregateExpr, source: &DataSourceDescriptor) {
        if agg.is_star() {
            if agg.function != AggregateFunction::Count {
                self.fail(
                    ValidationErrorCode::UnsupportedOperator,
                    &agg.field,
                    format!("{} cannot be applied to *", agg.function),
                );
            }
            return;
        }

        let Some(field) = self.resolve(source, &agg.field) else {
            return;
        };

        if !field.aggregatable {
            self.fail(
                ValidationErrorCode::UnsupportedOperator,
                &field.name,
                format!("Field '{}' is not aggregatable", field.name),
            );
            return;
        }

        let numeric_only = matches!(agg.function, AggregateFunction::Sum | AggregateFunction::Avg);
        if numeric_only && field.field_type != FieldType::Number {
            self.fail(
                ValidationErrorCode::TypeMismatch,
                &field.name,
                format!(
                    "{} requires a number field, '{}' is {}",
                    agg.function, field.name, field.field_type
                ),
            );
        }
    }

    fn check_grouping(&mut self, query: &Query, source: &DataSourceDescriptor) {
        for field in &query.group_by {
            self.resolve(source, field.as_str());
        }

        if !query.is_grouped() {
            return;
        }

        for field in query.plain_fields() {
            if !query.group_by.contains(field) {
                self.fail(
                    ValidationErrorCode::UngroupedField,
                    field.as_str(),
                    format!(
                        "Field '{}' is selected next to aggregates but missing from group_by",
                        field
                    ),
                );
            }
        }

        for field in &query.group_by {
            let selected = query.plain_fields().any(|f| f == field);
            if !selected && source.field(field.as_str()).is_some() {
                self.fail(
                    ValidationErrorCode::UngroupedField,
                    field.as_str(),
                    format!("Grouped field '{}' must also be selected", field),
                );
            }
        }
    }

    fn check_order(&mut self, query: &Query, source: &DataSourceDescriptor) {
        let aggregate_columns: Vec<String> = query.aggregates().map(|a| a.output_name()).collect();

        for order in &query.order_by {
            let name = order.field.as_str();
            if aggregate_columns.iter().any(|c| c == name) {
                continue;
            }
            if self.resolve(source, name).is_none() {
                continue;
            }
            if query.is_grouped() && !query.group_by.contains(&order.field) {
                self.fail(
                    ValidationErrorCode::UngroupedField,
                    name,
                    format!(
                        "Grouped queries can only order by group fields or aggregates, not '{}'",
                        name
                    ),
                );
            }
        }
    }

    /// Bound depth, breadth and size of the filter tree. Walks with an
    /// explicit stack so pathological trees cannot exhaust the call stack.
    fn check_filter_shape(&mut self, filter: &FilterNode) -> bool {
        let limits = self.limits;
        let mut stack: Vec<(&FilterNode, usize)> = vec![(filter, 1)];
        let mut predicates = 0usize;
        let mut problem: Option<String> = None;

        while let Some((node, depth)) = stack.pop() {
            if depth > limits.max_filter_depth {
                problem = Some(format!(
                    "filter nesting exceeds the maximum depth of {}",
                    limits.max_filter_depth
                ));
                break;
            }

            match node {
                FilterNode::Predicate(_) => {
                    predicates += 1;
                    if predicates > limits.max_filter_predicates {
                        problem = Some(format!(
                            "filter has more than {} predicates",
                            limits.max_filter_predicates
                        ));
                        break;
                    }
                }
                FilterNode::Compound(c) => {
                    if c.op == LogicalOp::Not && c.children.len() != 1 {
                        problem = Some(format!(
                            "NOT takes exactly one child, got {}",
                            c.children.len()
                        ));
                        break;
                    }
                    if c.children.len() > limits.max_filter_breadth {
                        problem = Some(format!(
                            "{} has {} children, the maximum is {}",
                            c.op,
                            c.children.len(),
                            limits.max_filter_breadth
                        ));
                        break;
                    }
                    stack.extend(c.children.iter().map(|child| (child, depth + 1)));
                }
            }
        }

        match problem {
            Some(message) => {
                self.push(ValidationError::new(
                    ValidationErrorCode::FilterTooComplex,
                    message,
                ));
                false
            }
            None => true,
        }
    }

    fn check_predicate(&mut self, predicate: &Predicate, source: &DataSourceDescriptor) {
        match &predicate.subject {
            Operand::Literal { literal } => self.check_literal_predicate(literal, predicate),
            Operand::Field { field } => {
                let Some(field) = self.resolve(source, field.as_str()) else {
                    return;
                };
                self.check_field_predicate(field, predicate);
            }
        }
    }

    fn check_field_predicate(&mut self, field: &Field, predicate: &Predicate) {
        let operator = predicate.operator;

        if !field.filterable {
            self.fail(
                ValidationErrorCode::UnsupportedOperator,
                &field.name,
                format!("Field '{}' cannot be filtered on", field.name),
            );
            return;
        }

        if !field.field_type.supports(operator) {
            self.fail(
                ValidationErrorCode::UnsupportedOperator,
                &field.name,
                format!(
                    "Operator {} is not supported for {} field '{}'",
                    operator, field.field_type, field.name
                ),
            );
            return;
        }

        let enum_values = field.enum_values.as_deref();
        let accepts = |v: &Value| field.field_type.accepts_scalar(v, enum_values);

        let well_typed = match operator {
            Operator::In => predicate
                .value
                .as_array()
                .is_some_and(|items| !items.is_empty() && items.iter().all(accepts)),
            Operator::Between => match predicate.value.as_array().map(Vec::as_slice) {
                Some([low, high]) => accepts(low) && accepts(high),
                _ => false,
            },
            Operator::Eq | Operator::Ne if predicate.value.is_null() => field.nullable,
            _ => accepts(&predicate.value),
        };

        if !well_typed {
            self.fail(
                ValidationErrorCode::TypeMismatch,
                &field.name,
                format!(
                    "Value {} does not fit operator {} on {} field '{}'",
                    predicate.value, operator, field.field_type, field.name
                ),
            );
        }
    }

    fn check_literal_predicate(&mut self, literal: &Value, predicate: &Predicate) {
        let literal_kind = value::kind(literal);
        let scalar = |kind: ValueKind| !matches!(kind, ValueKind::Array | ValueKind::Object);
        let same_kind = |v: &Value| value::kind(v) == literal_kind;

        let well_typed = scalar(literal_kind)
            && match predicate.operator {
                Operator::In => predicate
                    .value
                    .as_array()
                    .is_some_and(|items| !items.is_empty() && items.iter().all(same_kind)),
                Operator::Between => match predicate.value.as_array().map(Vec::as_slice) {
                    Some([low, high]) => same_kind(low) && same_kind(high),
                    _ => false,
                },
                Operator::Contains | Operator::StartsWith => {
                    literal_kind == ValueKind::String && same_kind(&predicate.value)
                }
                Operator::Eq | Operator::Ne => {
                    predicate.value.is_null() || same_kind(&predicate.value)
                }
                _ => literal_kind != ValueKind::Null && same_kind(&predicate.value),
            };

        if !well_typed {
            self.push(ValidationError::new(
                ValidationErrorCode::TypeMismatch,
                format!("Literal comparison {} is not well typed", predicate),
            ));
        }
    }
}
