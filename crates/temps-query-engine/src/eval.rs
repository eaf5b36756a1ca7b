//! Reference evaluation of a [`Query`] over in-memory rows.
//!
//! Backs [`crate::accessor::InMemoryAccessor`] and serves as the oracle for
//! optimizer equivalence tests. Rows are filtered, then either sorted and
//! projected or grouped and sorted, then paged. String comparisons follow the
//! declared type of the column: DATE columns compare chronologically, every
//! other column as text.

use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::query::{AggregateExpr, FilterNode, LogicalOp, Operand, Query, SortDirection};
use crate::types::{AggregateFunction, DataSourceDescriptor, Row};
use crate::value::{self, Collation};

/// Evaluate a filter tree against one row
pub fn matches_filter(node: &FilterNode, source: &DataSourceDescriptor, row: &Row) -> bool {
    match node {
        FilterNode::Predicate(p) => match &p.subject {
            Operand::Field { field } => value::matches(
                row.get(field.as_str()).unwrap_or(&Value::Null),
                p.operator,
                &p.value,
                source.collation(field.as_str()),
            ),
            Operand::Literal { literal } => {
                value::matches(literal, p.operator, &p.value, Collation::Text)
            }
        },
        FilterNode::Compound(c) => {
            let mut children = c.children.iter();
            match c.op {
                LogicalOp::And => children.all(|child| matches_filter(child, source, row)),
                LogicalOp::Or => children.any(|child| matches_filter(child, source, row)),
                LogicalOp::Not => !children.all(|child| matches_filter(child, source, row)),
            }
        }
    }
}

/// Run a query using its own `limit`/`offset`
pub fn run(query: &Query, source: &DataSourceDescriptor, rows: &[Row]) -> Vec<Row> {
    let limit = query.limit.and_then(|l| usize::try_from(l).ok());
    let offset = query
        .offset
        .and_then(|o| usize::try_from(o).ok())
        .unwrap_or(0);
    run_page(query, source, rows, limit, offset)
}

/// Run a query with an explicit page window
pub fn run_page(
    query: &Query,
    source: &DataSourceDescriptor,
    rows: &[Row],
    limit: Option<usize>,
    offset: usize,
) -> Vec<Row> {
    let matching: Vec<&Row> = rows
        .iter()
        .filter(|row| match &query.filters {
            Some(filter) => matches_filter(filter, source, row),
            None => true,
        })
        .collect();

    // Ungrouped queries may order by fields they do not select, so sort
    // before projecting. Grouped queries order by group or aggregate columns.
    let output: Vec<Row> = if query.is_grouped() {
        let mut grouped = group(query, source, &matching);
        sort_rows(query, source, &mut grouped);
        grouped
    } else {
        let mut sorted = matching;
        sort_by_keys(query, source, &mut sorted);
        sorted.iter().map(|row| project(query, row)).collect()
    };

    let page = output.into_iter().skip(offset);
    match limit {
        Some(limit) => page.take(limit).collect(),
        None => page.collect(),
    }
}

fn project(query: &Query, row: &Row) -> Row {
    query
        .plain_fields()
        .map(|field| {
            let value = row.get(field.as_str()).cloned().unwrap_or(Value::Null);
            (field.as_str().to_string(), value)
        })
        .collect()
}

fn group(query: &Query, source: &DataSourceDescriptor, rows: &[&Row]) -> Vec<Row> {
    let mut order: Vec<Vec<Value>> = Vec::new();
    let mut groups: HashMap<String, Vec<&Row>> = HashMap::new();

    for row in rows {
        let key: Vec<Value> = query
            .group_by
            .iter()
            .map(|f| row.get(f.as_str()).cloned().unwrap_or(Value::Null))
            .collect();
        let encoded = Value::Array(key.clone()).to_string();
        groups
            .entry(encoded)
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(row);
    }

    // A global aggregate yields exactly one row, even over no input
    if query.group_by.is_empty() && order.is_empty() {
        order.push(Vec::new());
        groups.insert(Value::Array(Vec::new()).to_string(), Vec::new());
    }

    order
        .into_iter()
        .map(|key| {
            let members = groups
                .get(&Value::Array(key.clone()).to_string())
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            let mut out = Row::new();
            for (field, value) in query.group_by.iter().zip(key) {
                out.insert(field.as_str().to_string(), value);
            }
            for agg in query.aggregates() {
                out.insert(agg.output_name(), aggregate(agg, source, members));
            }
            out
        })
        .collect()
}

/// Compute one aggregate over the rows of a group
pub fn aggregate(agg: &AggregateExpr, source: &DataSourceDescriptor, rows: &[&Row]) -> Value {
    if agg.is_star() {
        return Value::from(rows.len() as u64);
    }

    let values: Vec<&Value> = rows
        .iter()
        .filter_map(|row| row.get(agg.field.as_str()))
        .filter(|v| !v.is_null())
        .collect();
    let collation = source.collation(agg.field.as_str());

    match agg.function {
        AggregateFunction::Count => Value::from(values.len() as u64),
        AggregateFunction::Sum => {
            let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                float(numbers.iter().sum())
            }
        }
        AggregateFunction::Avg => {
            let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                float(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        AggregateFunction::Min => values
            .into_iter()
            .min_by(|a, b| value::sort_order(a, b, collation))
            .cloned()
            .unwrap_or(Value::Null),
        AggregateFunction::Max => values
            .into_iter()
            .max_by(|a, b| value::sort_order(a, b, collation))
            .cloned()
            .unwrap_or(Value::Null),
    }
}

fn float(x: f64) -> Value {
    Number::from_f64(x).map(Value::Number).unwrap_or(Value::Null)
}

/// Stable sort by the query's `order_by` keys
pub fn sort_rows(query: &Query, source: &DataSourceDescriptor, rows: &mut [Row]) {
    if !query.order_by.is_empty() {
        let collations = order_collations(query, source);
        rows.sort_by(|a, b| compare_rows(query, &collations, a, b));
    }
}

fn sort_by_keys(query: &Query, source: &DataSourceDescriptor, rows: &mut [&Row]) {
    if !query.order_by.is_empty() {
        let collations = order_collations(query, source);
        rows.sort_by(|a, b| compare_rows(query, &collations, a, b));
    }
}

/// Collation of each order-by column. MIN/MAX outputs keep the type of the
/// field they aggregate.
fn order_collations(query: &Query, source: &DataSourceDescriptor) -> Vec<Collation> {
    query
        .order_by
        .iter()
        .map(|order| {
            let name = order.field.as_str();
            match query.aggregates().find(|agg| agg.output_name() == name) {
                Some(agg) if matches!(agg.function, AggregateFunction::Min | AggregateFunction::Max) => {
                    source.collation(agg.field.as_str())
                }
                Some(_) => Collation::Text,
                None => source.collation(name),
            }
        })
        .collect()
}

fn compare_rows(query: &Query, collations: &[Collation], a: &Row, b: &Row) -> Ordering {
    for (order, collation) in query.order_by.iter().zip(collations) {
        let left = a.get(order.field.as_str()).unwrap_or(&Value::Null);
        let right = b.get(order.field.as_str()).unwrap_or(&Value::Null);
        let ordering = match order.direction {
            SortDirection::Asc => value::sort_order(left, right, *collation),
            SortDirection::Desc => value::sort_order(right, left, *collation),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{OrderBy, SelectItem};
    use crate::types::{Field, FieldType, Operator};
    use serde_json::json;

    fn orders() -> DataSourceDescriptor {
        DataSourceDescriptor::new("orders", "Orders")
            .with_field(Field::new("region", FieldType::String))
            .with_field(Field::new("status", FieldType::String))
            .with_field(Field::new("amount", FieldType::Number).aggregatable())
            .with_field(Field::new("placed_at", FieldType::Date).aggregatable())
            .with_field(Field::new("reference", FieldType::String).aggregatable())
    }

    fn row(region: &str, status: &str, amount: i64) -> Row {
        [
            ("region".to_string(), json!(region)),
            ("status".to_string(), json!(status)),
            ("amount".to_string(), json!(amount)),
        ]
        .into_iter()
        .collect()
    }

    fn rows() -> Vec<Row> {
        vec![
            row("EU", "CLOSED", 10),
            row("US", "CLOSED", 5),
            row("EU", "OPEN", 7),
            row("EU", "CLOSED", 20),
        ]
    }

    #[test]
    fn test_group_and_sum() {
        let query = Query::new("orders")
            .select_field("region")
            .select_aggregate(AggregateExpr::new(AggregateFunction::Sum, "amount"))
            .group_by("region")
            .with_filters(FilterNode::predicate("status", Operator::Eq, json!("CLOSED")))
            .order_by(OrderBy::asc("region"));

        let out = run(&query, &orders(), &rows());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["region"], json!("EU"));
        assert_eq!(out[0]["sum_amount"], json!(30.0));
        assert_eq!(out[1]["region"], json!("US"));
        assert_eq!(out[1]["sum_amount"], json!(5.0));
    }

    #[test]
    fn test_global_aggregate_over_empty_input() {
        let query = Query::new("orders")
            .select_aggregate(AggregateExpr::count_star())
            .select_aggregate(AggregateExpr::new(AggregateFunction::Sum, "amount"));

        let out = run(&query, &orders(), &[]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["count"], json!(0));
        assert_eq!(out[0]["sum_amount"], Value::Null);
    }

    #[test]
    fn test_projection_order_and_paging() {
        let query = Query::new("orders")
            .select_field("amount")
            .order_by(OrderBy::desc("amount"))
            .with_offset(1)
            .with_limit(2);

        let out = run(&query, &orders(), &rows());
        let amounts: Vec<Value> = out.iter().map(|r| r["amount"].clone()).collect();
        assert_eq!(amounts, vec![json!(10), json!(7)]);
        assert!(out.iter().all(|r| r.len() == 1));
    }

    #[test]
    fn test_order_by_unselected_field() {
        let query = Query::new("orders")
            .select_field("region")
            .order_by(OrderBy::desc("amount"));

        let out = run(&query, &orders(), &rows());
        let regions: Vec<Value> = out.iter().map(|r| r["region"].clone()).collect();
        assert_eq!(regions, vec![json!("EU"), json!("EU"), json!("EU"), json!("US")]);
        assert!(out.iter().all(|r| !r.contains_key("amount")));
    }

    #[test]
    fn test_not_and_or() {
        let filter = FilterNode::or(vec![
            FilterNode::predicate("region", Operator::Eq, json!("US")),
            FilterNode::not(FilterNode::predicate("status", Operator::Eq, json!("CLOSED"))),
        ]);
        let query = Query {
            select: vec![SelectItem::field("amount")],
            ..Query::new("orders").with_filters(filter)
        };

        let out = run(&query, &orders(), &rows());
        assert_eq!(out.len(), 2);
    }

    fn stamped(placed_at: &str) -> Row {
        [
            ("placed_at".to_string(), json!(placed_at)),
            ("reference".to_string(), json!(placed_at)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_dates_compare_by_declared_type() {
        let rows = vec![stamped("2024-01-01T00:00:00Z"), stamped("2024-01-01")];

        let on_date = Query::new("orders")
            .select_field("placed_at")
            .with_filters(FilterNode::predicate("placed_at", Operator::Eq, json!("2024-01-01")));
        assert_eq!(run(&on_date, &orders(), &rows).len(), 2);

        let on_text = Query::new("orders")
            .select_field("reference")
            .with_filters(FilterNode::predicate("reference", Operator::Eq, json!("2024-01-01")));
        assert_eq!(run(&on_text, &orders(), &rows).len(), 1);
    }

    #[test]
    fn test_max_of_text_column_is_lexicographic() {
        let rows = vec![stamped("2024-02-01T00:00:00+05:00"), stamped("2024-01-31T23:00:00Z")];
        let query = Query::new("orders")
            .select_aggregate(AggregateExpr::new(AggregateFunction::Max, "placed_at"))
            .select_aggregate(AggregateExpr::new(AggregateFunction::Max, "reference"));

        let out = run(&query, &orders(), &rows);
        assert_eq!(out[0]["max_placed_at"], json!("2024-01-31T23:00:00Z"));
        assert_eq!(out[0]["max_reference"], json!("2024-02-01T00:00:00+05:00"));
    }
}
