//! Compiles a [`FetchRequest`] into one parameterized `SELECT`.
//!
//! Every literal is bound as text and cast on the server to the SQL type of
//! the field it is compared with, so values never reach the SQL string.
//! Predicates are wrapped in `COALESCE(.., false)` to keep the engine's
//! two-valued logic under `NOT`.

use serde_json::Value;
use temps_query_engine::value::{self, Collation};
use temps_query_engine::{
    AggregateExpr, AggregateFunction, DataSourceDescriptor, FetchRequest, FieldType, FilterNode,
    LogicalOp, Operand, Operator, Predicate, SelectItem, SortDirection,
};
use tokio_postgres::types::ToSql;

/// Schema-qualified table backing a data source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

/// Bound parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    TextArray(Vec<String>),
}

impl SqlParam {
    pub fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            SqlParam::Text(s) => s,
            SqlParam::TextArray(items) => items,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Number => "double precision",
        FieldType::String | FieldType::Enum => "text",
        FieldType::Boolean => "boolean",
        FieldType::Date => "timestamptz",
    }
}

fn to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct Builder<'a> {
    source: &'a DataSourceDescriptor,
    params: Vec<SqlParam>,
}

impl Builder<'_> {
    fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    fn field_type(&self, name: &str) -> FieldType {
        self.source
            .field(name)
            .map(|f| f.field_type)
            .unwrap_or(FieldType::String)
    }

    /// `CAST($n::text AS <type>)` for a scalar literal
    fn typed(&mut self, v: &Value, field_type: FieldType) -> String {
        let placeholder = self.bind(SqlParam::Text(to_text(v)));
        format!("CAST({}::text AS {})", placeholder, sql_type(field_type))
    }

    fn column(&self, name: &str) -> String {
        let column = quote_ident(name);
        match self.field_type(name) {
            FieldType::Number => format!("{}::double precision", column),
            _ => column,
        }
    }

    fn select_item(&self, item: &SelectItem) -> String {
        match item {
            SelectItem::Field(field) => {
                format!("{} AS {}", self.column(field.as_str()), quote_ident(field.as_str()))
            }
            SelectItem::Aggregate(agg) => {
                format!("{} AS {}", self.aggregate(agg), quote_ident(&agg.output_name()))
            }
        }
    }

    fn aggregate(&self, agg: &AggregateExpr) -> String {
        if agg.is_star() {
            return "COUNT(*)".to_string();
        }
        let column = quote_ident(agg.field.as_str());
        match agg.function {
            AggregateFunction::Count => format!("COUNT({})", column),
            AggregateFunction::Sum => format!("SUM({})::double precision", column),
            AggregateFunction::Avg => format!("AVG({})::double precision", column),
            AggregateFunction::Min => format!("MIN({})", self.column(agg.field.as_str())),
            AggregateFunction::Max => format!("MAX({})", self.column(agg.field.as_str())),
        }
    }

    fn filter(&mut self, node: &FilterNode) -> String {
        match node {
            FilterNode::Predicate(p) => self.predicate(p),
            FilterNode::Compound(c) => {
                let parts: Vec<String> = c.children.iter().map(|child| self.filter(child)).collect();
                match c.op {
                    LogicalOp::And if parts.is_empty() => "TRUE".to_string(),
                    LogicalOp::Or if parts.is_empty() => "FALSE".to_string(),
                    LogicalOp::And => format!("({})", parts.join(" AND ")),
                    LogicalOp::Or => format!("({})", parts.join(" OR ")),
                    LogicalOp::Not => format!("(NOT ({}))", parts.join(" AND ")),
                }
            }
        }
    }

    fn predicate(&mut self, p: &Predicate) -> String {
        let field = match &p.subject {
            Operand::Literal { literal } => {
                let holds = value::matches(literal, p.operator, &p.value, Collation::Text);
                return if holds { "TRUE" } else { "FALSE" }.to_string();
            }
            Operand::Field { field } => field.as_str(),
        };

        let column = quote_ident(field);
        let field_type = self.field_type(field);

        if p.value.is_null() {
            return match p.operator {
                Operator::Eq => format!("({} IS NULL)", column),
                Operator::Ne => format!("({} IS NOT NULL)", column),
                _ => "FALSE".to_string(),
            };
        }

        let condition = match p.operator {
            Operator::Eq => format!("{} = {}", column, self.typed(&p.value, field_type)),
            Operator::Ne => format!("{} <> {}", column, self.typed(&p.value, field_type)),
            Operator::Gt => format!("{} > {}", column, self.typed(&p.value, field_type)),
            Operator::Gte => format!("{} >= {}", column, self.typed(&p.value, field_type)),
            Operator::Lt => format!("{} < {}", column, self.typed(&p.value, field_type)),
            Operator::Lte => format!("{} <= {}", column, self.typed(&p.value, field_type)),
            Operator::In => {
                let items: Vec<String> = p
                    .value
                    .as_array()
                    .map(|items| items.iter().filter(|v| !v.is_null()).map(to_text).collect())
                    .unwrap_or_default();
                let placeholder = self.bind(SqlParam::TextArray(items));
                format!(
                    "{} = ANY(CAST({}::text[] AS {}[]))",
                    column,
                    placeholder,
                    sql_type(field_type)
                )
            }
            Operator::Between => match p.value.as_array().map(Vec::as_slice) {
                Some([low, high]) if !low.is_null() && !high.is_null() => format!(
                    "{} BETWEEN {} AND {}",
                    column,
                    self.typed(low, field_type),
                    self.typed(high, field_type)
                ),
                _ => return "FALSE".to_string(),
            },
            Operator::Contains => {
                let placeholder = self.bind(SqlParam::Text(to_text(&p.value)));
                format!("strpos({}, {}::text) > 0", column, placeholder)
            }
            Operator::StartsWith => {
                let placeholder = self.bind(SqlParam::Text(to_text(&p.value)));
                format!("starts_with({}, {}::text)", column, placeholder)
            }
        };

        format!("COALESCE({}, false)", condition)
    }
}

/// Build the statement reading one page of `request` from `table`
pub fn build_select(
    table: &TableRef,
    source: &DataSourceDescriptor,
    request: &FetchRequest,
) -> SelectStatement {
    let mut builder = Builder {
        source,
        params: Vec::new(),
    };
    let query = &request.query;

    let select: Vec<String> = query
        .select
        .iter()
        .filter(|item| request.projection.contains(&item.output_name()))
        .map(|item| builder.select_item(item))
        .collect();
    let select = if select.is_empty() {
        "NULL".to_string()
    } else {
        select.join(", ")
    };

    let mut sql = format!("SELECT {} FROM {}", select, table.quoted());

    if let Some(filter) = &query.filters {
        let condition = builder.filter(filter);
        sql.push_str(" WHERE ");
        sql.push_str(&condition);
    }

    if !query.group_by.is_empty() {
        let columns: Vec<String> = query.group_by.iter().map(|f| quote_ident(f.as_str())).collect();
        sql.push_str(" GROUP BY ");
        sql.push_str(&columns.join(", "));
    }

    if !query.order_by.is_empty() {
        let keys: Vec<String> = query
            .order_by
            .iter()
            .map(|o| match o.direction {
                SortDirection::Asc => format!("{} ASC NULLS FIRST", quote_ident(o.field.as_str())),
                SortDirection::Desc => format!("{} DESC NULLS LAST", quote_ident(o.field.as_str())),
            })
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&keys.join(", "));
    }

    sql.push_str(&format!(" LIMIT {} OFFSET {}", request.limit, request.offset));

    SelectStatement {
        sql,
        params: builder.params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use temps_query_engine::{
        AggregateExpr, Field, OrderBy, Optimizer, Query, TenantContext,
    };

    fn orders() -> DataSourceDescriptor {
        DataSourceDescriptor::new("orders", "Orders")
            .with_field(Field::new("tenantId", FieldType::String))
            .with_field(Field::new("region", FieldType::String))
            .with_field(Field::new("status", FieldType::Enum).with_enum_values(["OPEN", "CLOSED"]))
            .with_field(Field::new("amount", FieldType::Number).aggregatable())
            .with_field(Field::new("placed_at", FieldType::Date).nullable())
    }

    fn request(query: &Query, limit: usize) -> FetchRequest {
        let tenant = TenantContext::new("t1");
        let optimized = Optimizer::new().optimize(query, &orders(), &tenant);
        FetchRequest {
            query: optimized.query,
            projection: optimized.projection,
            limit,
            offset: 0,
            tenant,
            source: optimized.source,
        }
    }

    fn table() -> TableRef {
        TableRef::new("public", "orders")
    }

    #[test]
    fn test_grouped_aggregate_statement() {
        let query = Query::new("orders")
            .select_field("region")
            .select_aggregate(AggregateExpr::new(AggregateFunction::Sum, "amount"))
            .group_by("region")
            .with_filters(FilterNode::predicate("status", Operator::Eq, json!("CLOSED")))
            .order_by(OrderBy::desc("sum_amount"));

        let statement = build_select(&table(), &orders(), &request(&query, 51));

        assert_eq!(
            statement.sql,
            "SELECT \"region\" AS \"region\", SUM(\"amount\")::double precision AS \"sum_amount\" \
             FROM \"public\".\"orders\" \
             WHERE (COALESCE(\"tenantId\" = CAST($1::text AS text), false) \
             AND COALESCE(\"status\" = CAST($2::text AS text), false)) \
             GROUP BY \"region\" ORDER BY \"sum_amount\" DESC NULLS LAST LIMIT 51 OFFSET 0"
        );
        assert_eq!(
            statement.params,
            vec![
                SqlParam::Text("t1".to_string()),
                SqlParam::Text("CLOSED".to_string())
            ]
        );
    }

    #[test]
    fn test_values_are_bound_not_inlined() {
        let query = Query::new("orders")
            .select_field("region")
            .with_filters(FilterNode::predicate(
                "region",
                Operator::Contains,
                json!("'; DROP TABLE orders; --"),
            ));

        let statement = build_select(&table(), &orders(), &request(&query, 10));
        assert!(!statement.sql.contains("DROP"));
        assert!(statement.sql.contains("strpos(\"region\", $2::text) > 0"));
    }

    #[test]
    fn test_null_in_and_between_predicates() {
        let query = Query::new("orders")
            .select_field("amount")
            .with_filters(FilterNode::or(vec![
                FilterNode::predicate("placed_at", Operator::Eq, Value::Null),
                FilterNode::predicate("amount", Operator::In, json!([1, 2.5])),
                FilterNode::predicate(
                    "placed_at",
                    Operator::Between,
                    json!(["2024-01-01", "2024-12-31"]),
                ),
            ]));

        let statement = build_select(&table(), &orders(), &request(&query, 10));
        assert!(statement.sql.starts_with(
            "SELECT \"amount\"::double precision AS \"amount\" FROM \"public\".\"orders\""
        ));
        assert!(statement.sql.contains("(\"placed_at\" IS NULL)"));
        assert!(statement
            .sql
            .contains("\"amount\" = ANY(CAST($2::text[] AS double precision[]))"));
        assert!(statement.sql.contains(
            "\"placed_at\" BETWEEN CAST($3::text AS timestamptz) AND CAST($4::text AS timestamptz)"
        ));
        assert_eq!(
            statement.params[1],
            SqlParam::TextArray(vec!["1".to_string(), "2.5".to_string()])
        );
    }

    #[test]
    fn test_not_keeps_two_valued_logic() {
        let query = Query::new("orders")
            .select_field("region")
            .with_filters(FilterNode::not(FilterNode::predicate(
                "amount",
                Operator::Gt,
                json!(10),
            )));

        let statement = build_select(&table(), &orders(), &request(&query, 10));
        assert!(statement
            .sql
            .contains("(NOT (COALESCE(\"amount\" > CAST($2::text AS double precision), false)))"));
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
