use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::value;

/// Field data types a data source can declare
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// UTF-8 string
    String,
    /// Integer or floating point number
    Number,
    /// Boolean true/false
    Boolean,
    /// ISO 8601 date or RFC 3339 timestamp
    Date,
    /// String restricted to a declared set of variants
    Enum,
}

impl FieldType {
    /// Operators that may be applied to a field of this type
    pub fn operators(&self) -> &'static [Operator] {
        match self {
            FieldType::Number => &[
                Operator::Eq,
                Operator::Ne,
                Operator::Gt,
                Operator::Gte,
                Operator::Lt,
                Operator::Lte,
                Operator::In,
                Operator::Between,
            ],
            FieldType::String => &[
                Operator::Eq,
                Operator::Ne,
                Operator::Contains,
                Operator::StartsWith,
                Operator::In,
            ],
            FieldType::Date => &[
                Operator::Eq,
                Operator::Ne,
                Operator::Gt,
                Operator::Gte,
                Operator::Lt,
                Operator::Lte,
                Operator::Between,
            ],
            FieldType::Boolean => &[Operator::Eq, Operator::Ne],
            FieldType::Enum => &[Operator::Eq, Operator::Ne, Operator::In],
        }
    }

    /// Check if an operator is valid for this type
    pub fn supports(&self, operator: Operator) -> bool {
        self.operators().contains(&operator)
    }

    /// Check if a single scalar literal type-checks against this type.
    /// `null` is handled by the caller since it depends on nullability.
    pub fn accepts_scalar(&self, value: &serde_json::Value, enum_values: Option<&[String]>) -> bool {
        match (self, value) {
            (FieldType::Number, serde_json::Value::Number(_)) => true,
            (FieldType::String, serde_json::Value::String(_)) => true,
            (FieldType::Boolean, serde_json::Value::Bool(_)) => true,
            (FieldType::Date, serde_json::Value::String(s)) => value::parse_date(s).is_some(),
            (FieldType::Enum, serde_json::Value::String(s)) => match enum_values {
                Some(variants) => variants.iter().any(|v| v == s),
                None => true,
            },
            _ => false,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Number => write!(f, "number"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Date => write!(f, "date"),
            FieldType::Enum => write!(f, "enum"),
        }
    }
}

/// Comparison operators usable in a predicate
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "between")]
    Between,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "starts_with")]
    StartsWith,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::Eq => write!(f, "="),
            Operator::Ne => write!(f, "!="),
            Operator::Gt => write!(f, ">"),
            Operator::Gte => write!(f, ">="),
            Operator::Lt => write!(f, "<"),
            Operator::Lte => write!(f, "<="),
            Operator::In => write!(f, "IN"),
            Operator::Between => write!(f, "BETWEEN"),
            Operator::Contains => write!(f, "CONTAINS"),
            Operator::StartsWith => write!(f, "STARTS_WITH"),
        }
    }
}

/// Aggregate functions usable in a select list
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Count => "count",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name().to_uppercase())
    }
}

/// Definition of a single queryable field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Field name, matched case-sensitively
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether field may hold null
    pub nullable: bool,
    /// Whether aggregate functions may be applied
    pub aggregatable: bool,
    /// Whether predicates may reference the field
    pub filterable: bool,
    /// Allowed variants for enum fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Field {
    /// Create a non-nullable, filterable, non-aggregatable field
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
            aggregatable: false,
            filterable: true,
            enum_values: None,
            description: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn aggregatable(mut self) -> Self {
        self.aggregatable = true;
        self
    }

    pub fn not_filterable(mut self) -> Self {
        self.filterable = false;
        self
    }

    pub fn with_enum_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Default name of the field carrying the tenant identifier
pub const DEFAULT_TENANT_FIELD: &str = "tenantId";

fn default_tenant_field() -> String {
    DEFAULT_TENANT_FIELD.to_string()
}

/// Schema of a queryable data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    /// Identifier referenced by `Query::data_source_id`
    pub id: String,
    /// Human readable name
    pub display_name: String,
    /// Declared fields, in declaration order
    pub fields: Vec<Field>,
    /// Field holding the owning tenant of each row
    #[serde(default = "default_tenant_field")]
    pub tenant_field: String,
    /// Indexed/partition fields, cheapest first
    #[serde(default)]
    pub access_path: Vec<String>,
}

impl DataSourceDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            fields: Vec::new(),
            tenant_field: default_tenant_field(),
            access_path: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_tenant_field(mut self, tenant_field: impl Into<String>) -> Self {
        self.tenant_field = tenant_field.into();
        self
    }

    pub fn with_access_path<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.access_path = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Look up a field by its exact name
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// How values of a field compare; undeclared names compare as text
    pub fn collation(&self, name: &str) -> value::Collation {
        self.field(name)
            .map(|f| value::Collation::for_type(f.field_type))
            .unwrap_or_default()
    }

    /// Position of a field on the access path, if it is on it
    pub fn access_rank(&self, name: &str) -> Option<usize> {
        self.access_path.iter().position(|f| f == name)
    }
}

/// A row of data as key-value pairs
pub type Row = HashMap<String, serde_json::Value>;

/// Caller identity used for tenant isolation.
///
/// Built by the authenticated request layer; a query can never supply it.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    tenant_id: String,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// The tenant identifier as a filter literal
    pub fn as_value(&self) -> serde_json::Value {
        serde_json::Value::String(self.tenant_id.clone())
    }
}

impl fmt::Display for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operator_compatibility() {
        assert!(FieldType::Number.supports(Operator::Between));
        assert!(FieldType::String.supports(Operator::StartsWith));
        assert!(!FieldType::String.supports(Operator::Gt));
        assert!(FieldType::Date.supports(Operator::Lte));
        assert!(!FieldType::Date.supports(Operator::Contains));
        assert!(!FieldType::Boolean.supports(Operator::In));
    }

    #[test]
    fn test_operator_serde_symbols() {
        assert_eq!(serde_json::to_value(Operator::Gte).unwrap(), json!(">="));
        let op: Operator = serde_json::from_value(json!("starts_with")).unwrap();
        assert_eq!(op, Operator::StartsWith);
    }

    #[test]
    fn test_accepts_scalar() {
        assert!(FieldType::Date.accepts_scalar(&json!("2024-02-29"), None));
        assert!(!FieldType::Date.accepts_scalar(&json!("yesterday"), None));
        assert!(!FieldType::Number.accepts_scalar(&json!("42"), None));

        let variants = vec!["OPEN".to_string(), "CLOSED".to_string()];
        assert!(FieldType::Enum.accepts_scalar(&json!("OPEN"), Some(&variants)));
        assert!(!FieldType::Enum.accepts_scalar(&json!("open"), Some(&variants)));
    }

    #[test]
    fn test_descriptor_lookup_is_case_sensitive() {
        let source = DataSourceDescriptor::new("orders", "Orders")
            .with_field(Field::new("region", FieldType::String))
            .with_access_path(["region"]);

        assert!(source.field("region").is_some());
        assert!(source.field("Region").is_none());
        assert_eq!(source.access_rank("region"), Some(0));
        assert_eq!(source.tenant_field, DEFAULT_TENANT_FIELD);
    }
}
