//! Property tests: optimized execution matches the reference evaluator and
//! never crosses tenants

use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use temps_query_engine::eval;
use temps_query_engine::{
    AggregateExpr, AggregateFunction, DataSourceDescriptor, EngineConfig, ExecuteOptions, Field,
    FieldType, FilterNode, InMemoryAccessor, Operator, Optimizer, OrderBy, Query, QueryEngine,
    QueryResult, Row, SchemaRegistry, TenantContext,
};

const TENANTS: [&str; 3] = ["t1", "t2", "t3"];
const REGIONS: [&str; 3] = ["EU", "US", "APAC"];
const FIELDS: [&str; 3] = ["tenantId", "region", "amount"];

fn descriptor() -> DataSourceDescriptor {
    DataSourceDescriptor::new("orders", "Orders")
        .with_field(Field::new("tenantId", FieldType::String))
        .with_field(Field::new("region", FieldType::String).aggregatable())
        .with_field(Field::new("amount", FieldType::Number).nullable().aggregatable())
        .with_access_path(["region"])
}

fn row_strategy() -> impl Strategy<Value = Row> {
    (
        prop::sample::select(TENANTS.to_vec()),
        prop::sample::select(REGIONS.to_vec()),
        prop::option::of(0i64..50),
    )
        .prop_map(|(tenant, region, amount)| {
            [
                ("tenantId".to_string(), json!(tenant)),
                ("region".to_string(), json!(region)),
                ("amount".to_string(), amount.map_or(Value::Null, |a| json!(a))),
            ]
            .into_iter()
            .collect()
        })
}

fn comparison() -> impl Strategy<Value = Operator> {
    prop::sample::select(vec![
        Operator::Eq,
        Operator::Ne,
        Operator::Gt,
        Operator::Gte,
        Operator::Lt,
        Operator::Lte,
    ])
}

fn leaf() -> impl Strategy<Value = FilterNode> {
    prop_oneof![
        (
            prop::sample::select(TENANTS.to_vec()),
            prop::sample::select(vec![Operator::Eq, Operator::Ne]),
        )
            .prop_map(|(t, op)| FilterNode::predicate("tenantId", op, json!(t))),
        prop::sample::select(REGIONS.to_vec())
            .prop_map(|r| FilterNode::predicate("region", Operator::Eq, json!(r))),
        (0i64..50, comparison())
            .prop_map(|(n, op)| FilterNode::predicate("amount", op, json!(n))),
        prop::sample::select(vec![Operator::Eq, Operator::Ne])
            .prop_map(|op| FilterNode::predicate("amount", op, Value::Null)),
        (0i64..3, 0i64..3)
            .prop_map(|(a, b)| FilterNode::literal(json!(a), Operator::Eq, json!(b))),
    ]
}

fn filter_strategy() -> impl Strategy<Value = FilterNode> {
    leaf().prop_recursive(4, 32, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..4).prop_map(FilterNode::and),
            prop::collection::vec(inner.clone(), 1..4).prop_map(FilterNode::or),
            inner.prop_map(FilterNode::not),
        ]
    })
}

fn page_strategy() -> impl Strategy<Value = (Option<i64>, Option<i64>)> {
    (prop::option::of(1i64..8), prop::option::of(0i64..4))
}

fn with_page(query: Query, (limit, offset): (Option<i64>, Option<i64>)) -> Query {
    Query {
        limit,
        offset,
        ..query
    }
}

fn direction(field: &str, descending: bool) -> OrderBy {
    if descending {
        OrderBy::desc(field)
    } else {
        OrderBy::asc(field)
    }
}

/// Ungrouped queries, possibly ordered by columns they do not select
fn listing_strategy() -> impl Strategy<Value = Query> {
    (
        prop::sample::subsequence(FIELDS.to_vec(), 1..=3),
        prop::collection::vec((prop::sample::select(FIELDS.to_vec()), any::<bool>()), 0..3),
        prop::option::of(filter_strategy()),
        page_strategy(),
    )
        .prop_map(|(select, order, filter, page)| {
            let mut query = select
                .into_iter()
                .fold(Query::new("orders"), |q, field| q.select_field(field));
            for (field, descending) in order {
                query = query.order_by(direction(field, descending));
            }
            if let Some(filter) = filter {
                query = query.with_filters(filter);
            }
            with_page(query, page)
        })
}

fn aggregates() -> Vec<AggregateExpr> {
    vec![
        AggregateExpr::count_star(),
        AggregateExpr::new(AggregateFunction::Count, "amount"),
        AggregateExpr::new(AggregateFunction::Sum, "amount"),
        AggregateExpr::new(AggregateFunction::Avg, "amount"),
        AggregateExpr::new(AggregateFunction::Min, "amount"),
        AggregateExpr::new(AggregateFunction::Max, "region"),
    ]
}

/// Grouped and global aggregates, ordered by group or aggregate columns
fn grouped_strategy() -> impl Strategy<Value = Query> {
    (
        any::<bool>(),
        prop::sample::subsequence(aggregates(), 1..=3),
        prop::option::of(any::<bool>()),
        prop::option::of(any::<bool>()),
        filter_strategy(),
        page_strategy(),
    )
        .prop_map(|(by_region, aggs, region_order, agg_order, filter, page)| {
            let mut query = Query::new("orders");
            if by_region {
                query = query.select_field("region").group_by("region");
            }

            let first_output = aggs[0].output_name();
            for agg in aggs {
                query = query.select_aggregate(agg);
            }

            if let (true, Some(descending)) = (by_region, region_order) {
                query = query.order_by(direction("region", descending));
            }
            if let Some(descending) = agg_order {
                query = query.order_by(direction(&first_output, descending));
            }

            with_page(query.with_filters(filter), page)
        })
}

fn query_strategy() -> impl Strategy<Value = Query> {
    prop_oneof![listing_strategy(), grouped_strategy()]
}

fn listing(filter: FilterNode) -> Query {
    Query::new("orders")
        .select_field("tenantId")
        .select_field("region")
        .select_field("amount")
        .with_filters(filter)
}

/// What the tenant is allowed to see: the query over its own rows only,
/// paged the way the engine pages it
fn reference(query: &Query, rows: &[Row], tenant: &str) -> Vec<Row> {
    let own: Vec<Row> = rows
        .iter()
        .filter(|row| row["tenantId"] == json!(tenant))
        .cloned()
        .collect();

    let default_limit = EngineConfig::default().default_limit as usize;
    let limit = query.limit.map_or(default_limit, |l| l as usize);
    let offset = query.offset.map_or(0, |o| o as usize);
    eval::run_page(query, &descriptor(), &own, Some(limit), offset)
}

fn execute(rows: &[Row], query: &Query, tenant: &str) -> QueryResult {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    rt.block_on(async {
        let registry = Arc::new(SchemaRegistry::new());
        registry
            .register(descriptor(), Arc::new(InMemoryAccessor::new(rows.to_vec())))
            .await
            .unwrap();
        let engine = QueryEngine::new(registry, EngineConfig::default());

        engine
            .execute(query, &TenantContext::new(tenant), &ExecuteOptions::new())
            .await
            .unwrap()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn test_optimized_execution_matches_reference(
        rows in prop::collection::vec(row_strategy(), 0..30),
        query in query_strategy(),
        tenant in prop::sample::select(TENANTS.to_vec()),
    ) {
        let result = execute(&rows, &query, tenant);

        prop_assert_eq!(&result.columns, &query.output_columns());
        prop_assert_eq!(result.rows, reference(&query, &rows, tenant));
    }

    #[test]
    fn test_optimized_filter_always_pins_tenant(
        filter in filter_strategy(),
        tenant in prop::sample::select(TENANTS.to_vec()),
    ) {
        let optimized = Optimizer::new()
            .optimize(&listing(filter), &descriptor(), &TenantContext::new(tenant));

        let Some(FilterNode::Compound(root)) = &optimized.query.filters else {
            panic!("optimized filter must be an AND root");
        };
        prop_assert_eq!(
            &root.children[0],
            &FilterNode::predicate("tenantId", Operator::Eq, json!(tenant))
        );

        // No other predicate on the tenant field survives
        let mut tenant_predicates = 0;
        optimized.query.filters.as_ref().into_iter().for_each(|f| {
            f.for_each_predicate(&mut |p| {
                if p.field().map(|f| f.as_str()) == Some("tenantId") {
                    tenant_predicates += 1;
                }
            })
        });
        prop_assert_eq!(tenant_predicates, 1);
    }

    #[test]
    fn test_engine_never_returns_other_tenants_rows(
        rows in prop::collection::vec(row_strategy(), 0..30),
        filter in filter_strategy(),
        tenant in prop::sample::select(TENANTS.to_vec()),
    ) {
        let result = execute(&rows, &listing(filter), tenant);
        prop_assert!(result.rows.iter().all(|row| row["tenantId"] == json!(tenant)));
    }
}
