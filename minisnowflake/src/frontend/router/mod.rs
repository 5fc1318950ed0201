//! Query planner.
//!
//! Rewrites a parsed SELECT into a per-shard map query and an iterative
//! reduce query whose composition is equivalent to the original statement.

use thiserror::Error;

use crate::sharding::{DataType, Schema, Value};

pub mod aggregate;
pub mod parser;

pub use aggregate::OutputExpr;
pub use parser::{ParseError, Select, SelectItem, Statement};

use parser::AggregateArg;

/// Placeholder relation name reduce queries select from; workers execute
/// them over the partials supplied in the request.
pub const REDUCE_SOURCE: &str = "partials";

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("unknown column \"{0}\"")]
    UnknownColumn(String),
}

/// How partial results combine into the final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMode {
    /// Concatenate partials.
    PassThrough,
    /// Aggregation without GROUP BY; exactly one output row.
    Scalar,
    /// Aggregation with GROUP BY; one output row per key tuple.
    Grouped,
}

/// Immutable execution plan for one SELECT.
#[derive(Debug, Clone)]
pub struct PlannedQuery {
    /// Query every map task runs over its shard.
    pub map_sql: String,
    /// Query reduce tasks run over groups of partials; None in
    /// pass-through mode.
    pub reduce_sql: Option<String>,
    /// Schema every partial (map or reduce output) must match.
    pub partial_columns: Vec<String>,
    pub partial_types: Vec<DataType>,
    /// Schema of the result returned to the client.
    pub output_columns: Vec<String>,
    pub output_types: Vec<DataType>,
    pub mode: AggregationMode,
    /// Final local projection, one entry per user SELECT item.
    pub finalizers: Vec<OutputExpr>,
    /// In scalar mode, the partial row a map task produces over an empty
    /// input; answers aggregation over a table with no shards.
    pub empty_partial_row: Vec<Value>,
}

/// Plan a SELECT against the resolved table schema.
pub fn plan(select: &Select, schema: &Schema) -> Result<PlannedQuery, Error> {
    for predicate in &select.filter {
        resolve(schema, &predicate.column)?;
    }

    if !select.has_aggregates() && select.group_by.is_empty() {
        return plan_pass_through(select, schema);
    }

    plan_aggregation(select, schema)
}

fn resolve(schema: &Schema, column: &str) -> Result<usize, Error> {
    schema
        .column_index(column)
        .ok_or_else(|| Error::UnknownColumn(column.to_string()))
}

fn plan_pass_through(select: &Select, schema: &Schema) -> Result<PlannedQuery, Error> {
    let mut columns = vec![];
    let mut types = vec![];

    for item in &select.projection {
        match item {
            SelectItem::Star => {
                columns.extend(schema.names());
                types.extend(schema.types());
            }
            SelectItem::Column { name, alias } => {
                let index = resolve(schema, name)?;
                columns.push(alias.clone().unwrap_or_else(|| name.clone()));
                types.push(schema.columns[index].data_type);
            }
            SelectItem::Aggregate { .. } => unreachable!("pass-through has no aggregates"),
        }
    }

    let finalizers = (0..columns.len()).map(OutputExpr::Column).collect();

    Ok(PlannedQuery {
        map_sql: select.to_string(),
        reduce_sql: None,
        partial_columns: columns.clone(),
        partial_types: types.clone(),
        output_columns: columns,
        output_types: types,
        mode: AggregationMode::PassThrough,
        finalizers,
        empty_partial_row: vec![],
    })
}

fn plan_aggregation(select: &Select, schema: &Schema) -> Result<PlannedQuery, Error> {
    let mode = if select.group_by.is_empty() {
        AggregationMode::Scalar
    } else {
        AggregationMode::Grouped
    };

    // Partial layout: GROUP BY columns first, helper columns after, in
    // aggregate appearance order.
    let mut partial_columns = vec![];
    let mut partial_types = vec![];
    let mut map_items = vec![];
    let mut reduce_items = vec![];

    for name in &select.group_by {
        let index = resolve(schema, name)?;
        partial_columns.push(name.clone());
        partial_types.push(schema.columns[index].data_type);

        let column = SelectItem::Column {
            name: name.clone(),
            alias: None,
        };
        map_items.push(column.clone());
        reduce_items.push(column);
    }

    let mut output_columns = vec![];
    let mut output_types = vec![];
    let mut finalizers = vec![];
    let mut empty_partial_row = vec![];
    let mut ordinal = 0;

    for item in &select.projection {
        match item {
            SelectItem::Star => unreachable!("validated by the parser"),

            SelectItem::Column { name, alias } => {
                let group_index = select
                    .group_by
                    .iter()
                    .position(|g| g == name)
                    .expect("validated by the parser");
                output_columns.push(alias.clone().unwrap_or_else(|| name.clone()));
                output_types.push(partial_types[group_index]);
                finalizers.push(OutputExpr::Column(group_index));
            }

            SelectItem::Aggregate {
                function,
                argument,
                alias,
            } => {
                let column_type = match argument {
                    AggregateArg::Star => DataType::BigInt,
                    AggregateArg::Column(name) => {
                        schema.columns[resolve(schema, name)?].data_type
                    }
                };

                let rewrite = aggregate::rewrite(
                    *function,
                    argument,
                    ordinal,
                    partial_columns.len(),
                    column_type,
                );
                ordinal += 1;

                for (name, data_type) in &rewrite.partial_columns {
                    partial_columns.push(name.clone());
                    partial_types.push(*data_type);
                }
                if mode == AggregationMode::Scalar {
                    empty_partial_row.extend(rewrite.empty_values.clone());
                }
                map_items.extend(rewrite.map_items);
                reduce_items.extend(rewrite.reduce_items);

                let default_name = SelectItem::Aggregate {
                    function: *function,
                    argument: argument.clone(),
                    alias: None,
                }
                .to_string();
                output_columns.push(alias.clone().unwrap_or(default_name));
                output_types.push(rewrite.output_type);
                finalizers.push(rewrite.output);
            }
        }
    }

    let map_sql = Select {
        projection: map_items,
        table: select.table.clone(),
        filter: select.filter.clone(),
        group_by: select.group_by.clone(),
    }
    .to_string();

    let reduce_sql = Select {
        projection: reduce_items,
        table: REDUCE_SOURCE.to_string(),
        filter: vec![],
        group_by: select.group_by.clone(),
    }
    .to_string();

    Ok(PlannedQuery {
        map_sql,
        reduce_sql: Some(reduce_sql),
        partial_columns,
        partial_types,
        output_columns,
        output_types,
        mode,
        finalizers,
        empty_partial_row,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sharding::Column;

    fn events_schema() -> Schema {
        let column = |name: &str, data_type| Column {
            name: name.into(),
            data_type,
            not_null: false,
        };

        Schema::new(vec![
            column("event_id", DataType::Integer),
            column("user_id", DataType::Integer),
            column("event_type", DataType::Varchar),
            column("value", DataType::Double),
            column("event_time", DataType::Timestamp),
        ])
    }

    fn plan_sql(sql: &str) -> PlannedQuery {
        let select = match parser::parse(sql).unwrap() {
            Statement::Select(select) => select,
            _ => panic!("not a select"),
        };
        plan(&select, &events_schema()).unwrap()
    }

    #[test]
    fn test_plan_pass_through() {
        let plan = plan_sql("SELECT event_id, value FROM events WHERE event_type = 'click'");
        assert_eq!(plan.mode, AggregationMode::PassThrough);
        assert!(plan.reduce_sql.is_none());
        assert_eq!(
            plan.map_sql,
            "SELECT event_id, value FROM events WHERE event_type = 'click'"
        );
        assert_eq!(plan.output_columns, vec!["event_id", "value"]);
        assert_eq!(plan.output_types, vec![DataType::Integer, DataType::Double]);
    }

    #[test]
    fn test_plan_star_expands_schema() {
        let plan = plan_sql("SELECT * FROM events");
        assert_eq!(plan.output_columns.len(), 5);
        assert_eq!(plan.map_sql, "SELECT * FROM events");
    }

    #[test]
    fn test_plan_scalar_aggregation() {
        let plan = plan_sql("SELECT COUNT(*) AS n, SUM(value) AS total_value FROM events");
        assert_eq!(plan.mode, AggregationMode::Scalar);
        assert_eq!(
            plan.map_sql,
            "SELECT count(*) AS _c_0, sum(value) AS _s_1 FROM events"
        );
        assert_eq!(
            plan.reduce_sql.as_deref(),
            Some("SELECT sum(_c_0) AS _c_0, sum(_s_1) AS _s_1 FROM partials")
        );
        assert_eq!(plan.output_columns, vec!["n", "total_value"]);
        assert_eq!(plan.output_types, vec![DataType::BigInt, DataType::Double]);
        assert_eq!(
            plan.finalizers,
            vec![OutputExpr::Column(0), OutputExpr::Column(1)]
        );
    }

    #[test]
    fn test_plan_grouped_aggregation_with_avg() {
        let plan = plan_sql(
            "SELECT event_type, COUNT(*) AS n, SUM(value) AS total, AVG(value) AS avg \
             FROM events WHERE user_id IS NOT NULL GROUP BY event_type",
        );
        assert_eq!(plan.mode, AggregationMode::Grouped);
        assert_eq!(
            plan.map_sql,
            "SELECT event_type, count(*) AS _c_0, sum(value) AS _s_1, \
             sum(value) AS _sum_2, count(value) AS _cnt_2 \
             FROM events WHERE user_id IS NOT NULL GROUP BY event_type"
        );
        assert_eq!(
            plan.reduce_sql.as_deref(),
            Some(
                "SELECT event_type, sum(_c_0) AS _c_0, sum(_s_1) AS _s_1, \
                 sum(_sum_2) AS _sum_2, sum(_cnt_2) AS _cnt_2 \
                 FROM partials GROUP BY event_type"
            )
        );
        assert_eq!(
            plan.partial_columns,
            vec!["event_type", "_c_0", "_s_1", "_sum_2", "_cnt_2"]
        );
        assert_eq!(
            plan.finalizers,
            vec![
                OutputExpr::Column(0),
                OutputExpr::Column(1),
                OutputExpr::Column(2),
                OutputExpr::Avg { sum: 3, count: 4 },
            ]
        );
        assert_eq!(plan.output_columns, vec!["event_type", "n", "total", "avg"]);
        assert_eq!(plan.output_types[3], DataType::Double);
    }

    #[test]
    fn test_plan_where_pushed_into_map() {
        let plan = plan_sql("SELECT COUNT(*) FROM events WHERE value >= 1.0");
        assert!(plan.map_sql.contains("WHERE value >= 1.0"));
        assert!(!plan.reduce_sql.unwrap().contains("WHERE"));
    }

    #[test]
    fn test_plan_unknown_column() {
        let select = match parser::parse("SELECT nope FROM events").unwrap() {
            Statement::Select(select) => select,
            _ => panic!("not a select"),
        };
        assert!(matches!(
            plan(&select, &events_schema()),
            Err(Error::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_plan_unaliased_aggregate_name() {
        let plan = plan_sql("SELECT AVG(value) FROM events");
        assert_eq!(plan.output_columns, vec!["avg(value)"]);
    }

    #[test]
    fn test_plan_group_by_without_aggregates() {
        let plan = plan_sql("SELECT event_type FROM events GROUP BY event_type");
        assert_eq!(plan.mode, AggregationMode::Grouped);
        assert_eq!(
            plan.map_sql,
            "SELECT event_type FROM events GROUP BY event_type"
        );
        assert_eq!(
            plan.reduce_sql.as_deref(),
            Some("SELECT event_type FROM partials GROUP BY event_type")
        );
    }
}
