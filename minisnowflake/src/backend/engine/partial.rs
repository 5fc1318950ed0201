//! Final local projection over the last remaining partial.
//!
//! Renames helper columns back to the user's SELECT list and recomposes
//! AVG from its SUM/COUNT helpers. This is the only place division
//! happens, so a single reduce pass over partials is always enough.

use crate::frontend::router::{AggregationMode, OutputExpr, PlannedQuery};
use crate::sharding::{Batch, Value};

use super::Error;

pub fn finalize(plan: &PlannedQuery, partial: Option<Batch>) -> Result<Batch, Error> {
    let mut output = Batch::new(plan.output_columns.clone(), plan.output_types.clone());

    let partial = match partial {
        Some(partial) => partial,
        None => {
            // No shards at all. Scalar aggregation still answers with
            // one row; everything else is empty.
            if plan.mode != AggregationMode::Scalar {
                return Ok(output);
            }
            Batch {
                columns: plan.partial_columns.clone(),
                types: plan.partial_types.clone(),
                rows: vec![plan.empty_partial_row.clone()],
            }
        }
    };

    let rows = match plan.mode {
        AggregationMode::Scalar if partial.rows.is_empty() => {
            vec![plan.empty_partial_row.clone()]
        }
        AggregationMode::Scalar if partial.rows.len() > 1 => {
            return Err(Error::Internal(format!(
                "scalar reduction left {} rows",
                partial.rows.len()
            )));
        }
        _ => partial.rows,
    };

    for row in rows {
        let mut out = Vec::with_capacity(plan.finalizers.len());
        for finalizer in &plan.finalizers {
            out.push(apply(finalizer, &row));
        }
        output.rows.push(out);
    }

    Ok(output)
}

fn apply(finalizer: &OutputExpr, row: &[Value]) -> Value {
    match finalizer {
        OutputExpr::Column(index) => row[*index].clone(),

        OutputExpr::Avg { sum, count } => {
            let count = match &row[*count] {
                Value::Bigint(count) => *count,
                _ => 0,
            };
            if count == 0 {
                return Value::Null;
            }
            match row[*sum].as_f64() {
                Some(sum) => Value::Double(sum / count as f64),
                None => Value::Null,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frontend::router::{parser, plan};
    use crate::sharding::{Column, DataType, Schema};

    fn plan_for(sql: &str) -> PlannedQuery {
        let schema = Schema::new(vec![
            Column {
                name: "event_type".into(),
                data_type: DataType::Varchar,
                not_null: false,
            },
            Column {
                name: "value".into(),
                data_type: DataType::Double,
                not_null: false,
            },
        ]);
        let select = match parser::parse(sql).unwrap() {
            parser::Statement::Select(select) => select,
            _ => panic!("not a select"),
        };
        plan(&select, &schema).unwrap()
    }

    #[test]
    fn test_avg_recomposition() {
        let plan = plan_for("SELECT AVG(value) AS avg FROM t");
        let partial = Batch {
            columns: plan.partial_columns.clone(),
            types: plan.partial_types.clone(),
            rows: vec![vec![Value::Double(58.5), Value::Bigint(10)]],
        };

        let result = finalize(&plan, Some(partial)).unwrap();
        assert_eq!(result.columns, vec!["avg"]);
        assert_eq!(result.rows[0][0], Value::Double(5.85));
    }

    #[test]
    fn test_avg_of_empty_group_is_null() {
        let plan = plan_for("SELECT AVG(value) FROM t");
        let partial = Batch {
            columns: plan.partial_columns.clone(),
            types: plan.partial_types.clone(),
            rows: vec![vec![Value::Null, Value::Bigint(0)]],
        };

        let result = finalize(&plan, Some(partial)).unwrap();
        assert_eq!(result.rows[0][0], Value::Null);
    }

    #[test]
    fn test_scalar_over_no_shards() {
        let plan = plan_for("SELECT COUNT(*) AS n, SUM(value) AS s, AVG(value) AS a FROM t");
        let result = finalize(&plan, None).unwrap();
        assert_eq!(result.row_count(), 1);
        assert_eq!(
            result.rows[0],
            vec![Value::Bigint(0), Value::Null, Value::Null]
        );
    }

    #[test]
    fn test_pass_through_over_no_shards() {
        let plan = plan_for("SELECT event_type FROM t");
        let result = finalize(&plan, None).unwrap();
        assert_eq!(result.columns, vec!["event_type"]);
        assert!(result.rows.is_empty());
    }

    #[test]
    fn test_grouped_renames_helpers() {
        let plan = plan_for(
            "SELECT event_type, COUNT(*) AS n FROM t GROUP BY event_type",
        );
        let partial = Batch {
            columns: plan.partial_columns.clone(),
            types: plan.partial_types.clone(),
            rows: vec![
                vec![Value::Text("click".into()), Value::Bigint(5)],
                vec![Value::Text("view".into()), Value::Bigint(3)],
            ],
        };

        let result = finalize(&plan, Some(partial)).unwrap();
        assert_eq!(result.columns, vec!["event_type", "n"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[1][1], Value::Bigint(3));
    }
}
