//! Aggregate decomposition for sharded execution.
//!
//! Each aggregate in the SELECT list is rewritten into a per-shard map
//! form and a reduce form that combines partials:
//!
//! | Original    | Map emits                          | Reduce emits                       |
//! |-------------|------------------------------------|------------------------------------|
//! | COUNT(*)    | count(*) AS _c_i                   | sum(_c_i) AS _c_i                  |
//! | COUNT(col)  | count(col) AS _c_i                 | sum(_c_i) AS _c_i                  |
//! | SUM(col)    | sum(col) AS _s_i                   | sum(_s_i) AS _s_i                  |
//! | MIN(col)    | min(col) AS _m_i                   | min(_m_i) AS _m_i                  |
//! | MAX(col)    | max(col) AS _m_i                   | max(_m_i) AS _m_i                  |
//! | AVG(col)    | sum(col) AS _sum_i, count(col) AS _cnt_i | sum over both helpers        |
//!
//! Reduce re-aliases every combined helper to its own name, so the reduce
//! output schema equals the map output schema and one reduce form serves
//! every round of the tree. AVG is recomposed from its helpers in the
//! engine's final projection, not in SQL.

use crate::sharding::{DataType, Value};

use super::parser::{AggregateArg, AggregateFunction, SelectItem};

/// Final projection step for one SELECT item, applied by the engine to
/// the single remaining partial.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputExpr {
    /// Copy a partial column.
    Column(usize),
    /// sum_column / count_column; NULL when the count is zero.
    Avg { sum: usize, count: usize },
}

/// Map and reduce forms of one aggregate target.
#[derive(Debug, Clone)]
pub struct Rewrite {
    pub map_items: Vec<SelectItem>,
    pub reduce_items: Vec<SelectItem>,
    /// Helper columns appended to the partial schema.
    pub partial_columns: Vec<(String, DataType)>,
    /// Helper values a map task produces over an empty input, used to
    /// answer scalar aggregation over a table with no shards.
    pub empty_values: Vec<Value>,
    pub output: OutputExpr,
    pub output_type: DataType,
}

fn helper(function: AggregateFunction, argument: AggregateArg, alias: &str) -> SelectItem {
    SelectItem::Aggregate {
        function,
        argument,
        alias: Some(alias.to_string()),
    }
}

/// Rewrite the `ordinal`-th aggregate of the statement. `helper_base` is
/// the index of its first helper column in the partial schema;
/// `column_type` is the argument's resolved type (COUNT's is ignored).
pub fn rewrite(
    function: AggregateFunction,
    argument: &AggregateArg,
    ordinal: usize,
    helper_base: usize,
    column_type: DataType,
) -> Rewrite {
    use AggregateFunction::*;

    match function {
        Count => {
            let name = format!("_c_{}", ordinal);
            Rewrite {
                map_items: vec![helper(Count, argument.clone(), &name)],
                reduce_items: vec![helper(Sum, AggregateArg::Column(name.clone()), &name)],
                partial_columns: vec![(name, DataType::BigInt)],
                empty_values: vec![Value::Bigint(0)],
                output: OutputExpr::Column(helper_base),
                output_type: DataType::BigInt,
            }
        }

        Sum => {
            let name = format!("_s_{}", ordinal);
            let sum_type = column_type.sum_type();
            Rewrite {
                map_items: vec![helper(Sum, argument.clone(), &name)],
                reduce_items: vec![helper(Sum, AggregateArg::Column(name.clone()), &name)],
                partial_columns: vec![(name, sum_type)],
                empty_values: vec![Value::Null],
                output: OutputExpr::Column(helper_base),
                output_type: sum_type,
            }
        }

        Min | Max => {
            let name = format!("_m_{}", ordinal);
            Rewrite {
                map_items: vec![helper(function, argument.clone(), &name)],
                reduce_items: vec![helper(function, AggregateArg::Column(name.clone()), &name)],
                partial_columns: vec![(name, column_type)],
                empty_values: vec![Value::Null],
                output: OutputExpr::Column(helper_base),
                output_type: column_type,
            }
        }

        Avg => {
            let sum_name = format!("_sum_{}", ordinal);
            let cnt_name = format!("_cnt_{}", ordinal);
            let sum_type = column_type.sum_type();
            Rewrite {
                map_items: vec![
                    helper(Sum, argument.clone(), &sum_name),
                    helper(Count, argument.clone(), &cnt_name),
                ],
                reduce_items: vec![
                    helper(Sum, AggregateArg::Column(sum_name.clone()), &sum_name),
                    helper(Sum, AggregateArg::Column(cnt_name.clone()), &cnt_name),
                ],
                partial_columns: vec![(sum_name, sum_type), (cnt_name, DataType::BigInt)],
                empty_values: vec![Value::Null, Value::Bigint(0)],
                output: OutputExpr::Avg {
                    sum: helper_base,
                    count: helper_base + 1,
                },
                output_type: DataType::Double,
            }
        }
    }
}
