//! Embedded single-shard executor.
//!
//! Evaluates one SELECT of the supported dialect over the union of its
//! input batches: WHERE conjunction, projection, COUNT/SUM/MIN/MAX/AVG
//! and GROUP BY, with standard SQL NULL semantics. Map tasks run it over
//! one shard, reduce tasks over a union of partials; the FROM name in
//! the statement is not resolved, the inputs are the relation.

use std::collections::HashMap;

use thiserror::Error;

use crate::frontend::router::parser::{
    self, AggregateArg, AggregateFunction, CmpOp, Literal, Predicate, PredicateTest, Select,
    SelectItem, Statement,
};
use crate::sharding::{self, Batch, DataType, Value};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Parse(#[from] parser::ParseError),

    #[error("{0}")]
    Unsupported(String),

    #[error("unknown column \"{0}\"")]
    UnknownColumn(String),

    #[error("{0}")]
    Input(#[from] sharding::Error),
}

pub fn execute(sql: &str, inputs: Vec<Batch>) -> Result<Batch, Error> {
    let select = match parser::parse(sql)? {
        Statement::Select(select) => select,
        _ => return Err(Error::Unsupported("workers only execute SELECT".into())),
    };

    if inputs.is_empty() {
        return Err(Error::Unsupported("execution requires at least one input".into()));
    }
    let input = Batch::concat(inputs)?;

    let filter = compile_filter(&select, &input)?;
    let rows: Vec<&Vec<Value>> = input
        .rows
        .iter()
        .filter(|row| filter.iter().all(|predicate| predicate.matches(row)))
        .collect();

    if select.has_aggregates() || !select.group_by.is_empty() {
        aggregate(&select, &input, rows)
    } else {
        project(&select, &input, rows)
    }
}

fn resolve(input: &Batch, column: &str) -> Result<usize, Error> {
    input
        .column_index(column)
        .ok_or_else(|| Error::UnknownColumn(column.to_string()))
}

struct CompiledPredicate {
    column: usize,
    test: PredicateTest,
}

impl CompiledPredicate {
    fn matches(&self, row: &[Value]) -> bool {
        let value = &row[self.column];
        match &self.test {
            PredicateTest::IsNull => value.is_null(),
            PredicateTest::IsNotNull => !value.is_null(),
            // Comparisons involving NULL, or mismatched types, are false.
            PredicateTest::Compare(op, literal) => {
                match value.compare(&literal_value(literal)) {
                    None => false,
                    Some(ordering) => match op {
                        CmpOp::Eq => ordering.is_eq(),
                        CmpOp::NotEq => ordering.is_ne(),
                        CmpOp::Lt => ordering.is_lt(),
                        CmpOp::LtEq => ordering.is_le(),
                        CmpOp::Gt => ordering.is_gt(),
                        CmpOp::GtEq => ordering.is_ge(),
                    },
                }
            }
        }
    }
}

fn compile_filter(select: &Select, input: &Batch) -> Result<Vec<CompiledPredicate>, Error> {
    select
        .filter
        .iter()
        .map(|Predicate { column, test }| {
            Ok(CompiledPredicate {
                column: resolve(input, column)?,
                test: test.clone(),
            })
        })
        .collect()
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Bigint(v) => Value::Bigint(*v),
        Literal::Double(v) => Value::Double(*v),
        Literal::Boolean(v) => Value::Boolean(*v),
        Literal::String(v) => Value::Text(v.clone()),
        Literal::Null => Value::Null,
    }
}

fn project(select: &Select, input: &Batch, rows: Vec<&Vec<Value>>) -> Result<Batch, Error> {
    if select.projection == vec![SelectItem::Star] {
        let mut output = Batch::new(input.columns.clone(), input.types.clone());
        output.rows = rows.into_iter().cloned().collect();
        return Ok(output);
    }

    let mut columns = vec![];
    let mut types = vec![];
    let mut indexes = vec![];

    for item in &select.projection {
        match item {
            SelectItem::Column { name, alias } => {
                let index = resolve(input, name)?;
                columns.push(alias.clone().unwrap_or_else(|| name.clone()));
                types.push(input.types[index]);
                indexes.push(index);
            }
            _ => unreachable!("validated by the parser"),
        }
    }

    let mut output = Batch::new(columns, types);
    output.rows = rows
        .into_iter()
        .map(|row| indexes.iter().map(|i| row[*i].clone()).collect())
        .collect();

    Ok(output)
}

/// Cross-row accumulator for one aggregate target.
struct Accumulator {
    function: AggregateFunction,
    argument: Option<usize>,
    count: i64,
    value: Value,
}

impl Accumulator {
    fn new(function: AggregateFunction, argument: Option<usize>) -> Self {
        Self {
            function,
            argument,
            count: 0,
            value: Value::Null,
        }
    }

    fn update(&mut self, row: &[Value]) -> Result<(), Error> {
        // Aggregates other than COUNT(*) ignore NULLs.
        let argument = match self.argument {
            Some(index) => {
                if row[index].is_null() {
                    return Ok(());
                }
                Some(&row[index])
            }
            None => None,
        };

        match self.function {
            AggregateFunction::Count => self.count += 1,

            AggregateFunction::Sum => {
                let value = argument.expect("SUM has a column argument");
                self.value = self.value.add(value)?;
            }

            AggregateFunction::Min => {
                let value = argument.expect("MIN has a column argument");
                if self.value.is_null() || value.compare(&self.value) == Some(std::cmp::Ordering::Less)
                {
                    self.value = value.clone();
                }
            }

            AggregateFunction::Max => {
                let value = argument.expect("MAX has a column argument");
                if self.value.is_null()
                    || value.compare(&self.value) == Some(std::cmp::Ordering::Greater)
                {
                    self.value = value.clone();
                }
            }

            AggregateFunction::Avg => {
                let value = argument.expect("AVG has a column argument");
                self.value = self.value.add(value)?;
                self.count += 1;
            }
        }

        Ok(())
    }

    fn finalize(&self) -> Value {
        match self.function {
            AggregateFunction::Count => Value::Bigint(self.count),
            AggregateFunction::Sum | AggregateFunction::Min | AggregateFunction::Max => {
                self.value.clone()
            }
            AggregateFunction::Avg => {
                if self.count == 0 {
                    Value::Null
                } else {
                    match self.value.as_f64() {
                        Some(sum) => Value::Double(sum / self.count as f64),
                        None => Value::Null,
                    }
                }
            }
        }
    }

}

fn aggregate_output_type(
    function: AggregateFunction,
    argument: Option<usize>,
    input: &Batch,
) -> DataType {
    match function {
        AggregateFunction::Count => DataType::BigInt,
        AggregateFunction::Sum => input.types[argument.expect("SUM argument")].sum_type(),
        AggregateFunction::Min | AggregateFunction::Max => {
            input.types[argument.expect("MIN/MAX argument")]
        }
        AggregateFunction::Avg => DataType::Double,
    }
}

fn aggregate(select: &Select, input: &Batch, rows: Vec<&Vec<Value>>) -> Result<Batch, Error> {
    let group_indexes: Vec<usize> = select
        .group_by
        .iter()
        .map(|name| resolve(input, name))
        .collect::<Result<_, _>>()?;

    let targets: Vec<(AggregateFunction, Option<usize>)> = select
        .projection
        .iter()
        .filter_map(|item| match item {
            SelectItem::Aggregate {
                function, argument, ..
            } => Some(match argument {
                AggregateArg::Star => Ok((*function, None)),
                AggregateArg::Column(name) => resolve(input, name).map(|i| (*function, Some(i))),
            }),
            _ => None,
        })
        .collect::<Result<_, _>>()?;

    let new_state = || -> Vec<Accumulator> {
        targets
            .iter()
            .map(|(function, argument)| Accumulator::new(*function, *argument))
            .collect()
    };

    // Groups in first-seen order of the filtered input.
    let mut keys: Vec<Vec<Value>> = vec![];
    let mut states: Vec<Vec<Accumulator>> = vec![];
    let mut lookup: HashMap<Vec<Value>, usize> = HashMap::new();

    let scalar = select.group_by.is_empty();
    if scalar {
        keys.push(vec![]);
        states.push(new_state());
    }

    for row in rows {
        let index = if scalar {
            0
        } else {
            let key: Vec<Value> = group_indexes.iter().map(|i| row[*i].clone()).collect();
            match lookup.get(&key) {
                Some(index) => *index,
                None => {
                    keys.push(key.clone());
                    states.push(new_state());
                    lookup.insert(key, states.len() - 1);
                    states.len() - 1
                }
            }
        };

        for accumulator in states[index].iter_mut() {
            accumulator.update(row)?;
        }
    }

    // Output follows the SELECT list order.
    let mut columns = vec![];
    let mut types = vec![];
    let mut sources = vec![];

    let mut target = 0;
    for item in &select.projection {
        match item {
            SelectItem::Column { name, alias } => {
                let key_position = select
                    .group_by
                    .iter()
                    .position(|g| g == name)
                    .expect("validated by the parser");
                columns.push(alias.clone().unwrap_or_else(|| name.clone()));
                types.push(input.types[resolve(input, name)?]);
                sources.push(Source::Key(key_position));
            }
            SelectItem::Aggregate {
                function,
                argument,
                alias,
            } => {
                let default_name = SelectItem::Aggregate {
                    function: *function,
                    argument: argument.clone(),
                    alias: None,
                }
                .to_string();
                let (function, argument) = targets[target];
                columns.push(alias.clone().unwrap_or(default_name));
                types.push(aggregate_output_type(function, argument, input));
                sources.push(Source::Aggregate(target));
                target += 1;
            }
            SelectItem::Star => unreachable!("validated by the parser"),
        }
    }

    let mut output = Batch::new(columns, types);
    for (key, state) in keys.iter().zip(states.iter()) {
        let row = sources
            .iter()
            .map(|source| match source {
                Source::Key(position) => key[*position].clone(),
                Source::Aggregate(index) => state[*index].finalize(),
            })
            .collect();
        output.rows.push(row);
    }

    Ok(output)
}

enum Source {
    Key(usize),
    Aggregate(usize),
}

#[cfg(test)]
mod test {
    use super::*;

    fn events() -> Batch {
        let mut batch = Batch::new(
            vec![
                "event_id".into(),
                "user_id".into(),
                "event_type".into(),
                "value".into(),
            ],
            vec![
                DataType::Integer,
                DataType::Integer,
                DataType::Varchar,
                DataType::Double,
            ],
        );

        let row = |id: i64, user: Option<i64>, kind: &str, value: f64| {
            vec![
                Value::Bigint(id),
                user.map(Value::Bigint).unwrap_or(Value::Null),
                Value::Text(kind.into()),
                Value::Double(value),
            ]
        };

        batch.rows = vec![
            row(1, Some(10), "click", 1.5),
            row(2, Some(10), "click", 2.0),
            row(3, Some(11), "view", 0.0),
            row(4, None, "view", 1.0),
            row(5, Some(13), "purchase", 20.0),
        ];
        batch
    }

    #[test]
    fn test_star_pass_through() {
        let result = execute("SELECT * FROM events", vec![events()]).unwrap();
        assert_eq!(result.row_count(), 5);
        assert_eq!(result.columns.len(), 4);
    }

    #[test]
    fn test_filter_conjunction() {
        let result = execute(
            "SELECT event_id FROM events WHERE event_type = 'click' AND value > 1.5",
            vec![events()],
        )
        .unwrap();
        assert_eq!(result.rows, vec![vec![Value::Bigint(2)]]);
    }

    #[test]
    fn test_null_comparison_is_false() {
        // Row 4 has NULL user_id; user_id != 10 must not match it.
        let result = execute(
            "SELECT event_id FROM events WHERE user_id != 10",
            vec![events()],
        )
        .unwrap();
        assert_eq!(
            result.rows,
            vec![vec![Value::Bigint(3)], vec![Value::Bigint(5)]]
        );
    }

    #[test]
    fn test_is_null_predicates() {
        let result = execute(
            "SELECT event_id FROM events WHERE user_id IS NULL",
            vec![events()],
        )
        .unwrap();
        assert_eq!(result.rows, vec![vec![Value::Bigint(4)]]);

        let result = execute(
            "SELECT COUNT(*) AS n FROM events WHERE user_id IS NOT NULL",
            vec![events()],
        )
        .unwrap();
        assert_eq!(result.rows, vec![vec![Value::Bigint(4)]]);
    }

    #[test]
    fn test_count_ignores_nulls() {
        let result = execute(
            "SELECT count(*) AS all_rows, count(user_id) AS users FROM events",
            vec![events()],
        )
        .unwrap();
        assert_eq!(result.rows[0], vec![Value::Bigint(5), Value::Bigint(4)]);
        assert_eq!(result.types, vec![DataType::BigInt, DataType::BigInt]);
    }

    #[test]
    fn test_scalar_aggregates() {
        let result = execute(
            "SELECT sum(value) AS s, min(value) AS lo, max(value) AS hi, avg(value) AS a \
             FROM events",
            vec![events()],
        )
        .unwrap();
        assert_eq!(result.rows[0][0], Value::Double(24.5));
        assert_eq!(result.rows[0][1], Value::Double(0.0));
        assert_eq!(result.rows[0][2], Value::Double(20.0));
        assert_eq!(result.rows[0][3], Value::Double(4.9));
    }

    #[test]
    fn test_scalar_over_empty_input() {
        let mut empty = events();
        empty.rows.clear();
        let result = execute(
            "SELECT count(*) AS n, sum(value) AS s, avg(value) AS a FROM events",
            vec![empty],
        )
        .unwrap();
        assert_eq!(
            result.rows,
            vec![vec![Value::Bigint(0), Value::Null, Value::Null]]
        );
    }

    #[test]
    fn test_group_by_first_seen_order() {
        let result = execute(
            "SELECT event_type, count(*) AS n FROM events GROUP BY event_type",
            vec![events()],
        )
        .unwrap();
        assert_eq!(
            result.rows,
            vec![
                vec![Value::Text("click".into()), Value::Bigint(2)],
                vec![Value::Text("view".into()), Value::Bigint(2)],
                vec![Value::Text("purchase".into()), Value::Bigint(1)],
            ]
        );
    }

    #[test]
    fn test_group_by_without_aggregates() {
        let result = execute(
            "SELECT event_type FROM events GROUP BY event_type",
            vec![events()],
        )
        .unwrap();
        assert_eq!(result.row_count(), 3);
    }

    #[test]
    fn test_union_of_inputs() {
        let result = execute(
            "SELECT count(*) AS n FROM events",
            vec![events(), events()],
        )
        .unwrap();
        assert_eq!(result.rows[0][0], Value::Bigint(10));
    }

    #[test]
    fn test_reduce_shape_query() {
        // The form reduce tasks take: re-aggregate helper columns.
        let mut partials = Batch::new(
            vec!["event_type".into(), "_c_0".into()],
            vec![DataType::Varchar, DataType::BigInt],
        );
        partials.rows = vec![
            vec![Value::Text("click".into()), Value::Bigint(3)],
            vec![Value::Text("view".into()), Value::Bigint(1)],
            vec![Value::Text("click".into()), Value::Bigint(2)],
        ];

        let result = execute(
            "SELECT event_type, sum(_c_0) AS _c_0 FROM partials GROUP BY event_type",
            vec![partials],
        )
        .unwrap();
        assert_eq!(
            result.rows,
            vec![
                vec![Value::Text("click".into()), Value::Bigint(5)],
                vec![Value::Text("view".into()), Value::Bigint(1)],
            ]
        );
        assert_eq!(result.types, vec![DataType::Varchar, DataType::BigInt]);
    }

    #[test]
    fn test_only_select_is_executable() {
        let err = execute("DROP TABLE events", vec![events()]).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_unknown_column() {
        let err = execute("SELECT nope FROM events", vec![events()]).unwrap_err();
        assert!(matches!(err, Error::UnknownColumn(_)));
    }
}
