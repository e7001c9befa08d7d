use crate::error::{invalid_argument, FirestoreResult};
use crate::model::FieldPath;
use crate::query::evaluator::QueryResult;
use crate::value::{FirestoreValue, ValueKind};

/// One aggregation over a query's result set, reported under `alias`.
#[derive(Clone, Debug)]
pub struct AggregateDefinition {
    alias: String,
    operation: AggregateOperation,
}

#[derive(Clone, Debug)]
pub enum AggregateOperation {
    Count,
    Sum(FieldPath),
    Average(FieldPath),
}

impl AggregateDefinition {
    pub fn new(alias: impl Into<String>, operation: AggregateOperation) -> Self {
        Self {
            alias: alias.into(),
            operation,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn operation(&self) -> &AggregateOperation {
        &self.operation
    }
}

/// Computes the requested aggregations over an already-evaluated result set.
/// Non-numeric and missing fields are skipped by `sum`/`avg`, matching the
/// backend's aggregation semantics.
pub fn run_aggregation(
    results: &[QueryResult],
    aggregates: &[AggregateDefinition],
) -> FirestoreResult<Vec<(String, FirestoreValue)>> {
    if aggregates.is_empty() {
        return Err(invalid_argument(
            "Aggregation queries require at least one aggregate field",
        ));
    }

    let mut output = Vec::with_capacity(aggregates.len());
    for aggregate in aggregates {
        let value = match aggregate.operation() {
            AggregateOperation::Count => FirestoreValue::from_integer(results.len() as i64),
            AggregateOperation::Sum(field) => sum_field(results, field),
            AggregateOperation::Average(field) => average_field(results, field),
        };
        output.push((aggregate.alias().to_string(), value));
    }
    Ok(output)
}

fn numeric_values<'a>(
    results: &'a [QueryResult],
    field: &'a FieldPath,
) -> impl Iterator<Item = NumericValue> + 'a {
    results.iter().filter_map(|result| {
        match result.document.field(field)?.kind() {
            ValueKind::Integer(n) => Some(NumericValue::Integer(*n)),
            ValueKind::Double(d) => Some(NumericValue::Double(*d)),
            _ => None,
        }
    })
}

enum NumericValue {
    Integer(i64),
    Double(f64),
}

/// Sum stays an integer while every operand is an integer and the running
/// total does not overflow; otherwise it degrades to a double.
fn sum_field(results: &[QueryResult], field: &FieldPath) -> FirestoreValue {
    let mut int_sum: i64 = 0;
    let mut double_sum = 0.0;
    let mut use_double = false;

    for value in numeric_values(results, field) {
        match value {
            NumericValue::Integer(n) => {
                if use_double {
                    double_sum += n as f64;
                } else {
                    match int_sum.checked_add(n) {
                        Some(total) => int_sum = total,
                        None => {
                            use_double = true;
                            double_sum = int_sum as f64 + n as f64;
                        }
                    }
                }
            }
            NumericValue::Double(d) => {
                if !use_double {
                    use_double = true;
                    double_sum = int_sum as f64;
                }
                double_sum += d;
            }
        }
    }

    if use_double {
        FirestoreValue::from_double(double_sum)
    } else {
        FirestoreValue::from_integer(int_sum)
    }
}

/// Average is always a double; with no numeric inputs the result is null.
fn average_field(results: &[QueryResult], field: &FieldPath) -> FirestoreValue {
    let mut total = 0.0;
    let mut count = 0u64;
    for value in numeric_values(results, field) {
        total += match value {
            NumericValue::Integer(n) => n as f64,
            NumericValue::Double(d) => d,
        };
        count += 1;
    }
    if count == 0 {
        FirestoreValue::null()
    } else {
        FirestoreValue::from_double(total / count as f64)
    }
}
