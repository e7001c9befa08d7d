use serde_json::Value as JsonValue;

use crate::error::{invalid_argument, unimplemented, FirestoreResult};
use crate::model::{FieldPath, ResourcePath};
use crate::query::{
    AggregateDefinition, AggregateOperation, Bound, CompositeFilter, CompositeOperator,
    DistanceMeasure, FieldFilter, Filter, FilterOperator, FindNearest, LimitType, OrderBy,
    OrderDirection, QueryDefinition, UnaryFilter, UnaryOperator,
};
use crate::remote::serializer::JsonProtoSerializer;
use crate::value::{FirestoreValue, ValueKind, VectorValue};

/// Decodes a `structuredQuery` request body into the engine's query model.
/// `parent` is the database-relative path the query hangs off (root or a
/// document path).
pub fn decode_structured_query(
    serializer: &JsonProtoSerializer,
    parent: ResourcePath,
    query: &JsonValue,
) -> FirestoreResult<QueryDefinition> {
    let from = query
        .get("from")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| invalid_argument("structuredQuery requires a from clause"))?;
    if from.len() != 1 {
        return Err(invalid_argument(
            "structuredQuery supports exactly one from entry",
        ));
    }
    let collection_id = from[0]
        .get("collectionId")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("from entry requires collectionId"))?;
    let all_descendants = from[0]
        .get("allDescendants")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);

    let mut definition =
        QueryDefinition::new(parent, collection_id).with_all_descendants(all_descendants);

    if let Some(filter) = query.get("where") {
        definition = definition.with_filter(decode_filter(serializer, filter)?);
    }

    if let Some(orders) = query.get("orderBy") {
        let orders = orders
            .as_array()
            .ok_or_else(|| invalid_argument("orderBy must be an array"))?;
        for order in orders {
            definition = definition.with_order_by(decode_order_by(order)?);
        }
    }

    if let Some(select) = query.get("select") {
        let fields = select
            .get("fields")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| invalid_argument("select requires fields"))?
            .iter()
            .map(decode_field_reference)
            .collect::<FirestoreResult<Vec<_>>>()?;
        definition = definition.with_projection(fields);
    }

    let limit = match query.get("limit") {
        Some(limit) => Some(decode_limit(limit)?),
        None => None,
    };
    if let Some(limit) = limit {
        definition = definition.with_limit(limit, LimitType::First);
    }

    let order_by = definition.effective_order_by();
    if let Some(start) = query.get("startAt") {
        definition = definition.with_start_at(decode_cursor(serializer, start, &order_by, true)?);
    }
    if let Some(end) = query.get("endAt") {
        definition = definition.with_end_at(decode_cursor(serializer, end, &order_by, false)?);
    }

    if let Some(stage) = query.get("findNearest") {
        definition = definition.with_find_nearest(decode_find_nearest(serializer, stage)?);
    }

    Ok(definition)
}

/// Decodes a `structuredAggregationQuery` into the underlying query plus its
/// aggregate definitions.
pub fn decode_aggregation_query(
    serializer: &JsonProtoSerializer,
    parent: ResourcePath,
    query: &JsonValue,
) -> FirestoreResult<(QueryDefinition, Vec<AggregateDefinition>)> {
    let structured = query
        .get("structuredQuery")
        .ok_or_else(|| invalid_argument("structuredAggregationQuery requires structuredQuery"))?;
    let definition = decode_structured_query(serializer, parent, structured)?;

    let aggregations = query
        .get("aggregations")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| invalid_argument("structuredAggregationQuery requires aggregations"))?;

    let mut aggregates = Vec::with_capacity(aggregations.len());
    for (index, aggregation) in aggregations.iter().enumerate() {
        let alias = aggregation
            .get("alias")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("aggregate_{index}"));
        let operation = if aggregation.get("count").is_some() {
            AggregateOperation::Count
        } else if let Some(sum) = aggregation.get("sum") {
            AggregateOperation::Sum(decode_aggregate_field(sum)?)
        } else if let Some(avg) = aggregation.get("avg") {
            AggregateOperation::Average(decode_aggregate_field(avg)?)
        } else {
            return Err(unimplemented("Unsupported aggregation variant"));
        };
        aggregates.push(AggregateDefinition::new(alias, operation));
    }

    Ok((definition, aggregates))
}

fn decode_aggregate_field(value: &JsonValue) -> FirestoreResult<FieldPath> {
    value
        .get("field")
        .map(decode_field_reference)
        .transpose()?
        .ok_or_else(|| invalid_argument("Aggregation requires a field reference"))
}

fn decode_filter(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<Filter> {
    if let Some(field_filter) = value.get("fieldFilter") {
        let field = field_filter
            .get("field")
            .map(decode_field_reference)
            .transpose()?
            .ok_or_else(|| invalid_argument("fieldFilter requires field"))?;
        let op = field_filter
            .get("op")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("fieldFilter requires op"))?;
        let operand = field_filter
            .get("value")
            .map(|operand| serializer.decode_value(operand))
            .transpose()?
            .ok_or_else(|| invalid_argument("fieldFilter requires value"))?;
        return Ok(Filter::Field(FieldFilter::new(
            field,
            decode_field_operator(op)?,
            operand,
        )));
    }

    if let Some(unary) = value.get("unaryFilter") {
        let field = unary
            .get("field")
            .map(decode_field_reference)
            .transpose()?
            .ok_or_else(|| invalid_argument("unaryFilter requires field"))?;
        let op = unary
            .get("op")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("unaryFilter requires op"))?;
        let operator = match op {
            "IS_NAN" => UnaryOperator::IsNan,
            "IS_NULL" => UnaryOperator::IsNull,
            "IS_NOT_NAN" => UnaryOperator::IsNotNan,
            "IS_NOT_NULL" => UnaryOperator::IsNotNull,
            other => {
                return Err(unimplemented(format!(
                    "Unsupported unary filter operator: {other}"
                )))
            }
        };
        return Ok(Filter::Unary(UnaryFilter::new(field, operator)));
    }

    if let Some(composite) = value.get("compositeFilter") {
        let op = composite
            .get("op")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("compositeFilter requires op"))?;
        let operator = match op {
            "AND" => CompositeOperator::And,
            "OR" => CompositeOperator::Or,
            other => {
                return Err(unimplemented(format!(
                    "Unsupported composite filter operator: {other}"
                )))
            }
        };
        let children = composite
            .get("filters")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| invalid_argument("compositeFilter requires filters"))?
            .iter()
            .map(|child| decode_filter(serializer, child))
            .collect::<FirestoreResult<Vec<_>>>()?;
        return Ok(Filter::Composite(CompositeFilter::new(operator, children)));
    }

    Err(invalid_argument(
        "Filter must be a fieldFilter, unaryFilter or compositeFilter",
    ))
}

fn decode_field_operator(op: &str) -> FirestoreResult<FilterOperator> {
    Ok(match op {
        "LESS_THAN" => FilterOperator::LessThan,
        "LESS_THAN_OR_EQUAL" => FilterOperator::LessThanOrEqual,
        "GREATER_THAN" => FilterOperator::GreaterThan,
        "GREATER_THAN_OR_EQUAL" => FilterOperator::GreaterThanOrEqual,
        "EQUAL" => FilterOperator::Equal,
        "NOT_EQUAL" => FilterOperator::NotEqual,
        "ARRAY_CONTAINS" => FilterOperator::ArrayContains,
        "IN" => FilterOperator::In,
        "ARRAY_CONTAINS_ANY" => FilterOperator::ArrayContainsAny,
        "NOT_IN" => FilterOperator::NotIn,
        other => return Err(unimplemented(format!("Unsupported filter operator: {other}"))),
    })
}

fn decode_field_reference(value: &JsonValue) -> FirestoreResult<FieldPath> {
    let path = value
        .get("fieldPath")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("field reference requires fieldPath"))?;
    FieldPath::from_dot_separated(path)
}

fn decode_order_by(value: &JsonValue) -> FirestoreResult<OrderBy> {
    let field = value
        .get("field")
        .map(decode_field_reference)
        .transpose()?
        .ok_or_else(|| invalid_argument("orderBy requires field"))?;
    let direction = match value.get("direction").and_then(JsonValue::as_str) {
        None | Some("ASCENDING") | Some("DIRECTION_UNSPECIFIED") => OrderDirection::Ascending,
        Some("DESCENDING") => OrderDirection::Descending,
        Some(other) => {
            return Err(invalid_argument(format!(
                "Unsupported order direction: {other}"
            )))
        }
    };
    Ok(OrderBy::new(field, direction))
}

fn decode_limit(value: &JsonValue) -> FirestoreResult<u32> {
    // Both the bare int and the Int32Value wrapper shape occur in practice.
    let raw = if let Some(n) = value.as_i64() {
        n
    } else if let Some(n) = value.get("value").and_then(JsonValue::as_i64) {
        n
    } else {
        return Err(invalid_argument("limit must be an integer"));
    };
    u32::try_from(raw).map_err(|_| invalid_argument("limit must be non-negative"))
}

/// Cursor positions arrive aligned with the effective ordering; `__name__`
/// components are relativized so they compare against the engine's
/// database-relative reference values.
fn decode_cursor(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
    order_by: &[OrderBy],
    start: bool,
) -> FirestoreResult<Bound> {
    let before = value
        .get("before")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    let values = value
        .get("values")
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .map(|entry| serializer.decode_value(entry))
                .collect::<FirestoreResult<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();

    let values = values
        .into_iter()
        .enumerate()
        .map(|(index, cursor_value)| {
            let targets_name = order_by
                .get(index)
                .map(|order| order.field().is_document_id())
                .unwrap_or(false);
            match (targets_name, cursor_value.kind()) {
                (true, ValueKind::Reference(name)) => {
                    FirestoreValue::from_reference(serializer.relative_reference(name))
                }
                _ => cursor_value,
            }
        })
        .collect();

    let inclusive = if start { before } else { !before };
    Ok(Bound::new(values, inclusive))
}

fn decode_find_nearest(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<FindNearest> {
    let vector_field = value
        .get("vectorField")
        .map(decode_field_reference)
        .transpose()?
        .ok_or_else(|| invalid_argument("findNearest requires vectorField"))?;

    let query_vector = value
        .get("queryVector")
        .map(|vector| serializer.decode_value(vector))
        .transpose()?
        .ok_or_else(|| invalid_argument("findNearest requires queryVector"))?;
    let query_vector = match query_vector.kind() {
        ValueKind::Vector(vector) => vector.clone(),
        ValueKind::Array(array) => {
            let components = array
                .values()
                .iter()
                .map(|component| match component.kind() {
                    ValueKind::Double(d) => Ok(*d),
                    ValueKind::Integer(n) => Ok(*n as f64),
                    _ => Err(invalid_argument("queryVector components must be numeric")),
                })
                .collect::<FirestoreResult<Vec<f64>>>()?;
            VectorValue::new(components)?
        }
        _ => return Err(invalid_argument("queryVector must be a vector value")),
    };

    let measure = match value.get("distanceMeasure").and_then(JsonValue::as_str) {
        Some("EUCLIDEAN") => DistanceMeasure::Euclidean,
        Some("COSINE") => DistanceMeasure::Cosine,
        Some("DOT_PRODUCT") => DistanceMeasure::DotProduct,
        Some(other) => {
            return Err(invalid_argument(format!(
                "Unsupported distance measure: {other}"
            )))
        }
        None => return Err(invalid_argument("findNearest requires distanceMeasure")),
    };

    let limit = value
        .get("limit")
        .map(decode_limit)
        .transpose()?
        .ok_or_else(|| invalid_argument("findNearest requires limit"))?;

    let distance_threshold = match value.get("distanceThreshold") {
        Some(threshold) => Some(
            threshold
                .as_f64()
                .or_else(|| threshold.get("value").and_then(JsonValue::as_f64))
                .ok_or_else(|| invalid_argument("distanceThreshold must be a double"))?,
        ),
        None => None,
    };

    let distance_result_field = value
        .get("distanceResultField")
        .and_then(JsonValue::as_str)
        .map(FieldPath::from_dot_separated)
        .transpose()?;

    Ok(FindNearest {
        vector_field,
        query_vector,
        limit,
        measure,
        distance_threshold,
        distance_result_field,
    })
}
