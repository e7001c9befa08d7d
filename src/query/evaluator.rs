use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::FirestoreResult;
use crate::model::FieldPath;
use crate::query::definition::{
    Bound, DistanceMeasure, Filter, FilterOperator, FindNearest, LimitType, OrderBy,
    OrderDirection, QueryDefinition, UnaryOperator,
};
use crate::store::MetaDocument;
use crate::value::{
    compare_values, is_nan_value, is_null_value, type_order, values_equal, FirestoreValue,
    ValueKind,
};

/// One evaluated result row: the matching document plus the synthesized
/// nearest-neighbour distance when the query carried a `find_nearest` stage.
#[derive(Clone, Debug)]
pub struct QueryResult {
    pub document: Arc<MetaDocument>,
    pub distance: Option<f64>,
}

/// Evaluates `definition` against a snapshot of candidate documents,
/// returning the filtered, ordered and bounded result set.
pub fn run_query(
    documents: Vec<Arc<MetaDocument>>,
    definition: &QueryDefinition,
) -> FirestoreResult<Vec<QueryResult>> {
    definition.validate()?;

    let mut matches: Vec<Arc<MetaDocument>> = documents
        .into_iter()
        .filter(|doc| doc.exists())
        .filter(|doc| definition.matches_collection(doc.key()))
        .filter(|doc| match definition.filter() {
            Some(filter) => matches_filter(doc, filter),
            None => true,
        })
        .collect();

    if let Some(stage) = definition.find_nearest() {
        return Ok(run_find_nearest(matches, stage));
    }

    let order_by = definition.effective_order_by();
    matches.sort_by(|left, right| compare_documents(left, right, &order_by));

    if let Some(bound) = definition.start_at() {
        matches.retain(|doc| !is_before_start_bound(doc, bound, &order_by));
    }
    if let Some(bound) = definition.end_at() {
        matches.retain(|doc| !is_after_end_bound(doc, bound, &order_by));
    }

    if let Some(limit) = definition.limit() {
        let limit = limit as usize;
        match definition.limit_type() {
            LimitType::First => {
                if matches.len() > limit {
                    matches.truncate(limit);
                }
            }
            LimitType::Last => {
                if matches.len() > limit {
                    let start = matches.len() - limit;
                    matches.drain(0..start);
                }
            }
        }
    }

    Ok(matches
        .into_iter()
        .map(|document| QueryResult {
            document,
            distance: None,
        })
        .collect())
}

/// Distance ranking over the filtered candidates. Documents missing the
/// vector field or with mismatched dimensionality are excluded.
fn run_find_nearest(candidates: Vec<Arc<MetaDocument>>, stage: &FindNearest) -> Vec<QueryResult> {
    let mut scored: Vec<QueryResult> = candidates
        .into_iter()
        .filter_map(|document| {
            let value = document.field(&stage.vector_field)?.clone();
            let vector = match value.kind() {
                ValueKind::Vector(vector) => vector.clone(),
                _ => return None,
            };
            if vector.dimensions() != stage.query_vector.dimensions() {
                return None;
            }
            let distance = match stage.measure {
                DistanceMeasure::Euclidean => stage.query_vector.euclidean_distance(&vector),
                DistanceMeasure::Cosine => stage.query_vector.cosine_distance(&vector),
                DistanceMeasure::DotProduct => stage.query_vector.dot_product(&vector),
            };
            Some(QueryResult {
                document,
                distance: Some(distance),
            })
        })
        .collect();

    if let Some(threshold) = stage.distance_threshold {
        scored.retain(|result| {
            let distance = result.distance.unwrap_or(f64::NAN);
            match stage.measure {
                // For dot product a larger value means closer.
                DistanceMeasure::DotProduct => distance >= threshold,
                _ => distance <= threshold,
            }
        });
    }

    scored.sort_by(|left, right| {
        let l = left.distance.unwrap_or(f64::NAN);
        let r = right.distance.unwrap_or(f64::NAN);
        let by_distance = match stage.measure {
            DistanceMeasure::DotProduct => compare_distances(r, l),
            _ => compare_distances(l, r),
        };
        by_distance.then_with(|| left.document.key().cmp(right.document.key()))
    });

    scored.truncate(stage.limit as usize);
    scored
}

fn compare_distances(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn matches_filter(doc: &MetaDocument, filter: &Filter) -> bool {
    match filter {
        Filter::Field(field_filter) => {
            let value = field_value(doc, field_filter.field());
            match value {
                Some(value) => evaluate_operator(field_filter.operator(), &value, field_filter.value()),
                // A missing field matches nothing, not even NOT_EQUAL.
                None => false,
            }
        }
        Filter::Unary(unary) => {
            let value = field_value(doc, unary.field());
            match unary.operator() {
                UnaryOperator::IsNan => value.as_ref().is_some_and(is_nan_value),
                UnaryOperator::IsNull => value.as_ref().is_some_and(is_null_value),
                UnaryOperator::IsNotNan => value
                    .as_ref()
                    .is_some_and(|v| !is_nan_value(v) && !is_null_value(v)),
                UnaryOperator::IsNotNull => value.as_ref().is_some_and(|v| !is_null_value(v)),
            }
        }
        Filter::Composite(composite) => {
            let mut children = composite.filters().iter();
            match composite.operator() {
                crate::query::definition::CompositeOperator::And => {
                    children.all(|child| matches_filter(doc, child))
                }
                crate::query::definition::CompositeOperator::Or => {
                    children.any(|child| matches_filter(doc, child))
                }
            }
        }
    }
}

fn evaluate_operator(
    operator: FilterOperator,
    value: &FirestoreValue,
    operand: &FirestoreValue,
) -> bool {
    match operator {
        FilterOperator::Equal => values_equal(value, operand),
        FilterOperator::NotEqual => !is_null_value(value) && !values_equal(value, operand),
        FilterOperator::LessThan => same_band_compare(value, operand) == Some(Ordering::Less),
        FilterOperator::LessThanOrEqual => matches!(
            same_band_compare(value, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOperator::GreaterThan => same_band_compare(value, operand) == Some(Ordering::Greater),
        FilterOperator::GreaterThanOrEqual => matches!(
            same_band_compare(value, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOperator::ArrayContains => match value.kind() {
            ValueKind::Array(array) => array
                .values()
                .iter()
                .any(|candidate| values_equal(candidate, operand)),
            _ => false,
        },
        FilterOperator::ArrayContainsAny => match (value.kind(), operand.kind()) {
            (ValueKind::Array(array), ValueKind::Array(needles)) => needles
                .values()
                .iter()
                .any(|needle| array.values().iter().any(|c| values_equal(c, needle))),
            _ => false,
        },
        FilterOperator::In => match operand.kind() {
            ValueKind::Array(candidates) => candidates
                .values()
                .iter()
                .any(|candidate| values_equal(candidate, value)),
            _ => false,
        },
        FilterOperator::NotIn => match operand.kind() {
            // NOT_IN additionally rules out null and NaN field values; a
            // missing field was already excluded above.
            ValueKind::Array(candidates) => {
                !is_null_value(value)
                    && !is_nan_value(value)
                    && candidates
                        .values()
                        .iter()
                        .all(|candidate| !values_equal(candidate, value))
            }
            _ => false,
        },
    }
}

/// Range comparisons only match values in the operand's type band.
fn same_band_compare(value: &FirestoreValue, operand: &FirestoreValue) -> Option<Ordering> {
    if type_order(value) != type_order(operand) {
        return None;
    }
    Some(compare_values(value, operand))
}

fn field_value(doc: &MetaDocument, field: &FieldPath) -> Option<FirestoreValue> {
    if field.is_document_id() {
        return Some(FirestoreValue::from_reference(doc.path()));
    }
    doc.field(field).cloned()
}

fn compare_documents(left: &MetaDocument, right: &MetaDocument, order_by: &[OrderBy]) -> Ordering {
    for order in order_by {
        let left_value = field_value(left, order.field());
        let right_value = field_value(right, order.field());

        // Missing fields sort before any present value.
        let mut ordering = match (&left_value, &right_value) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(l), Some(r)) => compare_values(l, r),
        };
        if order.direction() == OrderDirection::Descending {
            ordering = ordering.reverse();
        }
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn is_before_start_bound(doc: &MetaDocument, bound: &Bound, order_by: &[OrderBy]) -> bool {
    let ordering = compare_document_to_bound(doc, bound, order_by);
    if bound.inclusive() {
        ordering == Ordering::Less
    } else {
        ordering != Ordering::Greater
    }
}

fn is_after_end_bound(doc: &MetaDocument, bound: &Bound, order_by: &[OrderBy]) -> bool {
    let ordering = compare_document_to_bound(doc, bound, order_by);
    if bound.inclusive() {
        ordering == Ordering::Greater
    } else {
        ordering != Ordering::Less
    }
}

fn compare_document_to_bound(doc: &MetaDocument, bound: &Bound, order_by: &[OrderBy]) -> Ordering {
    for (index, order) in order_by.iter().enumerate() {
        if index >= bound.values().len() {
            break;
        }

        let bound_value = &bound.values()[index];
        let doc_value = field_value(doc, order.field()).unwrap_or_else(FirestoreValue::null);

        let mut ordering = compare_values(&doc_value, bound_value);
        if order.direction() == OrderDirection::Descending {
            ordering = ordering.reverse();
        }
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}
