use std::cmp::Ordering;

use crate::value::{ArrayValue, FirestoreValue, MapValue, ValueKind, VectorValue};

/// Rank of a value in the backend's cross-type ordering. NaN sorts as its own
/// band between booleans and the remaining numbers; vectors sort between
/// arrays and maps.
pub fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Double(d) if d.is_nan() => 2,
        ValueKind::Integer(_) | ValueKind::Double(_) => 3,
        ValueKind::Timestamp(_) => 4,
        ValueKind::String(_) => 5,
        ValueKind::Bytes(_) => 6,
        ValueKind::Reference(_) => 7,
        ValueKind::GeoPoint(_) => 8,
        ValueKind::Array(_) => 9,
        ValueKind::Vector(_) => 10,
        ValueKind::Map(_) => 11,
        ValueKind::Sentinel(_) => 12,
    }
}

/// Total order over stored values, matching the backend's documented
/// cross-type comparison rules. Integers and doubles compare numerically
/// within the shared number band.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_order = type_order(left);
    let right_order = type_order(right);
    if left_order != right_order {
        return left_order.cmp(&right_order);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => {
            compare_finite_doubles(*a as f64, *b)
        }
        (ValueKind::Double(a), ValueKind::Integer(b)) => {
            compare_finite_doubles(*a, *b as f64)
        }
        (ValueKind::Double(a), ValueKind::Double(b)) => {
            if a.is_nan() && b.is_nan() {
                Ordering::Equal
            } else {
                compare_finite_doubles(*a, *b)
            }
        }
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => compare_references(a, b),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => {
            compare_finite_doubles(a.latitude(), b.latitude())
                .then_with(|| compare_finite_doubles(a.longitude(), b.longitude()))
        }
        (ValueKind::Array(a), ValueKind::Array(b)) => compare_arrays(a, b),
        (ValueKind::Vector(a), ValueKind::Vector(b)) => compare_vectors(a, b),
        (ValueKind::Map(a), ValueKind::Map(b)) => compare_maps(a, b),
        _ => Ordering::Equal,
    }
}

/// Equality as the query engine sees it: numerically across integer/double,
/// with null and NaN as distinct, self-equal-only special cases.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    compare_values(left, right) == Ordering::Equal
}

pub fn is_null_value(value: &FirestoreValue) -> bool {
    matches!(value.kind(), ValueKind::Null)
}

pub fn is_nan_value(value: &FirestoreValue) -> bool {
    matches!(value.kind(), ValueKind::Double(d) if d.is_nan())
}

fn compare_finite_doubles(a: f64, b: f64) -> Ordering {
    // NaN never reaches this branch thanks to the type-order band.
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// References compare segment by segment, not as raw strings, so that
/// `docs/2` sorts before `docs/10/sub/x`.
fn compare_references(left: &str, right: &str) -> Ordering {
    let left_segments = left.split('/');
    let mut right_segments = right.split('/');
    for left_segment in left_segments {
        match right_segments.next() {
            Some(right_segment) => match left_segment.cmp(right_segment) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            },
            None => return Ordering::Greater,
        }
    }
    if right_segments.next().is_some() {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

fn compare_arrays(left: &ArrayValue, right: &ArrayValue) -> Ordering {
    for (l, r) in left.values().iter().zip(right.values().iter()) {
        match compare_values(l, r) {
            Ordering::Equal => continue,
            non_eq => return non_eq,
        }
    }
    left.len().cmp(&right.len())
}

/// Vectors compare by dimension count first, then element-wise.
fn compare_vectors(left: &VectorValue, right: &VectorValue) -> Ordering {
    match left.dimensions().cmp(&right.dimensions()) {
        Ordering::Equal => {}
        non_eq => return non_eq,
    }
    for (l, r) in left.values().iter().zip(right.values().iter()) {
        match compare_finite_doubles(*l, *r) {
            Ordering::Equal => continue,
            non_eq => return non_eq,
        }
    }
    Ordering::Equal
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    let mut left_entries = left.fields().iter();
    let mut right_entries = right.fields().iter();
    loop {
        match (left_entries.next(), right_entries.next()) {
            (Some((lk, lv)), Some((rk, rv))) => {
                match lk.cmp(rk).then_with(|| compare_values(lv, rv)) {
                    Ordering::Equal => continue,
                    non_eq => return non_eq,
                }
            }
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn cross_type_ranking() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(true),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(1),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_vector(crate::value::VectorValue::new(vec![1.0]).unwrap()),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for window in ordered.windows(2) {
            assert_eq!(compare_values(&window[0], &window[1]), Ordering::Less);
        }
    }

    #[test]
    fn integers_and_doubles_interleave() {
        let int = FirestoreValue::from_integer(2);
        let double = FirestoreValue::from_double(1.5);
        assert_eq!(compare_values(&double, &int), Ordering::Less);
        assert!(values_equal(
            &FirestoreValue::from_integer(1),
            &FirestoreValue::from_double(1.0)
        ));
    }

    #[test]
    fn nan_is_self_equal_only() {
        let nan = FirestoreValue::from_double(f64::NAN);
        assert!(values_equal(&nan, &nan));
        assert!(!values_equal(&nan, &FirestoreValue::from_double(0.0)));
        assert!(!values_equal(&nan, &FirestoreValue::null()));
    }

    #[test]
    fn type_equality_is_exact_for_non_numbers() {
        assert!(!values_equal(
            &FirestoreValue::from_integer(1),
            &FirestoreValue::from_string("1")
        ));
    }

    #[test]
    fn references_compare_by_segment() {
        let a = FirestoreValue::from_reference("docs/2");
        let b = FirestoreValue::from_reference("docs/10/sub/x");
        assert_eq!(compare_values(&a, &b), Ordering::Greater);
    }

    #[test]
    fn vectors_compare_by_dimension_first() {
        let short = FirestoreValue::from_vector(VectorValue::new(vec![9.0]).unwrap());
        let long = FirestoreValue::from_vector(VectorValue::new(vec![1.0, 1.0]).unwrap());
        assert_eq!(compare_values(&short, &long), Ordering::Less);
    }
}
