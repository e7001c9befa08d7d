use std::collections::{BTreeMap, HashSet};

use crate::error::{
    already_exists, failed_precondition, invalid_argument, not_found, FirestoreResult,
};
use crate::model::{DocumentKey, FieldPath, Timestamp};
use crate::store::MetaDocument;
use crate::value::{values_equal, FirestoreValue, MapValue, SentinelValue, ValueKind};

/// Options that configure the behaviour of `set` style writes.
#[derive(Clone, Debug, Default)]
pub struct SetOptions {
    /// When `true`, the write merges the provided data into the existing
    /// document instead of replacing it.
    pub merge: bool,
    /// Explicit field mask that should be merged. When set, this takes
    /// precedence over the `merge` flag.
    pub merge_fields: Option<Vec<FieldPath>>,
}

impl SetOptions {
    pub fn merge_all() -> Self {
        Self {
            merge: true,
            merge_fields: None,
        }
    }

    pub fn merge_fields<I>(fields: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = FieldPath>,
    {
        let mut unique = Vec::new();
        let mut seen = HashSet::new();
        for field in fields {
            if seen.insert(field.canonical_string()) {
                unique.push(field);
            }
        }
        if unique.is_empty() {
            return Err(invalid_argument(
                "merge_fields requires at least one field path",
            ));
        }
        Ok(Self {
            merge: false,
            merge_fields: Some(unique),
        })
    }

    pub fn is_merge(&self) -> bool {
        self.merge || self.merge_fields.is_some()
    }

    pub fn field_mask(&self) -> Option<&[FieldPath]> {
        self.merge_fields.as_deref()
    }
}

/// Existence requirement a write imposes on the current document state.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(Timestamp),
}

impl Precondition {
    /// Checks this precondition against the state the store holds immediately
    /// before the write applies.
    pub fn check(&self, current: &MetaDocument) -> FirestoreResult<()> {
        match self {
            Precondition::None => Ok(()),
            Precondition::Exists(true) => {
                if current.exists() {
                    Ok(())
                } else {
                    Err(not_found(format!(
                        "No document to update: {}",
                        current.path()
                    )))
                }
            }
            Precondition::Exists(false) => {
                if current.exists() {
                    Err(already_exists(format!(
                        "Document already exists: {}",
                        current.path()
                    )))
                } else {
                    Ok(())
                }
            }
            Precondition::UpdateTime(expected) => {
                if !current.exists() {
                    return Err(not_found(format!(
                        "No document to update: {}",
                        current.path()
                    )));
                }
                if current.update_time() != Some(expected.truncated_to_micros()) {
                    return Err(failed_precondition(format!(
                        "The update time of document {} does not match the required precondition",
                        current.path()
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Describes a single field transform applied during a write.
#[derive(Clone, Debug)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

/// Write-time sentinel operations evaluated on the server side of the wire.
#[derive(Clone, Debug)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

/// One write inside a commit batch.
#[derive(Clone, Debug)]
pub enum WriteOperation {
    Set {
        key: DocumentKey,
        data: MapValue,
        mask: Option<Vec<FieldPath>>,
        transforms: Vec<FieldTransform>,
        precondition: Precondition,
    },
    Update {
        key: DocumentKey,
        data: MapValue,
        field_paths: Vec<FieldPath>,
        transforms: Vec<FieldTransform>,
        precondition: Precondition,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl WriteOperation {
    pub fn key(&self) -> &DocumentKey {
        match self {
            WriteOperation::Set { key, .. } => key,
            WriteOperation::Update { key, .. } => key,
            WriteOperation::Delete { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            WriteOperation::Set { precondition, .. } => precondition,
            WriteOperation::Update { precondition, .. } => precondition,
            WriteOperation::Delete { precondition, .. } => precondition,
        }
    }
}

/// Pre-encoded data for `set` style writes.
#[derive(Clone, Debug)]
pub struct EncodedSetData {
    pub map: MapValue,
    pub mask: Option<Vec<FieldPath>>,
    pub transforms: Vec<FieldTransform>,
}

/// Pre-encoded data for `update` style writes.
#[derive(Clone, Debug)]
pub struct EncodedUpdateData {
    pub map: MapValue,
    pub field_paths: Vec<FieldPath>,
    pub transforms: Vec<FieldTransform>,
}

/// Splits user data into plain fields, field transforms and delete markers,
/// producing the mask a `set` write carries.
pub fn encode_set_data(
    data: BTreeMap<String, FirestoreValue>,
    options: &SetOptions,
) -> FirestoreResult<EncodedSetData> {
    let sanitized = sanitize_for_write(data)?;

    if !sanitized.delete_paths.is_empty() && !options.is_merge() {
        return Err(invalid_argument(
            "delete_field() can only be used with update() or set() with merge enabled",
        ));
    }

    let mut available_paths = collect_update_paths(&sanitized.fields)?;
    available_paths.extend(sanitized.sentinel_paths.iter().cloned());
    available_paths.extend(sanitized.delete_paths.iter().cloned());

    let mut available_set = HashSet::new();
    let mut deduped_paths = Vec::new();
    for path in available_paths {
        if available_set.insert(path.canonical_string()) {
            deduped_paths.push(path);
        }
    }

    let (mask, transforms) = if let Some(mask) = options.field_mask() {
        validate_mask_against_available(mask, &available_set)?;
        // Transforms outside the explicit mask are silently dropped.
        let transforms = sanitized
            .transforms
            .into_iter()
            .filter(|transform| {
                mask.iter()
                    .any(|entry| transform.field_path().is_prefixed_by(entry))
            })
            .collect();
        (Some(mask.to_vec()), transforms)
    } else if options.merge {
        if deduped_paths.is_empty() {
            return Err(invalid_argument(
                "merge set requires the data to contain at least one field",
            ));
        }
        (Some(deduped_paths), sanitized.transforms)
    } else {
        (None, sanitized.transforms)
    };

    Ok(EncodedSetData {
        map: MapValue::new(sanitized.fields),
        mask,
        transforms,
    })
}

/// Prepares data for a field-path addressed update.
pub fn encode_update_data(
    data: BTreeMap<String, FirestoreValue>,
) -> FirestoreResult<EncodedUpdateData> {
    let sanitized = sanitize_for_write(data)?;
    if sanitized.fields.is_empty()
        && sanitized.transforms.is_empty()
        && sanitized.delete_paths.is_empty()
    {
        return Err(invalid_argument(
            "update requires at least one field/value pair",
        ));
    }
    let mut field_paths = collect_update_paths(&sanitized.fields)?;
    field_paths.extend(sanitized.delete_paths);
    Ok(EncodedUpdateData {
        map: MapValue::new(sanitized.fields),
        field_paths,
        transforms: sanitized.transforms,
    })
}

struct SanitizedData {
    fields: BTreeMap<String, FirestoreValue>,
    transforms: Vec<FieldTransform>,
    sentinel_paths: Vec<FieldPath>,
    delete_paths: Vec<FieldPath>,
}

fn sanitize_for_write(data: BTreeMap<String, FirestoreValue>) -> FirestoreResult<SanitizedData> {
    let mut sanitized = SanitizedData {
        fields: BTreeMap::new(),
        transforms: Vec::new(),
        sentinel_paths: Vec::new(),
        delete_paths: Vec::new(),
    };
    sanitized.fields = sanitize_map(&data, &[], &mut sanitized)?;
    Ok(sanitized)
}

fn sanitize_map(
    data: &BTreeMap<String, FirestoreValue>,
    parent_segments: &[String],
    out: &mut SanitizedData,
) -> FirestoreResult<BTreeMap<String, FirestoreValue>> {
    let mut cleaned = BTreeMap::new();
    for (key, value) in data {
        let mut segments = parent_segments.to_vec();
        segments.push(key.clone());
        let field_path = FieldPath::new(segments.clone())?;
        match value.kind().clone() {
            ValueKind::Sentinel(SentinelValue::Delete) => {
                out.delete_paths.push(field_path);
            }
            ValueKind::Sentinel(sentinel) => {
                validate_sentinel_usage(&sentinel, &field_path)?;
                out.transforms
                    .push(transform_from_sentinel(field_path.clone(), sentinel));
                out.sentinel_paths.push(field_path);
            }
            ValueKind::Map(map) => {
                let nested = sanitize_map(map.fields(), &segments, out)?;
                if !nested.is_empty() {
                    cleaned.insert(key.clone(), FirestoreValue::from_map(nested));
                }
            }
            ValueKind::Array(_) => {
                assert_no_sentinel_in_value(value, &field_path)?;
                cleaned.insert(key.clone(), value.clone());
            }
            _ => {
                cleaned.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(cleaned)
}

fn validate_sentinel_usage(
    sentinel: &SentinelValue,
    field_path: &FieldPath,
) -> FirestoreResult<()> {
    match sentinel {
        SentinelValue::ServerTimestamp | SentinelValue::Delete => Ok(()),
        SentinelValue::ArrayUnion(elements) | SentinelValue::ArrayRemove(elements) => {
            for element in elements {
                assert_no_sentinel_in_value(element, field_path)?;
            }
            Ok(())
        }
        SentinelValue::NumericIncrement(operand) => match operand.as_ref().kind() {
            ValueKind::Integer(_) | ValueKind::Double(_) => Ok(()),
            _ => Err(invalid_argument(
                "increment() requires a numeric operand",
            )),
        },
    }
}

fn transform_from_sentinel(field_path: FieldPath, sentinel: SentinelValue) -> FieldTransform {
    let operation = match sentinel {
        SentinelValue::ServerTimestamp => TransformOperation::ServerTimestamp,
        SentinelValue::ArrayUnion(elements) => TransformOperation::ArrayUnion(elements),
        SentinelValue::ArrayRemove(elements) => TransformOperation::ArrayRemove(elements),
        SentinelValue::NumericIncrement(operand) => TransformOperation::NumericIncrement(*operand),
        SentinelValue::Delete => unreachable!("delete markers are split off before this point"),
    };
    FieldTransform::new(field_path, operation)
}

fn assert_no_sentinel_in_value(value: &FirestoreValue, context: &FieldPath) -> FirestoreResult<()> {
    match value.kind() {
        ValueKind::Sentinel(_) => Err(invalid_argument(format!(
            "Invalid data. Sentinel values cannot be used inside arrays (field '{}').",
            context.canonical_string()
        ))),
        ValueKind::Array(array) => {
            for element in array.values() {
                assert_no_sentinel_in_value(element, context)?;
            }
            Ok(())
        }
        ValueKind::Map(map) => {
            for element in map.fields().values() {
                assert_no_sentinel_in_value(element, context)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn validate_mask_against_available(
    mask: &[FieldPath],
    available: &HashSet<String>,
) -> FirestoreResult<()> {
    for field in mask {
        if !available.contains(field.canonical_string().as_str()) {
            return Err(invalid_argument(format!(
                "Field '{}' is specified in merge_fields but missing from the provided data",
                field.canonical_string()
            )));
        }
    }
    Ok(())
}

fn collect_update_paths(
    data: &BTreeMap<String, FirestoreValue>,
) -> FirestoreResult<Vec<FieldPath>> {
    let mut paths = Vec::new();
    for (key, value) in data {
        collect_paths_from_value(&mut paths, vec![key.clone()], value)?;
    }
    Ok(paths)
}

fn collect_paths_from_value(
    acc: &mut Vec<FieldPath>,
    segments: Vec<String>,
    value: &FirestoreValue,
) -> FirestoreResult<()> {
    match value.kind() {
        ValueKind::Map(map) if !map.fields().is_empty() => {
            for (child_key, child_value) in map.fields() {
                let mut child_segments = segments.clone();
                child_segments.push(child_key.clone());
                collect_paths_from_value(acc, child_segments, child_value)?;
            }
            Ok(())
        }
        _ => {
            acc.push(FieldPath::new(segments)?);
            Ok(())
        }
    }
}

/// Applies `op` to `current`, returning the resulting field tree (or `None`
/// for a deletion) together with one transform result per field transform.
/// Transforms observe the document as it stands after the same write's
/// non-transform field updates.
pub fn apply_write(
    op: &WriteOperation,
    current: &MetaDocument,
    commit_time: Timestamp,
) -> FirestoreResult<(Option<MapValue>, Vec<FirestoreValue>)> {
    match op {
        WriteOperation::Set {
            data,
            mask,
            transforms,
            ..
        } => {
            let mut fields = match mask {
                None => data.fields().clone(),
                Some(mask) => {
                    let mut base = current
                        .data()
                        .map(|existing| existing.fields().clone())
                        .unwrap_or_default();
                    apply_masked_fields(&mut base, data, mask);
                    base
                }
            };
            let results = apply_transforms(&mut fields, transforms, commit_time);
            Ok((Some(MapValue::new(fields)), results))
        }
        WriteOperation::Update {
            data,
            field_paths,
            transforms,
            ..
        } => {
            let mut fields = current
                .data()
                .map(|existing| existing.fields().clone())
                .unwrap_or_default();
            apply_masked_fields(&mut fields, data, field_paths);
            let results = apply_transforms(&mut fields, transforms, commit_time);
            Ok((Some(MapValue::new(fields)), results))
        }
        WriteOperation::Delete { .. } => Ok((None, Vec::new())),
    }
}

fn apply_masked_fields(
    base: &mut BTreeMap<String, FirestoreValue>,
    data: &MapValue,
    mask: &[FieldPath],
) {
    for path in mask {
        match value_for_field_path(data, path) {
            Some(value) => set_value_at_field_path(base, path, value),
            // A masked path with no value in the payload deletes the field.
            None => remove_value_at_field_path(base, path),
        }
    }
}

fn apply_transforms(
    fields: &mut BTreeMap<String, FirestoreValue>,
    transforms: &[FieldTransform],
    commit_time: Timestamp,
) -> Vec<FirestoreValue> {
    let mut results = Vec::with_capacity(transforms.len());
    for transform in transforms {
        let current = value_for_segments(fields, transform.field_path().segments());
        let (stored, reported) = evaluate_transform(transform.operation(), current, commit_time);
        set_value_at_field_path(fields, transform.field_path(), stored);
        results.push(reported);
    }
    results
}

fn evaluate_transform(
    operation: &TransformOperation,
    current: Option<FirestoreValue>,
    commit_time: Timestamp,
) -> (FirestoreValue, FirestoreValue) {
    match operation {
        TransformOperation::ServerTimestamp => {
            let value = FirestoreValue::from_timestamp(commit_time);
            (value.clone(), value)
        }
        TransformOperation::NumericIncrement(operand) => {
            let result = increment_value(current.as_ref(), operand);
            (result.clone(), result)
        }
        TransformOperation::ArrayUnion(elements) => {
            let mut values = current_array_elements(current);
            for element in elements {
                if !values.iter().any(|existing| values_equal(existing, element)) {
                    values.push(element.clone());
                }
            }
            // Array transforms report a null result on the wire.
            (FirestoreValue::from_array(values), FirestoreValue::null())
        }
        TransformOperation::ArrayRemove(elements) => {
            let mut values = current_array_elements(current);
            values.retain(|existing| {
                !elements.iter().any(|element| values_equal(existing, element))
            });
            (FirestoreValue::from_array(values), FirestoreValue::null())
        }
    }
}

fn current_array_elements(current: Option<FirestoreValue>) -> Vec<FirestoreValue> {
    match current {
        Some(value) => match value.kind() {
            ValueKind::Array(array) => array.values().to_vec(),
            _ => Vec::new(),
        },
        None => Vec::new(),
    }
}

/// Numeric increment semantics: integer arithmetic saturates, mixing integer
/// and double promotes to double, and a missing or non-numeric base value is
/// replaced by the operand.
fn increment_value(current: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let current_kind = current.map(FirestoreValue::kind);
    match (current_kind, operand.kind()) {
        (Some(ValueKind::Integer(base)), ValueKind::Integer(delta)) => {
            FirestoreValue::from_integer(base.saturating_add(*delta))
        }
        (Some(ValueKind::Integer(base)), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(*base as f64 + delta)
        }
        (Some(ValueKind::Double(base)), ValueKind::Integer(delta)) => {
            FirestoreValue::from_double(base + *delta as f64)
        }
        (Some(ValueKind::Double(base)), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(base + delta)
        }
        _ => operand.clone(),
    }
}

pub(crate) fn value_for_field_path(map: &MapValue, path: &FieldPath) -> Option<FirestoreValue> {
    let mut fields = map.fields();
    let (last, parents) = path.segments().split_last()?;
    for segment in parents {
        match fields.get(segment)?.kind() {
            ValueKind::Map(child) => fields = child.fields(),
            _ => return None,
        }
    }
    fields.get(last).cloned()
}

pub(crate) fn set_value_at_field_path(
    fields: &mut BTreeMap<String, FirestoreValue>,
    path: &FieldPath,
    value: FirestoreValue,
) {
    set_value_at_segments(fields, path.segments(), value);
}

fn set_value_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    if segments.is_empty() {
        return;
    }

    if segments.len() == 1 {
        fields.insert(segments[0].clone(), value);
        return;
    }

    let first = &segments[0];
    let entry = fields
        .entry(first.clone())
        .or_insert_with(|| FirestoreValue::from_map(BTreeMap::new()));

    let mut child_fields = match entry.kind() {
        ValueKind::Map(map) => map.fields().clone(),
        _ => BTreeMap::new(),
    };

    set_value_at_segments(&mut child_fields, &segments[1..], value);
    *entry = FirestoreValue::from_map(child_fields);
}

pub(crate) fn remove_value_at_field_path(
    fields: &mut BTreeMap<String, FirestoreValue>,
    path: &FieldPath,
) {
    remove_value_at_segments(fields, path.segments());
}

fn remove_value_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    match segments {
        [] => {}
        [only] => {
            fields.remove(only);
        }
        [first, rest @ ..] => {
            let Some(entry) = fields.get_mut(first) else {
                return;
            };
            if let ValueKind::Map(map) = entry.kind() {
                let mut child_fields = map.fields().clone();
                remove_value_at_segments(&mut child_fields, rest);
                *entry = FirestoreValue::from_map(child_fields);
            }
        }
    }
}

fn value_for_segments(
    fields: &BTreeMap<String, FirestoreValue>,
    segments: &[String],
) -> Option<FirestoreValue> {
    let (last, parents) = segments.split_last()?;
    let mut current = fields;
    for segment in parents {
        match current.get(segment)?.kind() {
            ValueKind::Map(child) => current = child.fields(),
            _ => return None,
        }
    }
    current.get(last).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldPath;

    fn existing_doc(fields: BTreeMap<String, FirestoreValue>) -> MetaDocument {
        MetaDocument::new_state(
            DocumentKey::from_string("cities/sf").unwrap(),
            Some(MapValue::new(fields)),
            1,
            Some(Timestamp::new(1, 0)),
            Timestamp::new(1, 0),
            None,
        )
    }

    #[test]
    fn merge_collects_sentinel_paths() {
        let mut data = BTreeMap::new();
        data.insert("updated_at".to_string(), FirestoreValue::server_timestamp());
        let options = SetOptions::merge_all();
        let encoded = encode_set_data(data, &options).unwrap();
        let mask = encoded.mask.expect("mask");
        assert_eq!(mask.len(), 1);
        assert_eq!(mask[0].canonical_string(), "updated_at");
        assert_eq!(encoded.transforms.len(), 1);
    }

    #[test]
    fn merge_fields_drops_unlisted_transforms() {
        let mut data = BTreeMap::new();
        data.insert("kept".to_string(), FirestoreValue::from_integer(1));
        data.insert("touched".to_string(), FirestoreValue::server_timestamp());
        let options =
            SetOptions::merge_fields(vec![FieldPath::from_dot_separated("kept").unwrap()]).unwrap();
        let encoded = encode_set_data(data, &options).unwrap();
        assert!(encoded.transforms.is_empty());
    }

    #[test]
    fn update_with_only_transform_is_allowed() {
        let mut data = BTreeMap::new();
        data.insert(
            "counter".to_string(),
            FirestoreValue::numeric_increment(FirestoreValue::from_integer(1)),
        );
        let encoded = encode_update_data(data).unwrap();
        assert!(encoded.map.fields().is_empty());
        assert!(encoded.field_paths.is_empty());
        assert_eq!(encoded.transforms.len(), 1);
    }

    #[test]
    fn array_rejects_nested_sentinel() {
        let mut data = BTreeMap::new();
        data.insert(
            "values".to_string(),
            FirestoreValue::from_array(vec![FirestoreValue::server_timestamp()]),
        );
        let err = encode_set_data(data, &SetOptions::default()).unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn increment_requires_numeric_operand() {
        let mut data = BTreeMap::new();
        data.insert(
            "total".to_string(),
            FirestoreValue::numeric_increment(FirestoreValue::from_string("five")),
        );
        let err = encode_update_data(data).unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn delete_sentinel_requires_merge() {
        let mut data = BTreeMap::new();
        data.insert("gone".to_string(), FirestoreValue::delete_field());
        let err = encode_set_data(data.clone(), &SetOptions::default()).unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
        let encoded = encode_set_data(data, &SetOptions::merge_all()).unwrap();
        assert!(encoded.map.fields().is_empty());
        assert_eq!(encoded.mask.unwrap()[0].canonical_string(), "gone");
    }

    #[test]
    fn full_set_replaces_document() {
        let mut old = BTreeMap::new();
        old.insert("a".to_string(), FirestoreValue::from_integer(1));
        old.insert("b".to_string(), FirestoreValue::from_integer(2));
        let current = existing_doc(old);

        let mut new = BTreeMap::new();
        new.insert("a".to_string(), FirestoreValue::from_integer(9));
        new.insert("c".to_string(), FirestoreValue::from_integer(3));
        let op = WriteOperation::Set {
            key: current.key().clone(),
            data: MapValue::new(new.clone()),
            mask: None,
            transforms: Vec::new(),
            precondition: Precondition::None,
        };

        let (result, _) = apply_write(&op, &current, Timestamp::new(2, 0)).unwrap();
        assert_eq!(result.unwrap().fields(), &new);
    }

    #[test]
    fn merge_unions_nested_maps() {
        let mut nested = BTreeMap::new();
        nested.insert("x".to_string(), FirestoreValue::from_integer(1));
        nested.insert("y".to_string(), FirestoreValue::from_integer(2));
        let mut old = BTreeMap::new();
        old.insert("a".to_string(), FirestoreValue::from_integer(1));
        old.insert("b".to_string(), FirestoreValue::from_integer(2));
        old.insert("nested".to_string(), FirestoreValue::from_map(nested));
        let current = existing_doc(old);

        let mut new_nested = BTreeMap::new();
        new_nested.insert("y".to_string(), FirestoreValue::from_integer(42));
        new_nested.insert("z".to_string(), FirestoreValue::from_integer(7));
        let mut new = BTreeMap::new();
        new.insert("b".to_string(), FirestoreValue::from_integer(99));
        new.insert("c".to_string(), FirestoreValue::from_integer(3));
        new.insert("nested".to_string(), FirestoreValue::from_map(new_nested));

        let encoded = encode_set_data(new, &SetOptions::merge_all()).unwrap();
        let op = WriteOperation::Set {
            key: current.key().clone(),
            data: encoded.map,
            mask: encoded.mask,
            transforms: encoded.transforms,
            precondition: Precondition::None,
        };

        let (result, _) = apply_write(&op, &current, Timestamp::new(2, 0)).unwrap();
        let fields = result.unwrap();
        assert_eq!(
            fields.fields().get("a"),
            Some(&FirestoreValue::from_integer(1))
        );
        assert_eq!(
            fields.fields().get("b"),
            Some(&FirestoreValue::from_integer(99))
        );
        assert_eq!(
            fields.fields().get("c"),
            Some(&FirestoreValue::from_integer(3))
        );
        match fields.fields().get("nested").unwrap().kind() {
            ValueKind::Map(map) => {
                assert_eq!(
                    map.fields().get("x"),
                    Some(&FirestoreValue::from_integer(1))
                );
                assert_eq!(
                    map.fields().get("y"),
                    Some(&FirestoreValue::from_integer(42))
                );
                assert_eq!(
                    map.fields().get("z"),
                    Some(&FirestoreValue::from_integer(7))
                );
            }
            _ => panic!("nested must stay a map"),
        }
    }

    #[test]
    fn transforms_observe_same_write_fields() {
        let current = existing_doc(BTreeMap::new());

        let mut data = BTreeMap::new();
        data.insert("n".to_string(), FirestoreValue::from_integer(10));
        let op = WriteOperation::Set {
            key: current.key().clone(),
            data: MapValue::new(data),
            mask: None,
            transforms: vec![FieldTransform::new(
                FieldPath::from_dot_separated("n").unwrap(),
                TransformOperation::NumericIncrement(FirestoreValue::from_integer(5)),
            )],
            precondition: Precondition::None,
        };

        let (result, transform_results) =
            apply_write(&op, &current, Timestamp::new(2, 0)).unwrap();
        assert_eq!(
            result.unwrap().fields().get("n"),
            Some(&FirestoreValue::from_integer(15))
        );
        assert_eq!(transform_results, vec![FirestoreValue::from_integer(15)]);
    }

    #[test]
    fn array_union_dedupes_by_value() {
        let mut old = BTreeMap::new();
        old.insert(
            "tags".to_string(),
            FirestoreValue::from_array(vec![FirestoreValue::from_string("a")]),
        );
        let current = existing_doc(old);

        let op = WriteOperation::Update {
            key: current.key().clone(),
            data: MapValue::empty(),
            field_paths: Vec::new(),
            transforms: vec![FieldTransform::new(
                FieldPath::from_dot_separated("tags").unwrap(),
                TransformOperation::ArrayUnion(vec![
                    FirestoreValue::from_string("a"),
                    FirestoreValue::from_string("b"),
                ]),
            )],
            precondition: Precondition::Exists(true),
        };

        let (result, transform_results) =
            apply_write(&op, &current, Timestamp::new(2, 0)).unwrap();
        match result.unwrap().fields().get("tags").unwrap().kind() {
            ValueKind::Array(array) => assert_eq!(array.len(), 2),
            _ => panic!("tags must stay an array"),
        }
        assert_eq!(transform_results, vec![FirestoreValue::null()]);
    }

    #[test]
    fn precondition_failures_use_status_codes() {
        let current = existing_doc(BTreeMap::new());
        let missing = MetaDocument::missing(DocumentKey::from_string("cities/la").unwrap());

        assert_eq!(
            Precondition::Exists(false).check(&current).unwrap_err().code_str(),
            "firestore/already-exists"
        );
        assert_eq!(
            Precondition::Exists(true).check(&missing).unwrap_err().code_str(),
            "firestore/not-found"
        );
        assert_eq!(
            Precondition::UpdateTime(Timestamp::new(9, 0))
                .check(&current)
                .unwrap_err()
                .code_str(),
            "firestore/failed-precondition"
        );
        assert!(Precondition::UpdateTime(Timestamp::new(1, 0))
            .check(&current)
            .is_ok());
    }
}
