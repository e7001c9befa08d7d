use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::error::{invalid_argument, unimplemented, FirestoreResult};
use crate::model::{DatabaseId, DocumentKey, FieldPath, GeoPoint, PathCache, ResourcePath, Timestamp};
use crate::store::{
    FieldTransform, MetaDocument, Precondition, TransformOperation, WriteOperation, WriteResult,
};
use crate::value::{BytesValue, FirestoreValue, MapValue, ValueKind, VectorValue};

const VECTOR_TYPE_SENTINEL: &str = "__vector__";

/// Proto-JSON omits zero-valued latitude/longitude fields.
#[derive(Debug, Deserialize)]
struct LatLng {
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
}

/// Translates between the emulator's native types and the proto-JSON shapes
/// the GAPIC surface speaks.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.name()
    }

    pub fn documents_root(&self) -> String {
        format!("{}/documents", self.database_name())
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        format!("{}/{}", self.documents_root(), key.path().canonical_string())
    }

    /// Parses a full resource name into a document key.
    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let relative = self.relative_path_from_name(name)?;
        DocumentKey::from_path(relative)
    }

    /// Strips the `projects/{p}/databases/{d}/documents` prefix, validating
    /// that the name belongs to this database. Parses go through the shared
    /// path cache, so repeated names resolve to the same interned entry.
    pub fn relative_path_from_name(&self, name: &str) -> FirestoreResult<ResourcePath> {
        let root = self.documents_root();
        if name == root {
            return Ok(ResourcePath::root());
        }
        let prefix = format!("{root}/");
        match name.strip_prefix(&prefix) {
            Some(relative) => PathCache::global()
                .resolve(relative)
                .map(|path| (*path).clone()),
            None => Err(invalid_argument(format!(
                "Resource name \"{name}\" does not belong to database {}",
                self.database_name()
            ))),
        }
    }

    /// Turns a full reference name into the database-relative form the query
    /// engine compares against, passing already-relative paths through.
    pub fn relative_reference(&self, reference: &str) -> String {
        let prefix = format!("{}/", self.documents_root());
        reference
            .strip_prefix(&prefix)
            .map(str::to_string)
            .unwrap_or_else(|| reference.to_string())
    }

    pub fn encode_timestamp(&self, timestamp: Timestamp) -> String {
        encode_timestamp(timestamp)
    }

    pub fn decode_timestamp_string(&self, value: &str) -> FirestoreResult<Timestamp> {
        parse_timestamp(value)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> FirestoreResult<JsonValue> {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn encode_fields(&self, map: &MapValue) -> FirestoreResult<JsonValue> {
        encode_map_fields(map)
    }

    pub fn decode_fields(&self, value: &JsonValue) -> FirestoreResult<MapValue> {
        decode_map_value(value)
    }

    /// Encodes a document for `found` responses and listen frames.
    pub fn encode_document(&self, document: &MetaDocument) -> FirestoreResult<JsonValue> {
        self.encode_document_with_fields(document, None)
    }

    /// Encodes a document, optionally replacing its field tree (projection
    /// and synthesized distance fields use this).
    pub fn encode_document_with_fields(
        &self,
        document: &MetaDocument,
        fields: Option<&MapValue>,
    ) -> FirestoreResult<JsonValue> {
        let empty = MapValue::empty();
        let fields = fields.or(document.data()).unwrap_or(&empty);
        let mut encoded = serde_json::Map::new();
        encoded.insert("name".to_string(), json!(self.document_name(document.key())));
        encoded.insert("fields".to_string(), encode_fields_object(fields)?);
        if let Some(create_time) = document.create_time() {
            encoded.insert("createTime".to_string(), json!(encode_timestamp(create_time)));
        }
        if let Some(update_time) = document.update_time() {
            encoded.insert("updateTime".to_string(), json!(encode_timestamp(update_time)));
        }
        Ok(JsonValue::Object(encoded))
    }

    pub fn encode_write_result(&self, result: &WriteResult) -> FirestoreResult<JsonValue> {
        let mut encoded = serde_json::Map::new();
        if let Some(update_time) = result.update_time {
            encoded.insert("updateTime".to_string(), json!(encode_timestamp(update_time)));
        }
        if !result.transform_results.is_empty() {
            let transformed: FirestoreResult<Vec<JsonValue>> =
                result.transform_results.iter().map(encode_value).collect();
            encoded.insert("transformResults".to_string(), JsonValue::Array(transformed?));
        }
        Ok(JsonValue::Object(encoded))
    }

    /// Decodes one entry of a `Commit`/`BatchWrite` request's `writes` array.
    pub fn decode_write(&self, value: &JsonValue) -> FirestoreResult<WriteOperation> {
        let precondition = match value.get("currentDocument") {
            Some(current) => self.decode_precondition(current)?,
            None => Precondition::None,
        };

        if let Some(delete) = value.get("delete") {
            let name = delete
                .as_str()
                .ok_or_else(|| invalid_argument("delete must be a document name"))?;
            return Ok(WriteOperation::Delete {
                key: self.document_key_from_name(name)?,
                precondition,
            });
        }

        if let Some(update) = value.get("update") {
            let name = update
                .get("name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("update write is missing a document name"))?;
            let key = self.document_key_from_name(name)?;
            let data = match update.get("fields") {
                Some(_) => decode_map_value(update)?,
                None => MapValue::empty(),
            };

            let mask = match value.get("updateMask") {
                Some(mask) => Some(self.decode_field_mask(mask)?),
                None => None,
            };
            let transforms = match value.get("updateTransforms") {
                Some(JsonValue::Array(entries)) => entries
                    .iter()
                    .map(|entry| self.decode_field_transform(entry))
                    .collect::<FirestoreResult<Vec<_>>>()?,
                Some(_) => return Err(invalid_argument("updateTransforms must be an array")),
                None => Vec::new(),
            };

            return Ok(WriteOperation::Set {
                key,
                data,
                mask,
                transforms,
                precondition,
            });
        }

        if let Some(transform) = value.get("transform") {
            let name = transform
                .get("document")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("transform write is missing a document name"))?;
            let key = self.document_key_from_name(name)?;
            let transforms = match transform.get("fieldTransforms") {
                Some(JsonValue::Array(entries)) => entries
                    .iter()
                    .map(|entry| self.decode_field_transform(entry))
                    .collect::<FirestoreResult<Vec<_>>>()?,
                _ => return Err(invalid_argument("transform write requires fieldTransforms")),
            };
            return Ok(WriteOperation::Update {
                key,
                data: MapValue::empty(),
                field_paths: Vec::new(),
                transforms,
                precondition: match precondition {
                    Precondition::None => Precondition::Exists(true),
                    other => other,
                },
            });
        }

        Err(invalid_argument(
            "Write must contain one of update, delete or transform",
        ))
    }

    fn decode_field_mask(&self, value: &JsonValue) -> FirestoreResult<Vec<FieldPath>> {
        match value.get("fieldPaths") {
            Some(JsonValue::Array(entries)) => entries
                .iter()
                .map(|entry| {
                    entry
                        .as_str()
                        .ok_or_else(|| invalid_argument("fieldPaths entries must be strings"))
                        .and_then(FieldPath::from_dot_separated)
                })
                .collect(),
            _ => Err(invalid_argument("updateMask requires fieldPaths")),
        }
    }

    pub fn decode_field_transform(&self, value: &JsonValue) -> FirestoreResult<FieldTransform> {
        let field_path = value
            .get("fieldPath")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("field transform is missing fieldPath"))?;
        let field_path = FieldPath::from_dot_separated(field_path)?;

        if let Some(server_value) = value.get("setToServerValue") {
            return match server_value.as_str() {
                Some("REQUEST_TIME") => Ok(FieldTransform::new(
                    field_path,
                    TransformOperation::ServerTimestamp,
                )),
                Some(other) => Err(unimplemented(format!(
                    "Unsupported server value transform: {other}"
                ))),
                None => Err(invalid_argument("setToServerValue must be a string")),
            };
        }
        if let Some(elements) = value.get("appendMissingElements") {
            return Ok(FieldTransform::new(
                field_path,
                TransformOperation::ArrayUnion(self.decode_value_list(elements)?),
            ));
        }
        if let Some(elements) = value.get("removeAllFromArray") {
            return Ok(FieldTransform::new(
                field_path,
                TransformOperation::ArrayRemove(self.decode_value_list(elements)?),
            ));
        }
        if let Some(operand) = value.get("increment") {
            let operand = decode_value(operand)?;
            if !matches!(operand.kind(), ValueKind::Integer(_) | ValueKind::Double(_)) {
                return Err(invalid_argument("increment requires a numeric operand"));
            }
            return Ok(FieldTransform::new(
                field_path,
                TransformOperation::NumericIncrement(operand),
            ));
        }

        Err(unimplemented("Unsupported field transform variant"))
    }

    fn decode_value_list(&self, value: &JsonValue) -> FirestoreResult<Vec<FirestoreValue>> {
        match value.get("values") {
            Some(JsonValue::Array(entries)) => entries.iter().map(decode_value).collect(),
            Some(_) => Err(invalid_argument("values must be an array")),
            None => Ok(Vec::new()),
        }
    }

    pub fn decode_precondition(&self, value: &JsonValue) -> FirestoreResult<Precondition> {
        let exists = value.get("exists");
        let update_time = value.get("updateTime");
        match (exists, update_time) {
            (Some(exists), None) => exists
                .as_bool()
                .map(Precondition::Exists)
                .ok_or_else(|| invalid_argument("precondition exists must be a boolean")),
            (None, Some(update_time)) => {
                let raw = update_time
                    .as_str()
                    .ok_or_else(|| invalid_argument("precondition updateTime must be a string"))?;
                Ok(Precondition::UpdateTime(parse_timestamp(raw)?))
            }
            (None, None) => Ok(Precondition::None),
            (Some(_), Some(_)) => Err(invalid_argument(
                "Precondition must not set both exists and updateTime",
            )),
        }
    }

    pub fn decode_transaction_id(&self, value: &JsonValue) -> FirestoreResult<Bytes> {
        let raw = value
            .as_str()
            .ok_or_else(|| invalid_argument("transaction must be a base64 string"))?;
        let decoded = BASE64_STANDARD
            .decode(raw)
            .map_err(|err| invalid_argument(format!("Invalid transaction bytes: {err}")))?;
        Ok(Bytes::from(decoded))
    }

    pub fn encode_transaction_id(&self, id: &Bytes) -> String {
        BASE64_STANDARD.encode(id)
    }
}

fn encode_fields_object(map: &MapValue) -> FirestoreResult<JsonValue> {
    let mut fields = serde_json::Map::new();
    for (key, value) in map.fields() {
        fields.insert(key.clone(), encode_value(value)?);
    }
    Ok(JsonValue::Object(fields))
}

fn encode_map_fields(map: &MapValue) -> FirestoreResult<JsonValue> {
    Ok(json!({ "fields": encode_fields_object(map)? }))
}

fn encode_value(value: &FirestoreValue) -> FirestoreResult<JsonValue> {
    Ok(match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => {
            if double.is_nan() {
                json!({ "doubleValue": "NaN" })
            } else if double.is_infinite() {
                json!({ "doubleValue": if *double > 0.0 { "Infinity" } else { "-Infinity" } })
            } else {
                json!({ "doubleValue": double })
            }
        }
        ValueKind::Timestamp(timestamp) => {
            json!({ "timestampValue": encode_timestamp(*timestamp) })
        }
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => {
            json!({ "bytesValue": BASE64_STANDARD.encode(bytes.as_slice()) })
        }
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values = array
                .values()
                .iter()
                .map(encode_value)
                .collect::<FirestoreResult<Vec<_>>>()?;
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Vector(vector) => encode_vector(vector),
        ValueKind::Map(map) => json!({ "mapValue": encode_map_fields(map)? }),
        ValueKind::Sentinel(_) => {
            return Err(invalid_argument(
                "Sentinel values must be handled as field transforms before serialization",
            ))
        }
    })
}

/// Vectors travel as a tagged map, the shape the backend persists them in.
fn encode_vector(vector: &VectorValue) -> JsonValue {
    let values: Vec<JsonValue> = vector
        .values()
        .iter()
        .map(|component| json!({ "doubleValue": component }))
        .collect();
    json!({
        "mapValue": {
            "fields": {
                "__type__": { "stringValue": VECTOR_TYPE_SENTINEL },
                "value": { "arrayValue": { "values": values } }
            }
        }
    })
}

fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    let fields_object = match map.get("fields") {
        Some(fields_value) => fields_value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
        None => return Ok(MapValue::empty()),
    };

    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if let Some(null_value) = object.get("nullValue") {
        if null_value.is_null() || null_value.as_str() == Some("NULL_VALUE") {
            return Ok(FirestoreValue::null());
        }
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => match value.as_str() {
                "NaN" => f64::NAN,
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                other => other
                    .parse::<f64>()
                    .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            },
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp_str = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(parse_timestamp(
            timestamp_str,
        )?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let str_value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(str_value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let str_value = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BASE64_STANDARD
            .decode(str_value)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(BytesValue::from(decoded)));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let str_value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(str_value));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let decoded: LatLng = serde_json::from_value(geo_point.clone())
            .map_err(|err| invalid_argument(format!("Invalid geoPointValue: {err}")))?;
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(
            decoded.latitude.unwrap_or(0.0),
            decoded.longitude.unwrap_or(0.0),
        )?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let decoded = if let Some(values) = array_value.get("values") {
            match values.as_array() {
                Some(entries) => entries
                    .iter()
                    .map(decode_value)
                    .collect::<FirestoreResult<Vec<_>>>()?,
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };
        return Ok(FirestoreValue::from_array(decoded));
    }
    if let Some(map_value) = object.get("mapValue") {
        let map = decode_map_value(map_value)?;
        if let Some(vector) = decode_vector(&map)? {
            return Ok(FirestoreValue::from_vector(vector));
        }
        return Ok(FirestoreValue::from_map(map.into_fields()));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

fn decode_vector(map: &MapValue) -> FirestoreResult<Option<VectorValue>> {
    let is_vector = matches!(
        map.fields().get("__type__").map(FirestoreValue::kind),
        Some(ValueKind::String(tag)) if tag.as_str() == VECTOR_TYPE_SENTINEL
    );
    if !is_vector {
        return Ok(None);
    }
    let components = match map.fields().get("value").map(FirestoreValue::kind) {
        Some(ValueKind::Array(array)) => array
            .values()
            .iter()
            .map(|component| match component.kind() {
                ValueKind::Double(d) => Ok(*d),
                ValueKind::Integer(n) => Ok(*n as f64),
                _ => Err(invalid_argument("Vector components must be numeric")),
            })
            .collect::<FirestoreResult<Vec<f64>>>()?,
        _ => return Err(invalid_argument("Vector value is missing its components")),
    };
    VectorValue::new(components).map(Some)
}

fn encode_timestamp(timestamp: Timestamp) -> String {
    let truncated = timestamp.truncated_to_micros();
    Utc.timestamp_opt(truncated.seconds, truncated.nanos as u32)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().expect("zero timestamp"))
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> FirestoreResult<Timestamp> {
    let datetime = DateTime::parse_from_rfc3339(value)
        .map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
    let datetime_utc = datetime.with_timezone(&Utc);
    Ok(Timestamp::new(
        datetime_utc.timestamp(),
        datetime_utc.timestamp_subsec_nanos() as i32,
    )
    .truncated_to_micros())
}
