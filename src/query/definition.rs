use crate::error::{invalid_argument, FirestoreResult};
use crate::model::{DocumentKey, FieldPath, ResourcePath};
use crate::value::{is_nan_value, is_null_value, FirestoreValue, ValueKind, VectorValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Equal,
    NotEqual,
    ArrayContains,
    In,
    ArrayContainsAny,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "LESS_THAN",
            FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            FilterOperator::GreaterThan => "GREATER_THAN",
            FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            FilterOperator::Equal => "EQUAL",
            FilterOperator::NotEqual => "NOT_EQUAL",
            FilterOperator::ArrayContains => "ARRAY_CONTAINS",
            FilterOperator::In => "IN",
            FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
            FilterOperator::NotIn => "NOT_IN",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOperator {
    IsNan,
    IsNull,
    IsNotNan,
    IsNotNull,
}

impl UnaryOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnaryOperator::IsNan => "IS_NAN",
            UnaryOperator::IsNull => "IS_NULL",
            UnaryOperator::IsNotNan => "IS_NOT_NAN",
            UnaryOperator::IsNotNull => "IS_NOT_NULL",
        }
    }
}

#[derive(Clone, Debug)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, operator: FilterOperator, value: FirestoreValue) -> Self {
        Self {
            field,
            operator,
            value,
        }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }
}

#[derive(Clone, Debug)]
pub struct UnaryFilter {
    field: FieldPath,
    operator: UnaryOperator,
}

impl UnaryFilter {
    pub fn new(field: FieldPath, operator: UnaryOperator) -> Self {
        Self { field, operator }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> UnaryOperator {
        self.operator
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositeOperator {
    And,
    Or,
}

impl CompositeOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompositeOperator::And => "AND",
            CompositeOperator::Or => "OR",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CompositeFilter {
    operator: CompositeOperator,
    filters: Vec<Filter>,
}

impl CompositeFilter {
    pub fn new(operator: CompositeOperator, filters: Vec<Filter>) -> Self {
        Self { operator, filters }
    }

    pub fn operator(&self) -> CompositeOperator {
        self.operator
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }
}

/// A node in the query's filter tree.
#[derive(Clone, Debug)]
pub enum Filter {
    Field(FieldFilter),
    Unary(UnaryFilter),
    Composite(CompositeFilter),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

impl OrderDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderDirection::Ascending => "ASCENDING",
            OrderDirection::Descending => "DESCENDING",
        }
    }
}

#[derive(Clone, Debug)]
pub struct OrderBy {
    field: FieldPath,
    direction: OrderDirection,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: OrderDirection) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }
}

/// A cursor over the effective ordering's value tuple.
#[derive(Clone, Debug)]
pub struct Bound {
    values: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(values: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self { values, inclusive }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitType {
    First,
    Last,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistanceMeasure {
    Euclidean,
    Cosine,
    DotProduct,
}

impl DistanceMeasure {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMeasure::Euclidean => "EUCLIDEAN",
            DistanceMeasure::Cosine => "COSINE",
            DistanceMeasure::DotProduct => "DOT_PRODUCT",
        }
    }
}

/// A vector nearest-neighbour stage appended to the query pipeline.
#[derive(Clone, Debug)]
pub struct FindNearest {
    pub vector_field: FieldPath,
    pub query_vector: VectorValue,
    pub limit: u32,
    pub measure: DistanceMeasure,
    pub distance_threshold: Option<f64>,
    pub distance_result_field: Option<FieldPath>,
}

/// The structured query the engine evaluates: scope, filter tree, ordering,
/// cursors, limits, projection and an optional nearest-neighbour stage.
#[derive(Clone, Debug)]
pub struct QueryDefinition {
    parent: ResourcePath,
    collection_id: String,
    all_descendants: bool,
    filter: Option<Filter>,
    order_by: Vec<OrderBy>,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
    limit: Option<u32>,
    limit_type: LimitType,
    projection: Option<Vec<FieldPath>>,
    find_nearest: Option<FindNearest>,
}

impl QueryDefinition {
    pub fn new(parent: ResourcePath, collection_id: impl Into<String>) -> Self {
        Self {
            parent,
            collection_id: collection_id.into(),
            all_descendants: false,
            filter: None,
            order_by: Vec::new(),
            start_at: None,
            end_at: None,
            limit: None,
            limit_type: LimitType::First,
            projection: None,
            find_nearest: None,
        }
    }

    pub fn with_all_descendants(mut self, all_descendants: bool) -> Self {
        self.all_descendants = all_descendants;
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn with_start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn with_end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn with_limit(mut self, limit: u32, limit_type: LimitType) -> Self {
        self.limit = Some(limit);
        self.limit_type = limit_type;
        self
    }

    pub fn with_projection(mut self, fields: Vec<FieldPath>) -> Self {
        self.projection = Some(fields);
        self
    }

    pub fn with_find_nearest(mut self, stage: FindNearest) -> Self {
        self.find_nearest = Some(stage);
        self
    }

    pub fn parent(&self) -> &ResourcePath {
        &self.parent
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    pub fn all_descendants(&self) -> bool {
        self.all_descendants
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn projection(&self) -> Option<&[FieldPath]> {
        self.projection.as_deref()
    }

    pub fn find_nearest(&self) -> Option<&FindNearest> {
        self.find_nearest.as_ref()
    }

    /// The explicit ordering plus the implicit `__name__` tiebreak, which
    /// inherits the direction of the last explicit clause.
    pub fn effective_order_by(&self) -> Vec<OrderBy> {
        let mut effective = self.order_by.clone();
        let has_name = effective
            .iter()
            .any(|order| order.field().is_document_id());
        if !has_name {
            let direction = effective
                .last()
                .map(|order| order.direction())
                .unwrap_or(OrderDirection::Ascending);
            effective.push(OrderBy::new(FieldPath::document_id(), direction));
        }
        effective
    }

    /// Whether `key` is inside this query's collection scope.
    pub fn matches_collection(&self, key: &DocumentKey) -> bool {
        let collection = key.collection_path();
        if self.all_descendants {
            collection.last_segment() == Some(self.collection_id.as_str())
                && self.parent.is_prefix_of(key.path())
        } else {
            collection.parent() == self.parent
                && collection.last_segment() == Some(self.collection_id.as_str())
        }
    }

    /// Structural validation. Deferred to first evaluation for listener
    /// targets, so broken queries surface on the stream error channel rather
    /// than at registration.
    pub fn validate(&self) -> FirestoreResult<()> {
        if self.limit_type == LimitType::Last && self.order_by.is_empty() {
            return Err(invalid_argument(
                "limit_to_last() queries require specifying at least one order_by() clause",
            ));
        }

        let mut in_fields = Vec::new();
        let mut not_in_fields = Vec::new();
        if let Some(filter) = &self.filter {
            validate_filter(filter, &mut in_fields, &mut not_in_fields)?;
        }
        for not_in_field in &not_in_fields {
            if in_fields.contains(not_in_field) {
                return Err(invalid_argument(format!(
                    "Invalid query. You cannot use 'in' and 'not_in' filters on the same field ({not_in_field})"
                )));
            }
        }
        Ok(())
    }
}

fn validate_filter(
    filter: &Filter,
    in_fields: &mut Vec<String>,
    not_in_fields: &mut Vec<String>,
) -> FirestoreResult<()> {
    match filter {
        Filter::Field(field_filter) => {
            validate_field_filter(field_filter)?;
            match field_filter.operator() {
                FilterOperator::In => {
                    in_fields.push(field_filter.field().canonical_string());
                }
                FilterOperator::NotIn => {
                    not_in_fields.push(field_filter.field().canonical_string());
                }
                _ => {}
            }
            Ok(())
        }
        Filter::Unary(_) => Ok(()),
        Filter::Composite(composite) => {
            for child in composite.filters() {
                validate_filter(child, in_fields, not_in_fields)?;
            }
            Ok(())
        }
    }
}

fn validate_field_filter(filter: &FieldFilter) -> FirestoreResult<()> {
    let operator = filter.operator();
    let value = filter.value();

    if is_null_value(value) && !matches!(operator, FilterOperator::Equal | FilterOperator::NotEqual)
    {
        return Err(invalid_argument(format!(
            "Invalid query. Null only supports EQUAL and NOT_EQUAL comparisons (got {})",
            operator.as_str()
        )));
    }
    if is_nan_value(value) && !matches!(operator, FilterOperator::Equal | FilterOperator::NotEqual)
    {
        return Err(invalid_argument(format!(
            "Invalid query. NaN only supports EQUAL and NOT_EQUAL comparisons (got {})",
            operator.as_str()
        )));
    }

    match operator {
        FilterOperator::ArrayContains => {
            // Null/NaN never match array membership, so the backend rejects
            // them outright.
            if is_null_value(value) || is_nan_value(value) {
                return Err(invalid_argument(
                    "Invalid query. ARRAY_CONTAINS does not support null or NaN operands",
                ));
            }
            Ok(())
        }
        FilterOperator::In | FilterOperator::NotIn | FilterOperator::ArrayContainsAny => {
            match value.kind() {
                ValueKind::Array(array) => {
                    if array.is_empty() {
                        return Err(invalid_argument(format!(
                            "Invalid query. {} requires a non-empty array operand",
                            operator.as_str()
                        )));
                    }
                    if operator == FilterOperator::ArrayContainsAny
                        && array
                            .values()
                            .iter()
                            .any(|v| is_null_value(v) || is_nan_value(v))
                    {
                        return Err(invalid_argument(
                            "Invalid query. ARRAY_CONTAINS_ANY does not support null or NaN operands",
                        ));
                    }
                    Ok(())
                }
                _ => Err(invalid_argument(format!(
                    "Invalid query. {} requires an array operand",
                    operator.as_str()
                ))),
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_query() -> QueryDefinition {
        QueryDefinition::new(ResourcePath::root(), "cities")
    }

    #[test]
    fn matches_direct_children_only() {
        let query = base_query();
        assert!(query.matches_collection(&DocumentKey::from_string("cities/sf").unwrap()));
        assert!(!query.matches_collection(
            &DocumentKey::from_string("cities/sf/districts/soma").unwrap()
        ));
        assert!(!query.matches_collection(&DocumentKey::from_string("users/ada").unwrap()));
    }

    #[test]
    fn collection_group_matches_any_depth() {
        let query = base_query().with_all_descendants(true);
        assert!(query.matches_collection(&DocumentKey::from_string("cities/sf").unwrap()));
        assert!(query.matches_collection(
            &DocumentKey::from_string("regions/west/cities/sf").unwrap()
        ));
        assert!(!query.matches_collection(&DocumentKey::from_string("users/ada").unwrap()));
    }

    #[test]
    fn effective_order_appends_name_tiebreak() {
        let query = base_query().with_order_by(OrderBy::new(
            FieldPath::from_dot_separated("population").unwrap(),
            OrderDirection::Descending,
        ));
        let effective = query.effective_order_by();
        assert_eq!(effective.len(), 2);
        assert!(effective[1].field().is_document_id());
        assert_eq!(effective[1].direction(), OrderDirection::Descending);
    }

    #[test]
    fn rejects_in_and_not_in_on_same_field() {
        let field = FieldPath::from_dot_separated("state").unwrap();
        let operand =
            FirestoreValue::from_array(vec![FirestoreValue::from_string("CA")]);
        let query = base_query().with_filter(Filter::Composite(CompositeFilter::new(
            CompositeOperator::And,
            vec![
                Filter::Field(FieldFilter::new(
                    field.clone(),
                    FilterOperator::In,
                    operand.clone(),
                )),
                Filter::Field(FieldFilter::new(field, FilterOperator::NotIn, operand)),
            ],
        )));
        let err = query.validate().unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn rejects_array_contains_null_and_nan() {
        for operand in [FirestoreValue::null(), FirestoreValue::from_double(f64::NAN)] {
            let query = base_query().with_filter(Filter::Field(FieldFilter::new(
                FieldPath::from_dot_separated("tags").unwrap(),
                FilterOperator::ArrayContains,
                operand,
            )));
            let err = query.validate().unwrap_err();
            assert_eq!(err.code_str(), "firestore/invalid-argument");
        }
    }

    #[test]
    fn rejects_range_comparison_against_null() {
        let query = base_query().with_filter(Filter::Field(FieldFilter::new(
            FieldPath::from_dot_separated("n").unwrap(),
            FilterOperator::GreaterThan,
            FirestoreValue::null(),
        )));
        assert!(query.validate().is_err());
    }

    #[test]
    fn limit_to_last_requires_order() {
        let query = base_query().with_limit(2, LimitType::Last);
        assert!(query.validate().is_err());
        let ordered = base_query()
            .with_order_by(OrderBy::new(
                FieldPath::from_dot_separated("n").unwrap(),
                OrderDirection::Ascending,
            ))
            .with_limit(2, LimitType::Last);
        assert!(ordered.validate().is_ok());
    }
}
