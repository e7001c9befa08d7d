mod aggregate;
mod definition;
mod evaluator;

pub use aggregate::{run_aggregation, AggregateDefinition, AggregateOperation};
pub use definition::{
    Bound, CompositeFilter, CompositeOperator, DistanceMeasure, FieldFilter, Filter,
    FilterOperator, FindNearest, LimitType, OrderBy, OrderDirection, QueryDefinition, UnaryFilter,
    UnaryOperator,
};
pub use evaluator::{run_query, QueryResult};
