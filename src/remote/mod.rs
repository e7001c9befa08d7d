mod rpc;
mod serializer;
mod structured_query;

pub use rpc::{FirestoreRpc, ListenStream};
pub use serializer::JsonProtoSerializer;
pub use structured_query::{decode_aggregation_query, decode_structured_query};
