mod accessor;
mod meta_document;
mod transaction;
mod write;

pub use accessor::{
    ChangeWatcher, CommitMode, CommitRecord, CommitResponse, DocumentStore, ResetListener,
    WriteResult,
};
pub use meta_document::MetaDocument;
pub use transaction::{
    Transaction, TransactionManager, TransactionMode, TransactionOptions, TransactionStatus,
};
pub use write::{
    encode_set_data, encode_update_data, EncodedSetData, EncodedUpdateData, FieldTransform,
    Precondition, SetOptions, TransformOperation, WriteOperation,
};
pub(crate) use write::set_value_at_field_path;
