pub mod registry;
pub mod types;

pub use registry::{LookupReference, Registry};
pub use types::{
    Aggregator, AggregatorOp, DocumentMeta, FieldDef, FieldType, InheritMode, InheritedField,
    LookupDef, Relation,
};
