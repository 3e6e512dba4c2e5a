//! Participant state: snapshot, declarative field mappings, synchronizer.

pub mod mapping;
pub mod schema;
pub mod snapshot;
pub mod sync;

pub use mapping::{FieldKind, FieldMapping, FieldMappingBuilder, Filter};
pub use schema::{FieldSpec, StateSchema};
pub use snapshot::{Namespace, PHASE_FIELD, StateSnapshot};
pub use sync::{CustomHandler, StateSynchronizer};
