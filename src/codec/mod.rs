//! Event construction and record encoding.
//!
//! - [`payload`]: validated event payloads and their builder
//! - [`properties`]: ordered property-provider registry
//! - [`record`]: sealing codec between payloads and stored bytes

pub mod payload;
pub mod properties;
pub mod record;

pub use payload::{validate_name, EventBuilder, EventPayload, LibMethod, LibProperties};
pub use properties::{MergePolicy, PropertyRegistry};
pub use record::{EventRecordCodec, PassthroughSealer, RecordSealer};
