//! Shared trace protocol types.
//!
//! Both the recording path (store/recorder/server) and the analysis path
//! use these definitions, keeping the two ends of the wire in agreement.
//!
//! - [`constants`]: wire-level constants (packet ceiling, reserved ids)
//! - [`schema`]: event type declarations and the per-session registry
//! - [`writer`]: producer-side packet/event encoder

pub mod constants;
pub mod schema;
pub mod writer;

pub use constants::*;
pub use schema::{EventSpec, FieldSpec, FieldType, SchemaRegistry};
pub use writer::{FieldValue, TraceWriter};
