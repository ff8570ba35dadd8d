#![deny(missing_docs)]
#![doc = "Core error and value types for the distexp orchestration engine."]

pub mod errors;
pub mod value;

pub use errors::{DxError, ErrorInfo};
pub use value::ParamValue;
