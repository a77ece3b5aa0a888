pub mod error;
pub mod types;
pub mod value;

pub use error::{ErrorKind, Result, SERIALIZATION_FAILURE_CODE, StoreError};
pub use types::Column;
pub use value::{DataType, Value};
