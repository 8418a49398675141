pub mod error;
pub mod json_bridge;
pub mod schema;
pub mod store;
pub mod time;

pub use error::{Result, StoreError};
pub use store::{EntityRecord, FieldStateRow, Store};
