pub mod database;
pub mod error;
pub mod messages;
pub mod schema;
pub mod store;

pub use database::Database;
pub use error::StoreError;
pub use messages::{MessageRepo, MessageRow};
pub use store::{MessageStore, SqliteMessageStore};
