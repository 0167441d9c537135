pub mod database;
pub mod error;
pub mod kv;
pub mod queue;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use kv::KvRepo;
pub use queue::EventQueue;
