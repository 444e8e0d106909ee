pub mod config;
pub mod error;
pub mod keeper;
pub mod middleware;
pub mod result;
pub mod routes;
pub mod store;

pub use error::{AppError, KeeperError};
pub use keeper::{Admission, Key, Keeper, Stats};
pub use store::{MemoryStore, SqlStore};
