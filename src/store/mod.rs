mod memory;
mod sql;

pub use memory::MemoryStore;
pub use sql::{DEFAULT_TABLE, SqlStore, connect};
