pub mod patterns;
pub mod pool;

// Re-export so callers can do `use crate::adapters::sqlite::DbPool`
pub use pool::DbPool;
pub use patterns::SqlitePatternStore;
