pub mod definitions;
pub mod runs;

pub use definitions::{FileDefinitionStore, MemoryDefinitionStore};
pub use runs::{RunSummary, SqliteRunStore};
