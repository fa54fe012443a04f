pub mod memory;
pub mod scheduler;
pub mod sqlite;
pub mod worker;

pub use memory::InMemoryBroker;
pub use scheduler::{RunScheduler, ScheduleOutcome};
pub use sqlite::SqliteBroker;
pub use worker::{RequestKind, WorkerDispatchLoop};

use std::sync::Arc;

use loom_core::config::{expand_home, BrokerBackend, BrokerConfig};
use loom_core::error::Result;
use loom_core::traits::MessageBroker;

/// Build the backend selected by `config.backend`.
pub fn open_broker(config: &BrokerConfig) -> Result<Arc<dyn MessageBroker>> {
    match config.backend {
        BrokerBackend::Memory => Ok(Arc::new(InMemoryBroker::new())),
        BrokerBackend::Sqlite => Ok(Arc::new(SqliteBroker::open(&expand_home(&config.path), config)?)),
    }
}
