//! Infrastructure layer: processors, persistence, process-wide registry.

pub mod admin;
pub mod component;
pub mod config;
pub mod gateway;
pub mod persist;
pub mod processor;
pub mod registry;

pub use admin::{AdminCommand, AdminError};
pub use component::Component;
pub use config::{AppConfig, ProcessorConfig};
pub use gateway::{PersistenceGateway, SyncReport};
pub use persist::in_memory::InMemoryEventTable;
pub use persist::sqlite::SqliteEventTable;
pub use persist::{EventRow, EventTable, PersistError};
pub use processor::{
    EventProcessor, PersistSummary, ProcessorControl, ProcessorReport, ProcessorStats,
    WorkerDump, WorkerState,
};
pub use registry::ProcessRegistry;

#[cfg(test)]
mod integration_tests;
