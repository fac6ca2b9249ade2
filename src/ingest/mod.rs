//! Producer-side ingestion: connection state machine, producer queues and
//! batched writes into the tick store.

pub mod connection;
pub mod pending;
pub mod pipeline;

pub use connection::{
    monotonize, ConnectionEvent, ConnectionState, DeInitSummary, SymbolStatus,
};
pub use pending::PendingWrites;
pub use pipeline::IngestionPipeline;
