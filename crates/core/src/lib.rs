//! Shared data model, configuration, store contract and pure helpers for
//! paced bulk messaging campaigns.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod ingest;
pub mod pacing;
pub mod store;
pub mod templates;
pub mod types;

pub use config::AppConfig;
pub use error::{DispatchError, DispatchResult, IngestError, StoreError, StoreResult};
pub use store::{InMemoryStore, RecipientStore};
