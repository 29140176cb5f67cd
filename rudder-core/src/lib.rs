//! rudder core library: domain types, adapter contracts, persistence.
//!
//! - [`types`]: applications, resources, operations and status
//! - [`manifest`]: the `kind: Application` document format
//! - [`adapter`]: [`StateSource`] and [`LiveState`] contracts
//! - [`memory`]: in-memory adapters with fault injection
//! - [`store`]: root definitions and status records on disk
//! - [`config`]: controller configuration

pub mod adapter;
pub mod config;
pub mod duration;
pub mod error;
pub mod manifest;
pub mod memory;
pub mod store;
pub mod types;

pub use adapter::{ApplyError, DesiredState, FetchError, LiveState, StateSource};
pub use config::ControllerConfig;
pub use error::{ManifestError, StoreError};
pub use types::{
    AppName, AppRecord, AppStatus, Application, Destination, DiffClass, HealthStatus,
    OperationPhase, Resource, ResourceKey, Source, SyncOperation, SyncPolicy, SyncStatusCode,
    Trigger,
};
