//! Desired-state access for rudder.
//!
//! [`DirectorySource`] implements [`rudder_core::StateSource`] over a local
//! directory of manifests; [`documents::partition`] splits the fetched
//! documents into resources and child Applications.

pub mod directory;
pub mod documents;
pub mod error;

pub use directory::DirectorySource;
pub use documents::{partition, Partition};
pub use error::{DocumentError, SourceError};
