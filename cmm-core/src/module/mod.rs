//! Module Registry
//!
//! Holds the providers of the four-stage module shape and answers
//! capability requests:
//!
//! ```text
//! ResolveRequest{kind, pattern, required, properties}
//!        │
//!        ▼
//! filter by kind ─► match pattern at kind's stage ─► rank table vs properties
//!        │                                               │
//!        └────────── collapse doubles, sort by rank ◄────┘
//!                               │
//!                               ▼
//!                     ProviderHandle (best)
//! ```

mod manifest;
mod provider;
mod registry;

pub use manifest::{ManifestEntry, ProviderManifest};
pub use provider::{
    BuildRequest, CapabilityKind, ConnectorDescriptor, ContextBuilder, ContextConverter,
    DataCapability, NodeOptions, Processor, Provider, ProviderDescriptor, ProviderHandle, Stage,
};
pub use registry::{LoadReport, ModuleRegistry, RankedCandidate, ResolveRequest};

use crate::error::Result;

/// Enumerates providers on behalf of the loader
///
/// Discovery itself (scanning directories, opening shared objects) happens
/// behind this trait. Each entry is a separate `Result`, so one broken
/// provider does not hide the others.
pub trait ProviderSource: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    fn providers(&self) -> Vec<Result<Provider>>;
}
