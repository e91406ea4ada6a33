//! # CMM Core - module resolution and pipeline execution
//!
//! The core of a color-processing middleware:
//!
//! - **Registration**: hierarchical, attribute-tagged keys and the pattern
//!   grammar used to request capabilities
//! - **Rank**: weighted key/value scoring of matching candidates
//! - **Module Registry**: resolves a capability request to the best provider
//!   of the four-stage module shape (loader, context builder, context
//!   converter, processor)
//! - **Context Cache**: content-addressed, reference-counted cache of
//!   expensive per-configuration processing state
//! - **Graph**: a DAG of filter nodes executed by pulling data upstream,
//!   with status events pushed downstream
//!
//! ## Example
//!
//! ```rust
//! use cmm_core::{CapabilityKind, ModuleRegistry, Provider, ProviderDescriptor, RankEntry};
//! use cmm_core::{PropertySnapshot, ResolveRequest};
//!
//! let registry = ModuleRegistry::new();
//! registry
//!     .register(Provider::declared(
//!         ProviderDescriptor::new("org.cmm.lcms", "org/oyranos/openicc/icc._lcms").unwrap(),
//!         CapabilityKind::ContextBuilder,
//!     ))
//!     .unwrap();
//! registry
//!     .register(Provider::declared(
//!         ProviderDescriptor::new("org.cmm.lcm2", "org/oyranos/openicc/icc._lcm2.gpu")
//!             .unwrap()
//!             .with_rank_entry(RankEntry::new("manufacturer", 10, -2, 0).expecting("EPSON")),
//!         CapabilityKind::ContextBuilder,
//!     ))
//!     .unwrap();
//!
//! let request = ResolveRequest::new(CapabilityKind::ContextBuilder, "//openicc/icc")
//!     .unwrap()
//!     .with_properties(PropertySnapshot::new().with("manufacturer", "EPSON"));
//! let provider = registry.resolve_request(&request).unwrap();
//! assert_eq!(provider.id(), "org.cmm.lcm2");
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod graph;
pub mod module;
pub mod rank;
pub mod registration;

// Re-export main types
pub use cache::{CacheConfig, CacheStats, ContentHash, ContextCache, ContextHandle};
pub use config::EngineConfig;
pub use error::{CMMError, ErrorCategory, ErrorDetail, ErrorResponse, Result};
pub use graph::{
    Buffer, CancelToken, ConnectorEvent, EventObserver, FilterNode, Graph, GraphEvent, NodeId, NodeState,
    PlugRef, ProcessContext, Region, SocketRef, Ticket,
};
pub use module::{
    BuildRequest, CapabilityKind, ConnectorDescriptor, ContextBuilder, ContextConverter, DataCapability,
    LoadReport, ModuleRegistry, NodeOptions, Processor, Provider, ProviderDescriptor, ProviderHandle,
    ProviderManifest, ProviderSource, RankedCandidate, ResolveRequest,
};
pub use rank::{PropertySnapshot, RankEntry, RankEvaluator, RankTable};
pub use registration::{RegistrationKey, RegistrationPattern};

/// API version of this core; providers declaring it earn a rank bonus
pub const CORE_API_VERSION: &str = "1.0";
