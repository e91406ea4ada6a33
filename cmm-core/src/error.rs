//! Error types for CMM operations
//!
//! Every public operation returns a [`Result`]. Errors carry:
//! - A descriptive message naming the offending pattern, provider or node
//! - A stable error code for programmatic handling
//! - A category that maps onto the failure taxonomy of the core
//! - A non-zero integer status for C-style callers
//!
//! # Failure taxonomy
//!
//! ```text
//! FormatError     malformed registration pattern or key text
//! NotFound        no provider matched, unknown node or connector
//! TypeMismatch    incompatible connectors or wrong context resource kind
//! OutOfMemory     buffer allocation failed
//! BuilderFailure  a provider's context builder or processor failed
//! Cancelled       the ticket's cancellation flag was raised
//! ```
//!
//! Graph programming errors (cycles, double connects, removing a node that is
//! still referenced) are rejected explicitly with [`ErrorCategory::Conflict`].
//!
//! # Example
//!
//! ```rust
//! use cmm_core::error::{CMMError, ErrorCategory};
//!
//! fn handle_error(err: CMMError) {
//!     match err.category() {
//!         ErrorCategory::NotFound => println!("no provider for request"),
//!         ErrorCategory::Format => println!("bad pattern"),
//!         _ => println!("other error"),
//!     }
//!
//!     if err.is_recoverable() {
//!         println!("retry may succeed");
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for CMM operations
pub type Result<T> = std::result::Result<T, CMMError>;

/// Error category for grouping related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed registration text
    Format,
    /// Nothing matched, or an id does not resolve
    NotFound,
    /// Incompatible connectors or context resource kinds
    TypeMismatch,
    /// Allocation failure
    Resource,
    /// Provider-side failure (builder, converter, processor)
    Provider,
    /// Cooperative cancellation
    Cancelled,
    /// Graph programming error
    Conflict,
    /// Invalid configuration or manifest
    Config,
    /// Lock poisoning and internal invariants
    Integrity,
}

/// Errors that can occur in CMM operations
#[derive(Error, Debug)]
pub enum CMMError {
    // ═══════════════════════════════════════════════════════════════════════
    // Registration errors (pattern and key grammar)
    // ═══════════════════════════════════════════════════════════════════════

    /// Registration pattern or key text is malformed
    #[error("Malformed registration '{text}': {reason}")]
    FormatError { text: String, reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Resolution errors (module registry)
    // ═══════════════════════════════════════════════════════════════════════

    /// No registered provider satisfies the capability request
    #[error("No {kind} provider matches '{pattern}'. Register a provider or relax the pattern.")]
    NotFound { kind: String, pattern: String },

    /// The resolved provider has no executable stage for the requested kind
    #[error("Provider '{provider_id}' is declared only and cannot act as {kind}")]
    NotExecutable { provider_id: String, kind: String },

    /// A provider with this id is already registered
    #[error("Provider already registered: '{provider_id}'")]
    ProviderAlreadyRegistered { provider_id: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Context errors (cache and handles)
    // ═══════════════════════════════════════════════════════════════════════

    /// A context handle does not hold the resource kind the consumer expects
    #[error("Context type mismatch: expected '{expected}', got '{actual}'")]
    TypeMismatch { expected: String, actual: String },

    /// A context builder or converter failed
    #[error("Context builder '{provider_id}' failed: {reason}")]
    BuilderFailure { provider_id: String, reason: String },

    /// A processor failed while filling a ticket
    #[error("Processor '{provider_id}' failed: {reason}")]
    ProcessorFailure { provider_id: String, reason: String },

    /// Buffer allocation failed
    #[error("Out of memory allocating {requested} samples")]
    OutOfMemory { requested: usize },

    // ═══════════════════════════════════════════════════════════════════════
    // Graph errors (nodes, connectors, pulls)
    // ═══════════════════════════════════════════════════════════════════════

    /// Node id is unknown or refers to a removed node
    #[error("Node not found: {node}")]
    NodeNotFound { node: String },

    /// Plug or socket index does not exist on the node
    #[error("Connector {connector} not found on node {node}")]
    ConnectorNotFound { node: String, connector: String },

    /// Plug and socket declare incompatible data shapes
    #[error("Cannot connect plug '{plug}' to socket '{socket}': {reason}")]
    IncompatibleConnectors {
        plug: String,
        socket: String,
        reason: String,
    },

    /// The plug is already bound to a socket
    #[error("Plug '{plug}' is already connected. Disconnect it first.")]
    AlreadyConnected { plug: String },

    /// The plug is not bound to any socket
    #[error("Plug '{plug}' is not connected")]
    NotConnected { plug: String },

    /// A mandatory plug is unbound at pull time
    #[error("Incomplete graph: mandatory plug '{plug}' on node {node} is not connected")]
    IncompleteGraph { node: String, plug: String },

    /// Node is still referenced by a downstream plug
    #[error("Node {node} is still referenced by {references} downstream plug(s)")]
    NodeInUse { node: String, references: usize },

    /// The upstream traversal reached a node that is still being visited
    #[error("Cycle detected at node {node}. Filter graphs must be acyclic.")]
    CycleDetected { node: String },

    /// The upstream chain is deeper than the configured bound
    #[error("Pull depth {depth} exceeds the configured maximum of {max_depth}")]
    DepthExceeded { depth: usize, max_depth: usize },

    /// The ticket was cancelled
    #[error("Pull cancelled for ticket {ticket_id}")]
    Cancelled { ticket_id: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Configuration and manifest errors
    // ═══════════════════════════════════════════════════════════════════════

    /// Provider manifest is malformed
    #[error("Invalid provider manifest: {reason}")]
    InvalidManifest { reason: String },

    /// Failed to read a manifest file
    #[error("Failed to load manifest from '{path}': {reason}")]
    ManifestLoadError { path: String, reason: String },

    /// Engine configuration is malformed
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Failed to read a configuration file
    #[error("Failed to load configuration from '{path}': {reason}")]
    ConfigLoadError { path: String, reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Infrastructure errors
    // ═══════════════════════════════════════════════════════════════════════

    /// JSON serialization or deserialization failed
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A shared structure's lock is poisoned (panic while holding it)
    #[error("Shared state lock poisoned. This is a bug; please report it.")]
    StorageLocked,

    /// Internal error that shouldn't happen
    #[error("Internal error: {reason}. This is a bug; please report it.")]
    InternalError { reason: String },
}

impl CMMError {
    /// Shorthand for a [`CMMError::FormatError`]
    pub fn format(text: impl Into<String>, reason: impl Into<String>) -> Self {
        CMMError::FormatError {
            text: text.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`CMMError::BuilderFailure`]
    pub fn builder(provider_id: impl Into<String>, reason: impl Into<String>) -> Self {
        CMMError::BuilderFailure {
            provider_id: provider_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error might succeed on retry
    ///
    /// Builder and processor failures are not cached, so a later pull
    /// re-runs them. Cancellation and allocation failures depend on the
    /// caller's circumstances.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CMMError::BuilderFailure { .. }
                | CMMError::ProcessorFailure { .. }
                | CMMError::Cancelled { .. }
                | CMMError::OutOfMemory { .. }
                | CMMError::StorageLocked
        )
    }

    /// Returns the error category for grouping
    pub fn category(&self) -> ErrorCategory {
        match self {
            CMMError::FormatError { .. } => ErrorCategory::Format,

            CMMError::NotFound { .. }
            | CMMError::NotExecutable { .. }
            | CMMError::NodeNotFound { .. }
            | CMMError::ConnectorNotFound { .. } => ErrorCategory::NotFound,

            CMMError::TypeMismatch { .. }
            | CMMError::IncompatibleConnectors { .. } => ErrorCategory::TypeMismatch,

            CMMError::OutOfMemory { .. } => ErrorCategory::Resource,

            CMMError::BuilderFailure { .. }
            | CMMError::ProcessorFailure { .. } => ErrorCategory::Provider,

            CMMError::Cancelled { .. } => ErrorCategory::Cancelled,

            CMMError::ProviderAlreadyRegistered { .. }
            | CMMError::AlreadyConnected { .. }
            | CMMError::NotConnected { .. }
            | CMMError::IncompleteGraph { .. }
            | CMMError::NodeInUse { .. }
            | CMMError::CycleDetected { .. }
            | CMMError::DepthExceeded { .. } => ErrorCategory::Conflict,

            CMMError::InvalidManifest { .. }
            | CMMError::ManifestLoadError { .. }
            | CMMError::InvalidConfig { .. }
            | CMMError::ConfigLoadError { .. }
            | CMMError::JsonError(_) => ErrorCategory::Config,

            CMMError::StorageLocked | CMMError::InternalError { .. } => ErrorCategory::Integrity,
        }
    }

    /// Returns the stable error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            CMMError::FormatError { .. } => "FORMAT_ERROR",
            CMMError::NotFound { .. } => "NOT_FOUND",
            CMMError::NotExecutable { .. } => "NOT_EXECUTABLE",
            CMMError::ProviderAlreadyRegistered { .. } => "PROVIDER_ALREADY_REGISTERED",
            CMMError::TypeMismatch { .. } => "TYPE_MISMATCH",
            CMMError::BuilderFailure { .. } => "BUILDER_FAILURE",
            CMMError::ProcessorFailure { .. } => "PROCESSOR_FAILURE",
            CMMError::OutOfMemory { .. } => "OUT_OF_MEMORY",
            CMMError::NodeNotFound { .. } => "NODE_NOT_FOUND",
            CMMError::ConnectorNotFound { .. } => "CONNECTOR_NOT_FOUND",
            CMMError::IncompatibleConnectors { .. } => "INCOMPATIBLE_CONNECTORS",
            CMMError::AlreadyConnected { .. } => "ALREADY_CONNECTED",
            CMMError::NotConnected { .. } => "NOT_CONNECTED",
            CMMError::IncompleteGraph { .. } => "INCOMPLETE_GRAPH",
            CMMError::NodeInUse { .. } => "NODE_IN_USE",
            CMMError::CycleDetected { .. } => "CYCLE_DETECTED",
            CMMError::DepthExceeded { .. } => "DEPTH_EXCEEDED",
            CMMError::Cancelled { .. } => "CANCELLED",
            CMMError::InvalidManifest { .. } => "INVALID_MANIFEST",
            CMMError::ManifestLoadError { .. } => "MANIFEST_LOAD_ERROR",
            CMMError::InvalidConfig { .. } => "INVALID_CONFIG",
            CMMError::ConfigLoadError { .. } => "CONFIG_LOAD_ERROR",
            CMMError::JsonError(_) => "JSON_ERROR",
            CMMError::StorageLocked => "STORAGE_LOCKED",
            CMMError::InternalError { .. } => "INTERNAL_ERROR",
        }
    }

    /// Returns the integer status for this error
    ///
    /// Zero is reserved for success; every error maps to a positive value
    /// grouped by category.
    pub fn status_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Format => 1,
            ErrorCategory::NotFound => 2,
            ErrorCategory::TypeMismatch => 3,
            ErrorCategory::Resource => 4,
            ErrorCategory::Provider => 5,
            ErrorCategory::Cancelled => 6,
            ErrorCategory::Conflict => 7,
            ErrorCategory::Config => 8,
            ErrorCategory::Integrity => 9,
        }
    }

    /// Converts this error to a JSON-serializable response object
    ///
    /// ```json
    /// {
    ///   "error": {
    ///     "code": "NOT_FOUND",
    ///     "message": "No processor provider matches '//color/icc'...",
    ///     "category": "not_found",
    ///     "recoverable": false
    ///   }
    /// }
    /// ```
    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
                category: self.category(),
                recoverable: self.is_recoverable(),
            },
        }
    }
}

/// JSON-serializable error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Error detail for JSON responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error code (e.g., "NOT_FOUND")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Error category
    pub category: ErrorCategory,
    /// Whether retry might succeed
    pub recoverable: bool,
}
