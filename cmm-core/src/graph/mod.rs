//! Filter Graph Engine
//!
//! Nodes wrap a capability request. Data is pulled upstream, status events
//! are pushed downstream:
//!
//! ```text
//!             pull ◄──────────────────────────────
//!  ┌────────┐ socket   plug ┌────────┐ socket   plug ┌────────┐
//!  │ source ├──────────────►│  icc   ├──────────────►│ output │
//!  └────────┘               └────────┘               └────────┘
//!             events ───────────────────────────────►
//! ```
//!
//! A pull orders the upstream subgraph (each shared node once), then per
//! node: resolve the processor, obtain its context from the cache, process
//! into an intermediate buffer. The requested node writes into the ticket's
//! target.
//!
//! Node options steer resolution:
//! - `cmm_required`: provider id or implementation attribute the processor
//!   must answer to
//! - `cmm_context`: pattern for the context builder, defaulting to the
//!   node's request

mod connector;
mod engine;
mod event;
mod node;
mod ticket;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use connector::{Plug, PlugRef, Socket, SocketRef};
pub use engine::{Adjacency, Edge, Graph};
pub use event::{ConnectorEvent, EventObserver, GraphEvent};
pub use node::{FilterNode, NodeState};
pub use ticket::{Buffer, CancelToken, ProcessContext, Region, Ticket};

/// Option naming the provider a node's processor must come from
pub const REQUIRED_OPTION: &str = "cmm_required";

/// Option overriding the pattern used to resolve the context builder
pub const CONTEXT_OPTION: &str = "cmm_context";

/// Generational index of a node in a [`Graph`]
///
/// Ids of removed nodes never alias a later node in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}.{}", self.index, self.generation)
    }
}
