//! Filter nodes

use serde::{Deserialize, Serialize};

use crate::cache::ContextHandle;
use crate::module::{ConnectorDescriptor, NodeOptions, ProviderHandle};

use super::connector::{Plug, Socket};

/// Lifecycle of a node, in the order a pull advances it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Unconnected,
    Connected,
    ProviderResolved,
    ContextReady,
    DataValid,
}

/// A processing node: a capability request, its options and connectors,
/// plus what a pull resolved for it
#[derive(Debug)]
pub struct FilterNode {
    pub(crate) request: String,
    pub(crate) options: NodeOptions,
    pub(crate) plugs: Vec<Plug>,
    pub(crate) sockets: Vec<Socket>,
    pub(crate) processor: Option<ProviderHandle>,
    pub(crate) context: Option<ContextHandle>,
    /// Highest state reached by pulls since the last invalidation
    pub(crate) progress: Option<NodeState>,
}

impl FilterNode {
    pub(crate) fn new(
        request: impl Into<String>,
        options: NodeOptions,
        plugs: Vec<ConnectorDescriptor>,
        sockets: Vec<ConnectorDescriptor>,
    ) -> Self {
        Self {
            request: request.into(),
            options,
            plugs: plugs.into_iter().map(Plug::new).collect(),
            sockets: sockets.into_iter().map(Socket::new).collect(),
            processor: None,
            context: None,
            progress: None,
        }
    }

    /// Capability request the processor is resolved from
    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn plugs(&self) -> &[Plug] {
        &self.plugs
    }

    pub fn sockets(&self) -> &[Socket] {
        &self.sockets
    }

    /// Processor resolved for this node, if any
    pub fn processor(&self) -> Option<&ProviderHandle> {
        self.processor.as_ref()
    }

    pub fn context(&self) -> Option<&ContextHandle> {
        self.context.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.plugs.iter().any(Plug::is_connected) || self.sockets.iter().any(Socket::is_connected)
    }

    pub fn state(&self) -> NodeState {
        match self.progress {
            Some(state) => state,
            None if self.is_connected() => NodeState::Connected,
            None => NodeState::Unconnected,
        }
    }

    /// Number of downstream plugs bound to this node's sockets
    pub fn downstream_references(&self) -> usize {
        self.sockets.iter().map(|s| s.remotes.len()).sum()
    }

    pub(crate) fn advance(&mut self, state: NodeState) {
        if self.progress.map(|p| p < state).unwrap_or(true) {
            self.progress = Some(state);
        }
    }

    /// Drop output validity, keep provider and context
    pub(crate) fn invalidate_data(&mut self) {
        if self.progress == Some(NodeState::DataValid) {
            self.progress = Some(NodeState::ContextReady);
        }
    }

    /// Input shapes changed: the context must be rebuilt
    pub(crate) fn invalidate_context(&mut self) {
        self.context = None;
        if self.progress.map(|p| p > NodeState::ProviderResolved).unwrap_or(false) {
            self.progress = Some(NodeState::ProviderResolved);
        }
    }

    /// Options changed: provider and context must be resolved again
    pub(crate) fn invalidate_providers(&mut self) {
        self.processor = None;
        self.context = None;
        self.progress = None;
    }
}
