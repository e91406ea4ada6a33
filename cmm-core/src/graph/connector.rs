//! Plugs and sockets

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::module::{ConnectorDescriptor, DataCapability};

use super::NodeId;

/// Address of a plug: node plus plug index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlugRef {
    pub node: NodeId,
    pub index: usize,
}

impl PlugRef {
    pub fn new(node: NodeId, index: usize) -> Self {
        Self { node, index }
    }
}

impl fmt::Display for PlugRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/plug{}", self.node, self.index)
    }
}

/// Address of a socket: node plus socket index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketRef {
    pub node: NodeId,
    pub index: usize,
}

impl SocketRef {
    pub fn new(node: NodeId, index: usize) -> Self {
        Self { node, index }
    }
}

impl fmt::Display for SocketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/socket{}", self.node, self.index)
    }
}

/// Input connector; binds at most one socket
#[derive(Debug, Clone)]
pub struct Plug {
    pub(crate) descriptor: ConnectorDescriptor,
    pub(crate) remote: Option<SocketRef>,
}

impl Plug {
    pub(crate) fn new(descriptor: ConnectorDescriptor) -> Self {
        Self {
            descriptor,
            remote: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Data shape this plug accepts
    pub fn capability(&self) -> &DataCapability {
        &self.descriptor.capability
    }

    pub fn is_mandatory(&self) -> bool {
        self.descriptor.mandatory
    }

    /// Bound socket, if any
    pub fn remote(&self) -> Option<SocketRef> {
        self.remote
    }

    pub fn is_connected(&self) -> bool {
        self.remote.is_some()
    }
}

/// Output connector; may feed several plugs
#[derive(Debug, Clone)]
pub struct Socket {
    pub(crate) descriptor: ConnectorDescriptor,
    pub(crate) remotes: Vec<PlugRef>,
}

impl Socket {
    pub(crate) fn new(descriptor: ConnectorDescriptor) -> Self {
        Self {
            descriptor,
            remotes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Data shape this socket offers
    pub fn capability(&self) -> &DataCapability {
        &self.descriptor.capability
    }

    /// Plugs fed by this socket
    pub fn remotes(&self) -> &[PlugRef] {
        &self.remotes
    }

    pub fn is_connected(&self) -> bool {
        !self.remotes.is_empty()
    }
}
