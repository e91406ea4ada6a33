//! The filter graph: node arena, connections, pulls and event delivery

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{ContextCache, ContextHandle};
use crate::config::EngineConfig;
use crate::error::{CMMError, Result};
use crate::module::{
    BuildRequest, CapabilityKind, ConnectorDescriptor, DataCapability, ModuleRegistry, NodeOptions,
    ProviderHandle, ResolveRequest, Stage,
};
use crate::rank::PropertySnapshot;

use super::connector::{Plug, PlugRef, Socket, SocketRef};
use super::event::{ConnectorEvent, EventLog, EventObserver, GraphEvent};
use super::node::{FilterNode, NodeState};
use super::ticket::{Buffer, CancelToken, ProcessContext, Region, Ticket};
use super::{NodeId, CONTEXT_OPTION, REQUIRED_OPTION};

/// A socket → plug connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub socket: SocketRef,
    pub plug: PlugRef,
}

/// Connected component around a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjacency {
    /// Reachable nodes, breadth first from the start node
    pub nodes: Vec<NodeId>,
    pub edges: Vec<Edge>,
}

struct NodeSlot {
    generation: u32,
    node: Option<FilterNode>,
}

enum Visit {
    Enter(NodeId, usize),
    Exit(NodeId),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Grey,
    Black,
}

/// A filter graph bound to a registry and a context cache
pub struct Graph {
    registry: Arc<ModuleRegistry>,
    cache: Arc<ContextCache>,
    config: EngineConfig,
    slots: Vec<NodeSlot>,
    free: Vec<u32>,
    observers: Vec<Arc<dyn EventObserver>>,
    log: EventLog,
}

impl Graph {
    pub fn new(registry: Arc<ModuleRegistry>, cache: Arc<ContextCache>, config: EngineConfig) -> Self {
        let log = EventLog::new(config.event_log_capacity);
        Self {
            registry,
            cache,
            config,
            slots: Vec::new(),
            free: Vec::new(),
            observers: Vec::new(),
            log,
        }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ContextCache> {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Nodes
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a node for `request`.
    ///
    /// The best processor is resolved now; its connector descriptors become
    /// the node's plugs and sockets.
    pub fn node_new(&mut self, request: &str, options: NodeOptions) -> Result<NodeId> {
        let processor = self.resolve_processor(request, &options)?;
        let mut node = FilterNode::new(
            request,
            options,
            processor.descriptor.plugs.clone(),
            processor.descriptor.sockets.clone(),
        );
        node.processor = Some(processor);
        let id = self.insert(node);
        tracing::debug!("Created {} for '{}'", id, request);
        Ok(id)
    }

    /// Create a node with explicit connectors; the processor is resolved on
    /// the first pull
    pub fn node_with_connectors(
        &mut self,
        request: &str,
        options: NodeOptions,
        plugs: Vec<ConnectorDescriptor>,
        sockets: Vec<ConnectorDescriptor>,
    ) -> NodeId {
        self.insert(FilterNode::new(request, options, plugs, sockets))
    }

    /// Remove a node that no downstream plug references
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        let references = node.downstream_references();
        if references > 0 {
            return Err(CMMError::NodeInUse {
                node: id.to_string(),
                references,
            });
        }

        let bound: Vec<(PlugRef, SocketRef)> = node
            .plugs
            .iter()
            .enumerate()
            .filter_map(|(index, plug)| plug.remote.map(|socket| (PlugRef::new(id, index), socket)))
            .collect();
        for (plug, socket) in bound {
            if let Ok(socket) = self.socket_mut(socket) {
                socket.remotes.retain(|p| *p != plug);
            }
        }

        if let Some(slot) = self.slots.get_mut(id.index() as usize) {
            slot.node = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id.index());
        }
        tracing::debug!("Removed {}", id);
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Result<&FilterNode> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_ref())
            .ok_or_else(|| CMMError::NodeNotFound { node: id.to_string() })
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut FilterNode> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_mut())
            .ok_or_else(|| CMMError::NodeNotFound { node: id.to_string() })
    }

    /// Ids of all live nodes
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.node.is_some())
            .map(|(index, slot)| NodeId::new(index as u32, slot.generation))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.node.is_some()).count()
    }

    pub fn state(&self, id: NodeId) -> Result<NodeState> {
        Ok(self.node(id)?.state())
    }

    /// Change a node option.
    ///
    /// The node resolves its providers and context again on the next pull,
    /// and `ContextInvalidated` is sent downstream. A `cmm_required` value
    /// no processor answers to is rejected with `IncompatibleOption`.
    pub fn set_option(&mut self, id: NodeId, key: &str, value: &str) -> Result<Option<String>> {
        let node = self.node(id)?;
        let request = node.request.clone();
        let mut options = node.options.clone();
        let previous = options.set(key, value);

        if key == REQUIRED_OPTION {
            if let Err(e) = self.resolve_processor(&request, &options) {
                self.propagate(id, None, ConnectorEvent::IncompatibleOption, None, true);
                return Err(e);
            }
        }

        let node = self.node_mut(id)?;
        node.options = options;
        node.invalidate_providers();
        self.propagate(id, None, ConnectorEvent::ContextInvalidated, None, false);
        Ok(previous)
    }

    fn insert(&mut self, node: FilterNode) -> NodeId {
        if let Some(index) = self.free.pop() {
            if let Some(slot) = self.slots.get_mut(index as usize) {
                slot.node = Some(node);
                return NodeId::new(index, slot.generation);
            }
        }
        let index = self.slots.len() as u32;
        self.slots.push(NodeSlot {
            generation: 0,
            node: Some(node),
        });
        NodeId::new(index, 0)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Connectors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn plug(&self, plug: PlugRef) -> Result<&Plug> {
        self.node(plug.node)?
            .plugs
            .get(plug.index)
            .ok_or_else(|| CMMError::ConnectorNotFound {
                node: plug.node.to_string(),
                connector: format!("plug {}", plug.index),
            })
    }

    pub fn socket(&self, socket: SocketRef) -> Result<&Socket> {
        self.node(socket.node)?
            .sockets
            .get(socket.index)
            .ok_or_else(|| CMMError::ConnectorNotFound {
                node: socket.node.to_string(),
                connector: format!("socket {}", socket.index),
            })
    }

    fn plug_mut(&mut self, plug: PlugRef) -> Result<&mut Plug> {
        self.node_mut(plug.node)?
            .plugs
            .get_mut(plug.index)
            .ok_or_else(|| CMMError::ConnectorNotFound {
                node: plug.node.to_string(),
                connector: format!("plug {}", plug.index),
            })
    }

    fn socket_mut(&mut self, socket: SocketRef) -> Result<&mut Socket> {
        self.node_mut(socket.node)?
            .sockets
            .get_mut(socket.index)
            .ok_or_else(|| CMMError::ConnectorNotFound {
                node: socket.node.to_string(),
                connector: format!("socket {}", socket.index),
            })
    }

    /// Bind `plug` to `socket`
    pub fn connect(&mut self, plug: PlugRef, socket: SocketRef) -> Result<()> {
        let accepted = {
            let p = self.plug(plug)?;
            if p.is_connected() {
                return Err(CMMError::AlreadyConnected {
                    plug: format!("{}:{}", plug.node, p.name()),
                });
            }
            p.capability().clone()
        };
        let offered = self.socket(socket)?.capability().clone();

        if let Err(reason) = accepted.accepts(&offered) {
            let plug_name = format!("{}:{}", plug.node, self.plug(plug)?.name());
            let socket_name = format!("{}:{}", socket.node, self.socket(socket)?.name());
            self.deliver(
                GraphEvent::new(ConnectorEvent::IncompatibleData, socket.node, plug.node)
                    .with_socket(Some(socket.index)),
            );
            return Err(CMMError::IncompatibleConnectors {
                plug: plug_name,
                socket: socket_name,
                reason,
            });
        }

        self.plug_mut(plug)?.remote = Some(socket);
        self.socket_mut(socket)?.remotes.push(plug);
        self.node_mut(plug.node)?.invalidate_context();

        tracing::debug!("Connected {} -> {}", socket, plug);
        self.deliver(
            GraphEvent::new(ConnectorEvent::Connected, socket.node, plug.node).with_socket(Some(socket.index)),
        );
        Ok(())
    }

    /// Unbind `plug`, returning the socket it was bound to
    pub fn disconnect(&mut self, plug: PlugRef) -> Result<SocketRef> {
        let p = self.plug(plug)?;
        let socket = p.remote.ok_or_else(|| CMMError::NotConnected {
            plug: format!("{}:{}", plug.node, p.name()),
        })?;

        self.plug_mut(plug)?.remote = None;
        if let Ok(s) = self.socket_mut(socket) {
            s.remotes.retain(|p| *p != plug);
        }
        self.node_mut(plug.node)?.invalidate_context();

        tracing::debug!("Disconnected {} -> {}", socket, plug);
        self.deliver(
            GraphEvent::new(ConnectorEvent::Released, socket.node, plug.node).with_socket(Some(socket.index)),
        );
        Ok(socket)
    }

    /// Nodes and edges reachable from `start`, following edges both ways
    pub fn adjacency(&self, start: NodeId) -> Result<Adjacency> {
        self.node(start)?;
        let mut adjacency = Adjacency::default();
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);

        while let Some(id) = queue.pop_front() {
            adjacency.nodes.push(id);
            let node = self.node(id)?;

            for (index, plug) in node.plugs.iter().enumerate() {
                if let Some(socket) = plug.remote {
                    adjacency.edges.push(Edge {
                        socket,
                        plug: PlugRef::new(id, index),
                    });
                    if seen.insert(socket.node) {
                        queue.push_back(socket.node);
                    }
                }
            }
            for socket in &node.sockets {
                for plug in &socket.remotes {
                    if seen.insert(plug.node) {
                        queue.push_back(plug.node);
                    }
                }
            }
        }
        Ok(adjacency)
    }

    /// Graphviz dot text of the component around `start`: one record per
    /// node with its request, processor, context and options, one edge per
    /// socket → plug connection
    pub fn to_dot(&self, start: NodeId, head_line: &str) -> Result<String> {
        let adjacency = self.adjacency(start)?;
        let mut text = String::from("digraph G {\n");
        text.push_str("  rankdir=LR\n");
        text.push_str("  graph [fontname=Helvetica, fontsize=12];\n");
        text.push_str("  node [shape=record, fontname=Helvetica, fontsize=10, style=\"filled,rounded\"];\n");
        text.push_str("  edge [fontname=Helvetica, fontsize=10];\n\n");

        for &id in &adjacency.nodes {
            let node = self.node(id)?;
            let processor = node.processor.as_ref().map(|p| p.id()).unwrap_or("unresolved");
            let context = node
                .context
                .as_ref()
                .map(|c| format!("{} {}", c.resource_kind(), c.size()))
                .unwrap_or_default();
            let options = node
                .options
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", ");
            text.push_str(&format!(
                "  \"{}\" [label=\"{{<plug> {}| Filter Node {}\\n Request: \\\"{}\\\"\\n CMM: \\\"{}\\\"\\n \
                 State: {:?}\\n Context: \\\"{}\\\"\\n Options: \\\"{}\\\"|<socket>}}\"];\n",
                id,
                node.plugs.len(),
                id,
                dot_escape(&node.request),
                dot_escape(processor),
                node.state(),
                dot_escape(&context),
                dot_escape(&options),
            ));
        }

        text.push_str("\n  subgraph cluster_0 {\n");
        text.push_str(&format!("    label=\"{}\"\n", dot_escape(head_line)));
        text.push_str("    color=gray;\n\n");
        for edge in &adjacency.edges {
            text.push_str(&format!(
                "    \"{}\":socket -> \"{}\":plug [arrowhead=crow, arrowtail=box];\n",
                edge.socket.node, edge.plug.node
            ));
        }
        text.push_str("  }\n}\n");
        Ok(text)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Events
    // ═══════════════════════════════════════════════════════════════════════

    /// Register an observer for every delivered event
    pub fn subscribe(&mut self, observer: impl EventObserver + 'static) {
        self.observers.push(Arc::new(observer));
    }

    /// Recently delivered events, oldest first
    pub fn events(&self) -> Vec<GraphEvent> {
        self.log.iter().cloned().collect()
    }

    pub fn clear_events(&mut self) {
        self.log.clear();
    }

    /// Send `event` out of `socket` to every node downstream of it.
    ///
    /// Each node receives the event once; returns how many did.
    pub fn notify(&mut self, socket: SocketRef, event: ConnectorEvent) -> Result<usize> {
        self.socket(socket)?;
        Ok(self.propagate(socket.node, Some(socket.index), event, None, false))
    }

    fn propagate(
        &mut self,
        origin: NodeId,
        socket: Option<usize>,
        event: ConnectorEvent,
        ticket_id: Option<Uuid>,
        include_origin: bool,
    ) -> usize {
        let mut recipients = Vec::new();
        if include_origin {
            recipients.push(origin);
        }

        let mut visited = HashSet::from([origin]);
        let mut queue = VecDeque::new();
        if let Ok(node) = self.node(origin) {
            for (index, s) in node.sockets.iter().enumerate() {
                if socket.map(|wanted| wanted == index).unwrap_or(true) {
                    queue.extend(s.remotes.iter().map(|p| p.node));
                }
            }
        }
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            recipients.push(id);
            if let Ok(node) = self.node(id) {
                for s in &node.sockets {
                    queue.extend(s.remotes.iter().map(|p| p.node));
                }
            }
        }

        let delivered = recipients.len();
        for target in recipients {
            self.deliver(
                GraphEvent::new(event, origin, target)
                    .with_socket(socket)
                    .with_ticket(ticket_id),
            );
        }
        delivered
    }

    fn deliver(&mut self, event: GraphEvent) {
        if event.event.invalidates_data() {
            if let Ok(node) = self.node_mut(event.target) {
                node.invalidate_data();
            }
        }
        tracing::debug!("Event {} from {} to {}", event.event, event.origin, event.target);
        for observer in &self.observers {
            observer.on_event(&event);
        }
        self.log.push(event);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pulls
    // ═══════════════════════════════════════════════════════════════════════

    /// Pull data through `plug`: the node owning the bound socket fills the
    /// ticket's target
    pub fn pull(&mut self, plug: PlugRef, ticket: &mut Ticket) -> Result<()> {
        let p = self.plug(plug)?;
        let socket = p.remote.ok_or_else(|| CMMError::NotConnected {
            plug: format!("{}:{}", plug.node, p.name()),
        })?;
        self.pull_node(socket.node, ticket)
    }

    /// Let `target` fill the ticket's target, processing its upstream
    /// subgraph first.
    ///
    /// On failure node states stay at their last valid state; what the
    /// target buffer holds is up to the processors that ran.
    pub fn pull_node(&mut self, target: NodeId, ticket: &mut Ticket) -> Result<()> {
        let result = self.run_pull(target, ticket);
        if let Err(e) = &result {
            tracing::warn!("Pull of {} failed for ticket {}: {}", target, ticket.id(), e);
        }
        result
    }

    fn run_pull(&mut self, target: NodeId, ticket: &mut Ticket) -> Result<()> {
        let ticket_id = ticket.id();
        let cancel = ticket.cancel_token();
        let region = ticket.region();
        let order = self.upstream_order(target, ticket_id)?;

        let mut outputs: HashMap<NodeId, Buffer> = HashMap::new();
        for &id in &order {
            if cancel.is_cancelled() {
                return Err(ticket.cancelled_error());
            }
            self.ensure_processor(id)?;
            self.ensure_context(id, ticket_id)?;

            if id == target {
                self.process(id, &outputs, region, ticket.target_mut(), &cancel, ticket_id)?;
            } else {
                let mut buffer = self.intermediate_buffer(id, region, ticket.target())?;
                self.process(id, &outputs, region, &mut buffer, &cancel, ticket_id)?;
                outputs.insert(id, buffer);
            }
        }
        if cancel.is_cancelled() {
            return Err(ticket.cancelled_error());
        }

        for &id in &order {
            if let Ok(node) = self.node_mut(id) {
                node.advance(NodeState::DataValid);
            }
        }
        tracing::debug!("Pulled {} node(s) for ticket {}", order.len(), ticket_id);
        Ok(())
    }

    /// Upstream subgraph of `target` in processing order, target last
    fn upstream_order(&mut self, target: NodeId, ticket_id: Uuid) -> Result<Vec<NodeId>> {
        let max_depth = self.config.max_pull_depth;
        let mut marks: HashMap<NodeId, Mark> = HashMap::new();
        let mut stack = vec![Visit::Enter(target, 1)];
        let mut order = Vec::new();

        while let Some(visit) = stack.pop() {
            let (id, depth) = match visit {
                Visit::Exit(id) => {
                    marks.insert(id, Mark::Black);
                    order.push(id);
                    continue;
                }
                Visit::Enter(id, depth) => (id, depth),
            };
            match marks.get(&id) {
                Some(Mark::Black) => continue,
                Some(Mark::Grey) => return Err(CMMError::CycleDetected { node: id.to_string() }),
                None => {}
            }
            if depth > max_depth {
                return Err(CMMError::DepthExceeded { depth, max_depth });
            }

            let node = self.node(id)?;
            let mut upstream = Vec::with_capacity(node.plugs.len());
            let mut missing = None;
            for plug in &node.plugs {
                match plug.remote {
                    Some(socket) => upstream.push(socket.node),
                    None if plug.is_mandatory() => {
                        missing = Some(plug.name().to_string());
                        break;
                    }
                    None => {}
                }
            }
            if let Some(plug) = missing {
                self.propagate(id, None, ConnectorEvent::IncompleteGraph, Some(ticket_id), true);
                return Err(CMMError::IncompleteGraph {
                    node: id.to_string(),
                    plug,
                });
            }

            marks.insert(id, Mark::Grey);
            stack.push(Visit::Exit(id));
            stack.extend(upstream.into_iter().rev().map(|up| Visit::Enter(up, depth + 1)));
        }
        Ok(order)
    }

    fn ensure_processor(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        if node.processor.is_none() {
            let request = node.request.clone();
            let options = node.options.clone();
            let processor = self.resolve_processor(&request, &options)?;
            self.node_mut(id)?.processor = Some(processor);
        }
        self.node_mut(id)?.advance(NodeState::ProviderResolved);
        Ok(())
    }

    fn ensure_context(&mut self, id: NodeId, ticket_id: Uuid) -> Result<()> {
        let node = self.node(id)?;
        if node.state() >= NodeState::ContextReady {
            return Ok(());
        }
        let processor = node.processor.clone().ok_or_else(|| CMMError::InternalError {
            reason: format!("{} has no processor after resolution", id),
        })?;
        let expected = match &processor.stage {
            Stage::Processor(p) => p.context_kind().map(str::to_string),
            _ => {
                return Err(CMMError::NotExecutable {
                    provider_id: processor.id().to_string(),
                    kind: CapabilityKind::Processor.to_string(),
                })
            }
        };
        let Some(expected) = expected else {
            self.node_mut(id)?.advance(NodeState::ContextReady);
            return Ok(());
        };

        let request = node.request.clone();
        let options = node.options.clone();
        let inputs: Vec<DataCapability> = node
            .plugs
            .iter()
            .filter_map(|plug| plug.remote)
            .filter_map(|socket| self.socket(socket).ok())
            .map(|socket| socket.capability().clone())
            .collect();

        match self.build_context(&request, &options, &inputs, &expected) {
            Ok(handle) => {
                tracing::debug!(
                    "Context {} from '{}' ready for {} ('{}')",
                    handle.resource_kind(),
                    handle.origin(),
                    id,
                    processor.id()
                );
                let node = self.node_mut(id)?;
                node.context = Some(handle);
                node.advance(NodeState::ContextReady);
                Ok(())
            }
            Err(e) => {
                if matches!(e, CMMError::TypeMismatch { .. }) {
                    self.propagate(id, None, ConnectorEvent::IncompatibleContext, Some(ticket_id), true);
                }
                Err(e)
            }
        }
    }

    /// Build (or find in the cache) the context for a node, converting it
    /// when the builder's kind differs from `expected`
    fn build_context(
        &self,
        request: &str,
        options: &NodeOptions,
        inputs: &[DataCapability],
        expected: &str,
    ) -> Result<ContextHandle> {
        let pattern = options.get(CONTEXT_OPTION).unwrap_or(request);
        let resolve = ResolveRequest::new(CapabilityKind::ContextBuilder, pattern)?
            .with_properties(property_snapshot(options));
        let builder = self.registry.resolve_request(&resolve)?;
        let Stage::ContextBuilder(implementation) = &builder.stage else {
            return Err(CMMError::NotExecutable {
                provider_id: builder.id().to_string(),
                kind: CapabilityKind::ContextBuilder.to_string(),
            });
        };

        let build_request = BuildRequest {
            request,
            options,
            inputs,
        };
        let key = context_key(builder.id(), implementation.context_kind(), options, inputs)?;
        let handle = self
            .cache
            .get_or_create(&key, || implementation.build(&build_request))?;
        if handle.resource_kind() == expected {
            return Ok(handle);
        }

        let converter = self
            .registry
            .find_converter(handle.resource_kind(), expected)
            .ok_or_else(|| CMMError::TypeMismatch {
                expected: expected.to_string(),
                actual: handle.resource_kind().to_string(),
            })?;
        let Stage::ContextConverter(conversion) = &converter.stage else {
            return Err(CMMError::NotExecutable {
                provider_id: converter.id().to_string(),
                kind: CapabilityKind::ContextConverter.to_string(),
            });
        };
        let converted_key = serde_json::to_string(&(converter.id(), &key))?;
        let converted = self
            .cache
            .get_or_create(&converted_key, || conversion.convert(&handle, &build_request))?;
        tracing::debug!(
            "Converted {} context to {} with '{}'",
            handle.resource_kind(),
            converted.resource_kind(),
            converter.id()
        );

        if converted.resource_kind() != expected {
            return Err(CMMError::TypeMismatch {
                expected: expected.to_string(),
                actual: converted.resource_kind().to_string(),
            });
        }
        Ok(converted)
    }

    fn resolve_processor(&self, request: &str, options: &NodeOptions) -> Result<ProviderHandle> {
        let mut resolve =
            ResolveRequest::new(CapabilityKind::Processor, request)?.with_properties(property_snapshot(options));
        if let Some(required) = options.get(REQUIRED_OPTION) {
            resolve = resolve.with_required_provider(required);
        }
        let handle = self.registry.resolve_request(&resolve)?;
        match handle.stage {
            Stage::Processor(_) => Ok(handle),
            _ => Err(CMMError::NotExecutable {
                provider_id: handle.id().to_string(),
                kind: CapabilityKind::Processor.to_string(),
            }),
        }
    }

    /// Buffer an upstream node processes into: ticket region, shape of the
    /// node's first socket
    fn intermediate_buffer(&self, id: NodeId, region: Region, target: &Buffer) -> Result<Buffer> {
        let (data_type, channels) = match self.node(id)?.sockets.first() {
            Some(socket) => (
                socket.capability().data_type.clone(),
                socket.capability().channels.unwrap_or(target.channels()),
            ),
            None => (target.data_type().to_string(), target.channels()),
        };
        Buffer::allocate(data_type, channels, region.width, region.height)
    }

    fn process(
        &self,
        id: NodeId,
        outputs: &HashMap<NodeId, Buffer>,
        region: Region,
        output: &mut Buffer,
        cancel: &CancelToken,
        ticket_id: Uuid,
    ) -> Result<()> {
        let node = self.node(id)?;
        let processor = node.processor.as_ref().ok_or_else(|| CMMError::InternalError {
            reason: format!("{} has no processor after resolution", id),
        })?;
        let Stage::Processor(implementation) = &processor.stage else {
            return Err(CMMError::NotExecutable {
                provider_id: processor.id().to_string(),
                kind: CapabilityKind::Processor.to_string(),
            });
        };

        let inputs: Vec<Option<&Buffer>> = node
            .plugs
            .iter()
            .map(|plug| plug.remote.and_then(|socket| outputs.get(&socket.node)))
            .collect();
        let mut ctx = ProcessContext {
            node: id,
            provider_id: processor.id(),
            options: &node.options,
            context: node.context.as_ref(),
            inputs: &inputs,
            region,
            output,
            ticket_id,
            cancel,
        };
        implementation.process(&mut ctx)
    }
}

/// Escape text for a quoted dot record label
fn dot_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '"' | '\\' | '<' | '>' | '{' | '}' | '|' => {
                escaped.push('\\');
                escaped.push(c);
            }
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Node options double as the property snapshot rank tables score against
fn property_snapshot(options: &NodeOptions) -> PropertySnapshot {
    options.iter().collect()
}

/// JSON tuple of provider, kind, options and input shapes
fn context_key(provider_id: &str, kind: &str, options: &NodeOptions, inputs: &[DataCapability]) -> Result<String> {
    Ok(serde_json::to_string(&(provider_id, kind, options.canonical_text()?, inputs))?)
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.node_count())
            .field("observers", &self.observers.len())
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ContextBuilder, Processor, Provider, ProviderDescriptor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const DATA: &str = "org/oyranos/imaging/data";

    struct Constant {
        value: f32,
        runs: Arc<AtomicUsize>,
    }

    impl Processor for Constant {
        fn context_kind(&self) -> Option<&str> {
            None
        }

        fn process(&self, ctx: &mut ProcessContext<'_>) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            ctx.output.fill(self.value);
            Ok(())
        }
    }

    /// Multiplies its input by the `gain` context
    struct Gain;

    impl Processor for Gain {
        fn context_kind(&self) -> Option<&str> {
            Some("gain")
        }

        fn process(&self, ctx: &mut ProcessContext<'_>) -> Result<()> {
            let factor = *ctx.context_as::<f32>("gain")?;
            let input = ctx.input(0).map(|b| b.samples().to_vec()).unwrap_or_default();
            for (out, value) in ctx.output.samples_mut().iter_mut().zip(input) {
                *out = value * factor;
            }
            Ok(())
        }
    }

    /// Adds its inputs
    struct Mix;

    impl Processor for Mix {
        fn context_kind(&self) -> Option<&str> {
            None
        }

        fn process(&self, ctx: &mut ProcessContext<'_>) -> Result<()> {
            let inputs: Vec<Vec<f32>> = (0..2)
                .filter_map(|i| ctx.input(i).map(|b| b.samples().to_vec()))
                .collect();
            for (i, out) in ctx.output.samples_mut().iter_mut().enumerate() {
                *out = inputs.iter().map(|input| input[i]).sum();
            }
            Ok(())
        }
    }

    struct GainBuilder {
        kind: &'static str,
        builds: Arc<AtomicUsize>,
    }

    impl ContextBuilder for GainBuilder {
        fn context_kind(&self) -> &str {
            self.kind
        }

        fn build(&self, request: &BuildRequest<'_>) -> Result<ContextHandle> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            let factor: f32 = request
                .options
                .get("gain")
                .unwrap_or("1")
                .parse()
                .map_err(|_| CMMError::builder("test.gain_ctx", "gain is not a number"))?;
            Ok(ContextHandle::new("test.gain_ctx", self.kind, factor))
        }
    }

    struct Fixture {
        graph: Graph,
        source_runs: Arc<AtomicUsize>,
        builds: Arc<AtomicUsize>,
    }

    fn fixture_with(config: EngineConfig, builder_kind: &'static str) -> Fixture {
        let registry = ModuleRegistry::with_config(&config);
        let source_runs = Arc::new(AtomicUsize::new(0));
        let builds = Arc::new(AtomicUsize::new(0));
        let out = || ConnectorDescriptor::new("out", DataCapability::new(DATA).with_channels(1));

        registry
            .register(Provider::processor(
                ProviderDescriptor::new("test.source", "org/oyranos/imaging/source")
                    .unwrap()
                    .with_socket(out()),
                Constant {
                    value: 2.0,
                    runs: source_runs.clone(),
                },
            ))
            .unwrap();
        registry
            .register(Provider::processor(
                ProviderDescriptor::new("test.gain", "org/oyranos/imaging/gain")
                    .unwrap()
                    .with_plug(ConnectorDescriptor::new("in", DataCapability::new("//imaging/data")))
                    .with_socket(out()),
                Gain,
            ))
            .unwrap();
        registry
            .register(Provider::processor(
                ProviderDescriptor::new("test.mix", "org/oyranos/imaging/mix")
                    .unwrap()
                    .with_plug(ConnectorDescriptor::new("a", DataCapability::new("//imaging/data")))
                    .with_plug(ConnectorDescriptor::new("b", DataCapability::new("//imaging/data")).optional())
                    .with_socket(out()),
                Mix,
            ))
            .unwrap();
        registry
            .register(Provider::context_builder(
                ProviderDescriptor::new("test.gain_ctx", "org/oyranos/imaging/gain").unwrap(),
                GainBuilder {
                    kind: builder_kind,
                    builds: builds.clone(),
                },
            ))
            .unwrap();

        let graph = Graph::new(Arc::new(registry), Arc::new(ContextCache::new()), config);
        Fixture {
            graph,
            source_runs,
            builds,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(EngineConfig::default(), "gain")
    }

    fn ticket() -> Ticket {
        Ticket::for_region(Region::full(2, 2), DATA, 1).unwrap()
    }

    fn chain(graph: &mut Graph, gain: &str) -> (NodeId, NodeId) {
        let source = graph.node_new("//imaging/source", NodeOptions::new()).unwrap();
        let node = graph
            .node_new("//imaging/gain", NodeOptions::new().with("gain", gain))
            .unwrap();
        graph
            .connect(PlugRef::new(node, 0), SocketRef::new(source, 0))
            .unwrap();
        (source, node)
    }

    #[test]
    fn test_node_new_takes_connectors_from_processor() {
        let mut f = fixture();
        let id = f.graph.node_new("//imaging/mix", NodeOptions::new()).unwrap();
        let node = f.graph.node(id).unwrap();
        assert_eq!(node.plugs().len(), 2);
        assert!(!node.plugs()[1].is_mandatory());
        assert_eq!(node.sockets()[0].name(), "out");
        assert_eq!(node.state(), NodeState::Unconnected);

        let err = f.graph.node_new("//imaging/missing", NodeOptions::new()).unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[test]
    fn test_pull_chain() {
        let mut f = fixture();
        let (source, gain) = chain(&mut f.graph, "3");
        assert_eq!(f.graph.state(gain).unwrap(), NodeState::Connected);

        let mut ticket = ticket();
        f.graph.pull_node(gain, &mut ticket).unwrap();
        assert!(ticket.target().samples().iter().all(|s| *s == 6.0));
        assert_eq!(f.graph.state(source).unwrap(), NodeState::DataValid);
        assert_eq!(f.graph.state(gain).unwrap(), NodeState::DataValid);
        assert_eq!(f.graph.node(gain).unwrap().context().unwrap().origin(), "test.gain_ctx");
    }

    #[test]
    fn test_options_with_separators_get_their_own_context() {
        let mut f = fixture();
        let source = f.graph.node_new("//imaging/source", NodeOptions::new()).unwrap();
        let packed = f
            .graph
            .node_new("//imaging/gain", NodeOptions::new().with("a", "1;gain=5"))
            .unwrap();
        let split = f
            .graph
            .node_new("//imaging/gain", NodeOptions::new().with("a", "1").with("gain", "5"))
            .unwrap();
        for node in [packed, split] {
            f.graph
                .connect(PlugRef::new(node, 0), SocketRef::new(source, 0))
                .unwrap();
        }

        let mut first = ticket();
        f.graph.pull_node(packed, &mut first).unwrap();
        let mut second = ticket();
        f.graph.pull_node(split, &mut second).unwrap();

        assert!(first.target().samples().iter().all(|s| *s == 2.0));
        assert!(second.target().samples().iter().all(|s| *s == 10.0));
        assert_eq!(f.builds.load(Ordering::SeqCst), 2);
        assert_eq!(f.graph.cache().len(), 2);
    }

    #[test]
    fn test_pull_through_plug() {
        let mut f = fixture();
        let (_, gain) = chain(&mut f.graph, "3");
        let mut ticket = ticket();
        f.graph.pull(PlugRef::new(gain, 0), &mut ticket).unwrap();
        assert!(ticket.target().samples().iter().all(|s| *s == 2.0));

        let mix = f.graph.node_new("//imaging/mix", NodeOptions::new()).unwrap();
        let err = f.graph.pull(PlugRef::new(mix, 0), &mut ticket).unwrap_err();
        assert_eq!(err.error_code(), "NOT_CONNECTED");
    }

    #[test]
    fn test_connect_errors() {
        let mut f = fixture();
        let (source, gain) = chain(&mut f.graph, "1");

        let err = f
            .graph
            .connect(PlugRef::new(gain, 0), SocketRef::new(source, 0))
            .unwrap_err();
        assert_eq!(err.error_code(), "ALREADY_CONNECTED");

        let strict = f.graph.node_with_connectors(
            "//imaging/gain",
            NodeOptions::new(),
            vec![ConnectorDescriptor::new("in", DataCapability::new("//imaging/data").with_channels(3))],
            vec![],
        );
        let err = f
            .graph
            .connect(PlugRef::new(strict, 0), SocketRef::new(source, 0))
            .unwrap_err();
        assert_eq!(err.error_code(), "INCOMPATIBLE_CONNECTORS");
        assert_eq!(err.category(), crate::error::ErrorCategory::TypeMismatch);
        assert!(f
            .graph
            .events()
            .iter()
            .any(|e| e.event == ConnectorEvent::IncompatibleData && e.target == strict));

        let err = f
            .graph
            .connect(PlugRef::new(strict, 5), SocketRef::new(source, 0))
            .unwrap_err();
        assert_eq!(err.error_code(), "CONNECTOR_NOT_FOUND");
    }

    #[test]
    fn test_cycle_detected() {
        let mut f = fixture();
        let a = f.graph.node_new("//imaging/gain", NodeOptions::new()).unwrap();
        let b = f.graph.node_new("//imaging/gain", NodeOptions::new()).unwrap();
        f.graph.connect(PlugRef::new(a, 0), SocketRef::new(b, 0)).unwrap();
        f.graph.connect(PlugRef::new(b, 0), SocketRef::new(a, 0)).unwrap();

        let err = f.graph.pull_node(a, &mut ticket()).unwrap_err();
        assert_eq!(err.error_code(), "CYCLE_DETECTED");
        assert_eq!(f.graph.state(a).unwrap(), NodeState::Connected);
    }

    #[test]
    fn test_incomplete_graph() {
        let mut f = fixture();
        let gain = f.graph.node_new("//imaging/gain", NodeOptions::new()).unwrap();
        let err = f.graph.pull_node(gain, &mut ticket()).unwrap_err();
        assert_eq!(err.error_code(), "INCOMPLETE_GRAPH");
        let event = f.graph.events().pop().unwrap();
        assert_eq!(event.event, ConnectorEvent::IncompleteGraph);
        assert_eq!(event.target, gain);
        assert!(event.ticket_id.is_some());

        // optional plugs may stay unbound
        let (_, upstream) = chain(&mut f.graph, "2");
        let mix = f.graph.node_new("//imaging/mix", NodeOptions::new()).unwrap();
        f.graph
            .connect(PlugRef::new(mix, 0), SocketRef::new(upstream, 0))
            .unwrap();
        let mut ticket = ticket();
        f.graph.pull_node(mix, &mut ticket).unwrap();
        assert!(ticket.target().samples().iter().all(|s| *s == 4.0));
    }

    #[test]
    fn test_cancelled_pull() {
        let mut f = fixture();
        let (source, gain) = chain(&mut f.graph, "3");
        let mut ticket = ticket();
        ticket.cancel();

        let err = f.graph.pull_node(gain, &mut ticket).unwrap_err();
        assert_eq!(err.error_code(), "CANCELLED");
        assert_eq!(f.source_runs.load(Ordering::SeqCst), 0);
        assert_ne!(f.graph.state(source).unwrap(), NodeState::DataValid);
    }

    #[test]
    fn test_depth_bound() {
        let mut f = fixture_with(EngineConfig::default().with_max_pull_depth(2), "gain");
        let (_, first) = chain(&mut f.graph, "1");
        let second = f.graph.node_new("//imaging/gain", NodeOptions::new()).unwrap();
        f.graph
            .connect(PlugRef::new(second, 0), SocketRef::new(first, 0))
            .unwrap();

        f.graph.pull_node(first, &mut ticket()).unwrap();
        let err = f.graph.pull_node(second, &mut ticket()).unwrap_err();
        assert_eq!(err.error_code(), "DEPTH_EXCEEDED");
    }

    #[test]
    fn test_shared_upstream_processed_once() {
        let mut f = fixture();
        let source = f.graph.node_new("//imaging/source", NodeOptions::new()).unwrap();
        let a = f.graph.node_new("//imaging/gain", NodeOptions::new().with("gain", "1")).unwrap();
        let b = f.graph.node_new("//imaging/gain", NodeOptions::new().with("gain", "2")).unwrap();
        let mix = f.graph.node_new("//imaging/mix", NodeOptions::new()).unwrap();
        f.graph.connect(PlugRef::new(a, 0), SocketRef::new(source, 0)).unwrap();
        f.graph.connect(PlugRef::new(b, 0), SocketRef::new(source, 0)).unwrap();
        f.graph.connect(PlugRef::new(mix, 0), SocketRef::new(a, 0)).unwrap();
        f.graph.connect(PlugRef::new(mix, 1), SocketRef::new(b, 0)).unwrap();

        let mut ticket = ticket();
        f.graph.pull_node(mix, &mut ticket).unwrap();
        assert_eq!(f.source_runs.load(Ordering::SeqCst), 1);
        assert!(ticket.target().samples().iter().all(|s| *s == 6.0));

        // every downstream node hears a notification once
        let received = f
            .graph
            .notify(SocketRef::new(source, 0), ConnectorEvent::DataChanged)
            .unwrap();
        assert_eq!(received, 3);
        assert_eq!(f.graph.state(mix).unwrap(), NodeState::ContextReady);
        assert_eq!(f.graph.state(source).unwrap(), NodeState::DataValid);
    }

    #[test]
    fn test_identical_nodes_share_context() {
        let mut f = fixture();
        let (_, a) = chain(&mut f.graph, "3");
        let (_, b) = chain(&mut f.graph, "3");
        f.graph.pull_node(a, &mut ticket()).unwrap();
        f.graph.pull_node(b, &mut ticket()).unwrap();
        f.graph.pull_node(a, &mut ticket()).unwrap();

        assert_eq!(f.builds.load(Ordering::SeqCst), 1);
        let ctx_a = f.graph.node(a).unwrap().context().unwrap();
        let ctx_b = f.graph.node(b).unwrap().context().unwrap();
        assert!(ctx_a.same_context(ctx_b));
    }

    #[test]
    fn test_set_option_invalidates_downstream() {
        let mut f = fixture();
        let (_, gain) = chain(&mut f.graph, "3");
        let mix = f.graph.node_new("//imaging/mix", NodeOptions::new()).unwrap();
        f.graph.connect(PlugRef::new(mix, 0), SocketRef::new(gain, 0)).unwrap();
        f.graph.pull_node(mix, &mut ticket()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.graph.subscribe(move |event: &GraphEvent| {
            if let Ok(mut events) = sink.lock() {
                events.push((event.event, event.target));
            }
        });

        let previous = f.graph.set_option(gain, "gain", "5").unwrap();
        assert_eq!(previous.as_deref(), Some("3"));
        assert_eq!(f.graph.state(gain).unwrap(), NodeState::Connected);
        assert_eq!(f.graph.state(mix).unwrap(), NodeState::ContextReady);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[(ConnectorEvent::ContextInvalidated, mix)]
        );

        let mut ticket = ticket();
        f.graph.pull_node(mix, &mut ticket).unwrap();
        assert!(ticket.target().samples().iter().all(|s| *s == 10.0));
        assert_eq!(f.builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_required_option_rejected() {
        let mut f = fixture();
        let (_, gain) = chain(&mut f.graph, "3");
        let err = f.graph.set_option(gain, REQUIRED_OPTION, "nobody").unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
        assert_eq!(f.graph.node(gain).unwrap().options().get(REQUIRED_OPTION), None);
        assert_eq!(
            f.graph.events().last().map(|e| e.event),
            Some(ConnectorEvent::IncompatibleOption)
        );

        assert!(f.graph.set_option(gain, REQUIRED_OPTION, "test.gain").is_ok());
    }

    #[test]
    fn test_context_kind_mismatch() {
        let mut f = fixture_with(EngineConfig::default(), "gain_text");
        let (source, gain) = chain(&mut f.graph, "3");
        let err = f.graph.pull_node(gain, &mut ticket()).unwrap_err();
        assert_eq!(err.error_code(), "TYPE_MISMATCH");
        // resolution progress is kept, data validity is not
        assert_eq!(f.source_runs.load(Ordering::SeqCst), 1);
        assert_eq!(f.graph.state(source).unwrap(), NodeState::ContextReady);
        assert_eq!(f.graph.state(gain).unwrap(), NodeState::ProviderResolved);
        assert!(f
            .graph
            .events()
            .iter()
            .any(|e| e.event == ConnectorEvent::IncompatibleContext && e.target == gain));
    }

    #[test]
    fn test_remove_node() {
        let mut f = fixture();
        let (source, gain) = chain(&mut f.graph, "3");

        let err = f.graph.remove_node(source).unwrap_err();
        assert_eq!(err.error_code(), "NODE_IN_USE");

        f.graph.remove_node(gain).unwrap();
        assert!(!f.graph.socket(SocketRef::new(source, 0)).unwrap().is_connected());
        f.graph.remove_node(source).unwrap();
        assert_eq!(f.graph.node_count(), 0);

        // slot reuse does not revive stale ids
        let fresh = f.graph.node_new("//imaging/source", NodeOptions::new()).unwrap();
        assert_eq!(fresh.index(), source.index());
        assert_ne!(fresh, source);
        assert_eq!(f.graph.node(source).unwrap_err().error_code(), "NODE_NOT_FOUND");
    }

    #[test]
    fn test_disconnect_and_adjacency() {
        let mut f = fixture();
        let (source, gain) = chain(&mut f.graph, "3");
        let mix = f.graph.node_new("//imaging/mix", NodeOptions::new()).unwrap();
        f.graph.connect(PlugRef::new(mix, 0), SocketRef::new(gain, 0)).unwrap();
        let lonely = f.graph.node_new("//imaging/source", NodeOptions::new()).unwrap();

        let adjacency = f.graph.adjacency(source).unwrap();
        assert_eq!(adjacency.nodes, vec![source, gain, mix]);
        assert_eq!(adjacency.edges.len(), 2);
        assert_eq!(f.graph.adjacency(lonely).unwrap().nodes, vec![lonely]);

        let socket = f.graph.disconnect(PlugRef::new(gain, 0)).unwrap();
        assert_eq!(socket, SocketRef::new(source, 0));
        assert_eq!(f.graph.adjacency(source).unwrap().nodes, vec![source]);
        assert_eq!(f.graph.events().last().map(|e| e.event), Some(ConnectorEvent::Released));

        let err = f.graph.disconnect(PlugRef::new(gain, 0)).unwrap_err();
        assert_eq!(err.error_code(), "NOT_CONNECTED");
    }

    #[test]
    fn test_to_dot() {
        let mut f = fixture();
        let (source, gain) = chain(&mut f.graph, "3");
        let mut ticket = ticket();
        f.graph.pull_node(gain, &mut ticket).unwrap();
        f.graph.set_option(gain, "note", "a|b").unwrap();
        let pending = f.graph.node_with_connectors(
            "//imaging/mix",
            NodeOptions::new(),
            vec![ConnectorDescriptor::new("in", DataCapability::new("//imaging/data"))],
            Vec::new(),
        );
        f.graph
            .connect(PlugRef::new(pending, 0), SocketRef::new(gain, 0))
            .unwrap();

        let dot = f.graph.to_dot(source, "color \"conversion\"").unwrap();
        assert!(dot.starts_with("digraph G {\n"));
        assert!(dot.ends_with("  }\n}\n"));
        assert!(dot.contains(&format!("\"{}\":socket -> \"{}\":plug", source, gain)));
        assert!(dot.contains(&format!("\"{}\":socket -> \"{}\":plug", gain, pending)));
        assert!(dot.contains(r#"Request: \"//imaging/source\""#));
        assert!(dot.contains(r#"CMM: \"test.source\""#));
        assert!(dot.contains(r#"CMM: \"unresolved\""#));
        assert!(dot.contains(r#"Options: \"gain=3, note=a\|b\""#));
        assert!(dot.contains(r#"label="color \"conversion\"""#));
        assert_eq!(dot.matches("[label=").count(), 3);

        let missing = f.graph.to_dot(NodeId::new(42, 0), "").unwrap_err();
        assert_eq!(missing.error_code(), "NODE_NOT_FOUND");
    }
}
