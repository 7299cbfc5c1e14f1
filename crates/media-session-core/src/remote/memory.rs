//! In-process remote graph.
//!
//! Behaves like a small graph server living in the same thread: nodes,
//! ports, links and exported objects are kept in shared tables, every
//! activation completes on a later poll, and failures can be injected.
//! Data is lost when the last handle is dropped.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, BTreeSet},
    rc::{Rc, Weak},
};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{
    ENDPOINT_KIND, LINK_FACTORY, RemoteCore, RemoteNode, RemoteObject, SPA_NODE_FACTORY,
    types::{
        AudioChannel, Direction, NodeCommand, NodeState, NodeStateChange, Param, PortConfigMode,
        PortInfo,
    },
};
use crate::{Properties, ProxyFeatures, RemoteError, properties::keys};

const STATE_CHANNEL_CAPACITY: usize = 16;

/// A link as seen by the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub id: u32,
    pub output_node: u32,
    pub output_port: u32,
    pub input_node: u32,
    pub input_port: u32,
    pub passive: bool,
}

#[derive(Default)]
struct GraphState {
    next_id: u32,
    nodes: BTreeMap<u32, Rc<MemoryNode>>,
    links: BTreeMap<u32, LinkInfo>,
    exported: BTreeMap<u32, Properties>,
    failing_input_ports: BTreeSet<u32>,
    failing_exports: bool,
}

impl GraphState {
    fn allocate_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

/// Shared handle to an in-process graph.
#[derive(Clone, Default)]
pub struct MemoryGraph {
    state: Rc<RefCell<GraphState>>,
}

impl MemoryGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with native ports, as a device monitor would.
    pub fn add_node(
        &self,
        properties: Properties,
        ports: &[(Direction, AudioChannel)],
    ) -> Rc<MemoryNode> {
        let id = self.state.borrow_mut().allocate_id();
        let node = Rc::new(MemoryNode::new(id, properties, Rc::downgrade(&self.state)));
        let native: Vec<PortInfo> = ports
            .iter()
            .map(|&(direction, channel)| PortInfo {
                id: self.state.borrow_mut().allocate_id(),
                direction,
                properties: Properties::new().with(keys::AUDIO_CHANNEL, channel.nick()),
            })
            .collect();
        node.ports.borrow_mut().clone_from(&native);
        *node.native_ports.borrow_mut() = native;
        self.state.borrow_mut().nodes.insert(id, Rc::clone(&node));
        tracing::trace!(node = id, "added node");
        node
    }

    #[must_use]
    pub fn node(&self, id: u32) -> Option<Rc<MemoryNode>> {
        self.state.borrow().nodes.get(&id).cloned()
    }

    /// Links currently existing in the graph.
    #[must_use]
    pub fn links(&self) -> Vec<LinkInfo> {
        self.state.borrow().links.values().cloned().collect()
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.state.borrow().links.len()
    }

    /// Properties of currently exported objects.
    #[must_use]
    pub fn exported(&self) -> Vec<Properties> {
        self.state.borrow().exported.values().cloned().collect()
    }

    /// Make activation of any link ending at `port_id` fail.
    pub fn fail_links_to_input_port(&self, port_id: u32) {
        self.state.borrow_mut().failing_input_ports.insert(port_id);
    }

    /// Remove a node and the links touching it, as if its client went away.
    pub fn remove_node(&self, id: u32) -> bool {
        let mut state = self.state.borrow_mut();
        let removed = state.nodes.remove(&id);
        state
            .links
            .retain(|_, link| link.output_node != id && link.input_node != id);
        drop(state);
        if removed.is_some() {
            tracing::trace!(node = id, "removed node");
        }
        removed.is_some()
    }

    /// Make activation of exported objects fail.
    pub fn set_fail_exports(&self, fail: bool) {
        self.state.borrow_mut().failing_exports = fail;
    }

    fn node_has_port(&self, node_id: u32, port_id: u32, direction: Direction) -> bool {
        self.node(node_id).is_some_and(|node| {
            node.ports
                .borrow()
                .iter()
                .any(|p| p.id == port_id && p.direction == direction)
        })
    }
}

impl RemoteCore for MemoryGraph {
    fn create_node(
        &self,
        factory: &str,
        properties: Properties,
    ) -> Result<Rc<dyn RemoteNode>, RemoteError> {
        if factory != SPA_NODE_FACTORY && factory != "adapter" {
            return Err(RemoteError::UnknownFactory(factory.to_string()));
        }
        let node = self.add_node(properties, &[]);
        tracing::debug!(node = node.id, factory, "created node");
        Ok(node)
    }

    fn create_link(
        &self,
        factory: &str,
        properties: Properties,
    ) -> Result<Rc<dyn RemoteObject>, RemoteError> {
        if factory != LINK_FACTORY {
            return Err(RemoteError::UnknownFactory(factory.to_string()));
        }
        let address = |key: &str| -> Result<u32, RemoteError> {
            properties
                .parse::<u32>(key)
                .and_then(Result::ok)
                .ok_or(RemoteError::NotFound(0))
        };
        let output_node = address(keys::LINK_OUTPUT_NODE)?;
        let output_port = address(keys::LINK_OUTPUT_PORT)?;
        let input_node = address(keys::LINK_INPUT_NODE)?;
        let input_port = address(keys::LINK_INPUT_PORT)?;
        if !self.node_has_port(output_node, output_port, Direction::Output) {
            return Err(RemoteError::NotFound(output_port));
        }
        if !self.node_has_port(input_node, input_port, Direction::Input) {
            return Err(RemoteError::NotFound(input_port));
        }

        let mut state = self.state.borrow_mut();
        let id = state.allocate_id();
        let fail_activation = state.failing_input_ports.contains(&input_port);
        state.links.insert(
            id,
            LinkInfo {
                id,
                output_node,
                output_port,
                input_node,
                input_port,
                passive: properties.get_bool(keys::LINK_PASSIVE),
            },
        );
        drop(state);

        tracing::debug!(link = id, output_port, input_port, "created link");
        Ok(Rc::new(MemoryObject {
            id,
            kind: ObjectKind::Link,
            properties,
            features: Cell::new(ProxyFeatures::empty()),
            fail_activation,
            graph: Rc::downgrade(&self.state),
        }))
    }

    fn export(
        &self,
        kind: &str,
        properties: Properties,
    ) -> Result<Rc<dyn RemoteObject>, RemoteError> {
        if kind != ENDPOINT_KIND {
            return Err(RemoteError::UnknownFactory(kind.to_string()));
        }
        let mut state = self.state.borrow_mut();
        let id = state.allocate_id();
        let fail_activation = state.failing_exports;
        state.exported.insert(id, properties.clone());
        drop(state);

        Ok(Rc::new(MemoryObject {
            id,
            kind: ObjectKind::Exported,
            properties,
            features: Cell::new(ProxyFeatures::empty()),
            fail_activation,
            graph: Rc::downgrade(&self.state),
        }))
    }

    fn lookup_node(&self, id: u32) -> Option<Rc<dyn RemoteNode>> {
        self.node(id).map(|node| node as Rc<dyn RemoteNode>)
    }

    fn nodes(&self) -> Vec<Rc<dyn RemoteNode>> {
        self.state
            .borrow()
            .nodes
            .values()
            .map(|node| Rc::clone(node) as Rc<dyn RemoteNode>)
            .collect()
    }
}

/// A node living in a [`MemoryGraph`].
pub struct MemoryNode {
    id: u32,
    properties: RefCell<Properties>,
    features: Cell<ProxyFeatures>,
    state: Cell<NodeState>,
    ports: RefCell<Vec<PortInfo>>,
    native_ports: RefCell<Vec<PortInfo>>,
    params: RefCell<Vec<Param>>,
    commands: RefCell<Vec<NodeCommand>>,
    fail_activation: Cell<bool>,
    state_tx: broadcast::Sender<NodeStateChange>,
    graph: Weak<RefCell<GraphState>>,
}

impl MemoryNode {
    fn new(id: u32, properties: Properties, graph: Weak<RefCell<GraphState>>) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            id,
            properties: RefCell::new(properties),
            features: Cell::new(ProxyFeatures::empty()),
            state: Cell::new(NodeState::Suspended),
            ports: RefCell::new(Vec::new()),
            native_ports: RefCell::new(Vec::new()),
            params: RefCell::new(Vec::new()),
            commands: RefCell::new(Vec::new()),
            fail_activation: Cell::new(false),
            state_tx,
            graph,
        }
    }

    /// Change the run state and notify subscribers.
    pub fn set_state(&self, new: NodeState) {
        let old = self.state.replace(new);
        if old == new {
            return;
        }
        tracing::trace!(node = self.id, %old, %new, "node state changed");
        // no subscribers is fine
        let _ = self.state_tx.send(NodeStateChange {
            node_id: self.id,
            old,
            new,
        });
    }

    /// Make the next activations of this node fail.
    pub fn set_fail_activation(&self, fail: bool) {
        self.fail_activation.set(fail);
    }

    /// Parameters set so far, in order.
    #[must_use]
    pub fn params(&self) -> Vec<Param> {
        self.params.borrow().clone()
    }

    /// Commands received so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<NodeCommand> {
        self.commands.borrow().clone()
    }

    fn allocate_port_id(&self) -> Result<u32, RemoteError> {
        let graph = self.graph.upgrade().ok_or(RemoteError::Destroyed(self.id))?;
        let id = graph.borrow_mut().allocate_id();
        Ok(id)
    }

    fn apply_port_config(
        &self,
        direction: Direction,
        mode: PortConfigMode,
        control: bool,
        monitor: bool,
        channels: Option<Vec<AudioChannel>>,
    ) -> Result<(), RemoteError> {
        let mut ports: Vec<PortInfo> = match (mode, channels) {
            (PortConfigMode::Passthrough, _) => self
                .native_ports
                .borrow()
                .iter()
                .filter(|p| p.direction == direction)
                .cloned()
                .collect(),
            (PortConfigMode::None, _) => Vec::new(),
            (_, Some(positions)) => positions
                .into_iter()
                .map(|channel| {
                    Ok(PortInfo {
                        id: self.allocate_port_id()?,
                        direction,
                        properties: Properties::new().with(keys::AUDIO_CHANNEL, channel.nick()),
                    })
                })
                .collect::<Result<_, RemoteError>>()?,
            // DSP without a format keeps the current layout
            (_, None) => return Ok(()),
        };

        if control {
            ports.push(PortInfo {
                id: self.allocate_port_id()?,
                direction,
                properties: Properties::new().with(keys::PORT_CONTROL, "true"),
            });
        }
        if monitor && direction == Direction::Input {
            let monitors = ports
                .iter()
                .filter(|p| !p.properties.get_bool(keys::PORT_CONTROL))
                .map(|p| p.channel())
                .collect::<Vec<_>>();
            for channel in monitors {
                ports.push(PortInfo {
                    id: self.allocate_port_id()?,
                    direction: Direction::Output,
                    properties: Properties::new()
                        .with(keys::AUDIO_CHANNEL, channel.nick())
                        .with(keys::PORT_MONITOR, "true"),
                });
            }
        }

        let mut current = self.ports.borrow_mut();
        current.retain(|p| {
            p.direction != direction
                && !(direction == Direction::Input && p.properties.get_bool(keys::PORT_MONITOR))
        });
        current.extend(ports);
        Ok(())
    }
}

#[async_trait(?Send)]
impl RemoteObject for MemoryNode {
    fn bound_id(&self) -> u32 {
        self.id
    }

    fn properties(&self) -> Properties {
        self.properties.borrow().clone()
    }

    fn features(&self) -> ProxyFeatures {
        self.features.get()
    }

    async fn activate(&self, features: ProxyFeatures) -> Result<(), RemoteError> {
        tokio::task::yield_now().await;
        if self.fail_activation.get() {
            return Err(RemoteError::ActivationFailed {
                id: self.id,
                reason: "node rejected activation".into(),
            });
        }
        if self.graph.upgrade().is_none() {
            return Err(RemoteError::Destroyed(self.id));
        }
        self.features.set(self.features.get() | features);
        Ok(())
    }

    fn set_param(&self, param: Param) -> Result<(), RemoteError> {
        match &param {
            Param::PortConfig {
                direction,
                mode,
                control,
                monitor,
                format,
            } => self.apply_port_config(
                *direction,
                *mode,
                *control,
                *monitor,
                format.as_ref().map(|f| f.positions.clone()),
            )?,
            Param::Props(props) => self.properties.borrow_mut().update(props),
        }
        self.params.borrow_mut().push(param);
        Ok(())
    }
}

impl RemoteNode for MemoryNode {
    fn state(&self) -> NodeState {
        self.state.get()
    }

    fn subscribe_state(&self) -> broadcast::Receiver<NodeStateChange> {
        self.state_tx.subscribe()
    }

    fn ports(&self) -> Vec<PortInfo> {
        self.ports.borrow().clone()
    }

    fn send_command(&self, command: NodeCommand) -> Result<(), RemoteError> {
        if self.graph.upgrade().is_none() {
            return Err(RemoteError::Destroyed(self.id));
        }
        self.commands.borrow_mut().push(command);
        match command {
            NodeCommand::Suspend => self.set_state(NodeState::Suspended),
            NodeCommand::Pause => self.set_state(NodeState::Idle),
            NodeCommand::Start => self.set_state(NodeState::Running),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    Link,
    Exported,
}

/// Link or exported object; removed from the graph when dropped.
struct MemoryObject {
    id: u32,
    kind: ObjectKind,
    properties: Properties,
    features: Cell<ProxyFeatures>,
    fail_activation: bool,
    graph: Weak<RefCell<GraphState>>,
}

#[async_trait(?Send)]
impl RemoteObject for MemoryObject {
    fn bound_id(&self) -> u32 {
        self.id
    }

    fn properties(&self) -> Properties {
        self.properties.clone()
    }

    fn features(&self) -> ProxyFeatures {
        self.features.get()
    }

    async fn activate(&self, features: ProxyFeatures) -> Result<(), RemoteError> {
        tokio::task::yield_now().await;
        if self.fail_activation {
            return Err(RemoteError::ActivationFailed {
                id: self.id,
                reason: match self.kind {
                    ObjectKind::Link => "link negotiation failed",
                    ObjectKind::Exported => "export rejected",
                }
                .into(),
            });
        }
        self.features.set(self.features.get() | features);
        Ok(())
    }

    fn set_param(&self, param: Param) -> Result<(), RemoteError> {
        if let Param::Props(_) = param {
            Ok(())
        } else {
            Err(RemoteError::NotFound(self.id))
        }
    }
}

impl Drop for MemoryObject {
    fn drop(&mut self) {
        if let Some(graph) = self.graph.upgrade() {
            let mut state = graph.borrow_mut();
            match self.kind {
                ObjectKind::Link => {
                    state.links.remove(&self.id);
                }
                ObjectKind::Exported => {
                    state.exported.remove(&self.id);
                }
            }
            tracing::trace!(object = self.id, "destroyed object");
        }
    }
}
