//! Interfaces of the remote media graph.
//!
//! Everything that lives in the graph server is reached through these
//! traits. The session layer only ever holds `Rc` handles to proxies; the
//! server side is free to implement them over any transport.

use std::rc::Rc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{Properties, ProxyFeatures, RemoteError};

#[cfg(feature = "memory")]
pub mod memory;
pub mod types;

#[cfg(feature = "memory")]
pub use memory::MemoryGraph;
pub use types::{
    AudioChannel, AudioFormat, Direction, NodeCommand, NodeState, NodeStateChange, Param,
    PortConfigMode, PortInfo, SampleFormat,
};

/// Factory name for plain processing nodes.
pub const SPA_NODE_FACTORY: &str = "spa-node-factory";
/// Factory name for point-to-point links.
pub const LINK_FACTORY: &str = "link-factory";
/// Kind of exported endpoint objects.
pub const ENDPOINT_KIND: &str = "endpoint";

/// A proxy to any remote object.
#[async_trait(?Send)]
pub trait RemoteObject {
    /// Global id assigned by the server.
    fn bound_id(&self) -> u32;

    /// Snapshot of the object's properties.
    fn properties(&self) -> Properties;

    /// Features the proxy currently has.
    fn features(&self) -> ProxyFeatures;

    /// Augment the proxy until it has `features`.
    ///
    /// # Errors
    /// Returns error if the server rejects the object or it is destroyed
    /// while activating.
    async fn activate(&self, features: ProxyFeatures) -> Result<(), RemoteError>;

    /// Set a parameter on the object.
    ///
    /// # Errors
    /// Returns error if the object no longer exists.
    fn set_param(&self, param: Param) -> Result<(), RemoteError>;
}

/// A proxy to a remote node.
pub trait RemoteNode: RemoteObject {
    fn state(&self) -> NodeState;

    /// Receive every state change from now on.
    fn subscribe_state(&self) -> broadcast::Receiver<NodeStateChange>;

    /// Ports currently exposed by the node.
    fn ports(&self) -> Vec<PortInfo>;

    /// # Errors
    /// Returns error if the node no longer exists.
    fn send_command(&self, command: NodeCommand) -> Result<(), RemoteError>;
}

/// Entry point to the remote graph.
pub trait RemoteCore {
    /// Create a node through a server-side factory.
    ///
    /// # Errors
    /// Returns error if the factory is unknown.
    fn create_node(
        &self,
        factory: &str,
        properties: Properties,
    ) -> Result<Rc<dyn RemoteNode>, RemoteError>;

    /// Create a link between two ports. Dropping the handle destroys it.
    ///
    /// # Errors
    /// Returns error if the factory is unknown or an endpoint is missing.
    fn create_link(
        &self,
        factory: &str,
        properties: Properties,
    ) -> Result<Rc<dyn RemoteObject>, RemoteError>;

    /// Export a locally described object to the server.
    ///
    /// # Errors
    /// Returns error if the server does not know `kind`.
    fn export(&self, kind: &str, properties: Properties)
    -> Result<Rc<dyn RemoteObject>, RemoteError>;

    fn lookup_node(&self, id: u32) -> Option<Rc<dyn RemoteNode>>;

    /// All nodes currently known.
    fn nodes(&self) -> Vec<Rc<dyn RemoteNode>>;
}
