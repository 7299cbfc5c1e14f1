//! Suspends nodes that stay idle.
//!
//! Every watched node gets its own local task following the node's state
//! stream. Entering IDLE arms a timer; any other state change disarms it.
//! When the timer fires the node is sent a suspend command.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    rc::{Rc, Weak},
    time::Duration,
};

use futures::StreamExt;
use media_session_core::{
    Interest, RemoteNode,
    remote::{NodeCommand, NodeState, NodeStateChange},
};
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};
use tokio_stream::wrappers::BroadcastStream;

use crate::SessionContext;

/// Idle-node suspension policy.
pub struct NodeSuspension {
    context: Rc<SessionContext>,
    interest: Interest,
    watchers: RefCell<BTreeMap<u32, JoinHandle<()>>>,
}

impl std::fmt::Debug for NodeSuspension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSuspension")
            .field("interest", &self.interest)
            .field("watched", &self.watched())
            .finish_non_exhaustive()
    }
}

impl NodeSuspension {
    /// Suspend nodes matching `interest` after the context's idle timeout.
    #[must_use]
    pub fn new(context: &Rc<SessionContext>, interest: Interest) -> Self {
        Self {
            context: Rc::clone(context),
            interest,
            watchers: RefCell::new(BTreeMap::new()),
        }
    }

    /// Watch every matching node the remote currently knows about.
    ///
    /// Returns how many nodes were added. Must be called from within a
    /// [`tokio::task::LocalSet`].
    pub fn scan(&self) -> usize {
        self.context
            .remote()
            .nodes()
            .into_iter()
            .filter(|node| self.watch(node))
            .count()
    }

    /// Start watching `node` if it matches and is not watched yet.
    pub fn watch(&self, node: &Rc<dyn RemoteNode>) -> bool {
        let id = node.bound_id();
        self.prune();
        if self.watchers.borrow().contains_key(&id) || !self.interest.matches(&node.properties()) {
            return false;
        }
        let timeout = self.context.settings().suspend_timeout();
        let changes = node.subscribe_state();
        let handle = tokio::task::spawn_local(watch_node(
            Rc::downgrade(node),
            changes,
            node.state(),
            timeout,
        ));
        self.watchers.borrow_mut().insert(id, handle);
        tracing::debug!(node = id, "watching node for suspension");
        true
    }

    /// Stop watching a node, cancelling any pending suspension.
    pub fn unwatch(&self, node_id: u32) {
        if let Some(handle) = self.watchers.borrow_mut().remove(&node_id) {
            handle.abort();
        }
    }

    /// Ids of the watched nodes.
    #[must_use]
    pub fn watched(&self) -> Vec<u32> {
        self.prune();
        self.watchers.borrow().keys().copied().collect()
    }

    /// Forget watchers whose node went away.
    fn prune(&self) {
        self.watchers.borrow_mut().retain(|_, handle| !handle.is_finished());
    }
}

impl Drop for NodeSuspension {
    fn drop(&mut self) {
        for handle in self.watchers.get_mut().values() {
            handle.abort();
        }
    }
}

async fn watch_node(
    node: Weak<dyn RemoteNode>,
    receiver: broadcast::Receiver<NodeStateChange>,
    initial: NodeState,
    timeout: Duration,
) {
    let changes = BroadcastStream::new(receiver).filter_map(|r| async move { r.ok() });
    let mut changes = std::pin::pin!(changes);
    let mut deadline = (initial == NodeState::Idle).then(|| Instant::now() + timeout);

    loop {
        let armed = deadline;
        let timer = async move {
            match armed {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            change = changes.next() => {
                let Some(change) = change else {
                    break;
                };
                deadline = (change.new == NodeState::Idle).then(|| Instant::now() + timeout);
            }
            () = timer => {
                deadline = None;
                let Some(node) = node.upgrade() else {
                    break;
                };
                tracing::debug!(node = node.bound_id(), "suspending idle node");
                if let Err(e) = node.send_command(NodeCommand::Suspend) {
                    tracing::warn!(node = node.bound_id(), error = %e, "failed to suspend node");
                }
            }
        }
    }
}
