//! Converter item: a format-converting node placed in front of a target.
//!
//! Activation creates an `audioconvert` node derived from the target's
//! node. Once active, the item follows the node's run state and keeps a
//! standard link to the target while the node is running.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    rc::{Rc, Weak},
};

use futures::StreamExt;
use media_session_core::{
    ConfigError, Error, ItemFeatures, Properties, ProxyFeatures, RemoteNode, Transition,
    Transitionable,
    properties::keys,
    remote::{AudioFormat, Direction, NodeState, NodeStateChange, Param, PortConfigMode, SPA_NODE_FACTORY},
    transition::{STEP_ERROR, STEP_NONE, Step},
};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    SessionContext, SiStandardLink,
    adapter::configure_node_ports,
    item::{AssociatedResource, ItemBase, ItemId, ResourceKind, STEP_ITEM_CUSTOM_START, SessionItem, activate, deactivate},
    linkable::{Adapter, FormatCallback, Linkable, PortMode, PortRef, CONTEXT_REVERSE, select_ports},
};

const STEP_VERIFY_CONFIG: Step = STEP_ITEM_CUSTOM_START;
const STEP_CREATE_NODE: Step = STEP_ITEM_CUSTOM_START + 1;

struct ConvertConfig {
    target: Weak<dyn SessionItem>,
    name: String,
    direction: Direction,
    control_port: bool,
}

/// Converter in front of a target item.
///
/// Configuration keys: `target` (item id, required), `name` (required),
/// `direction` (`input` or `output`, default `input`),
/// `enable-control-port`.
pub struct SiConvert {
    base: ItemBase,
    me: Weak<Self>,
    config: RefCell<Option<ConvertConfig>>,
    node: RefCell<Option<Rc<dyn RemoteNode>>>,
    node_ready: Cell<bool>,
    format: RefCell<Option<(AudioFormat, PortMode)>>,
    links: RefCell<BTreeMap<ItemId, Rc<SiStandardLink>>>,
    watcher: RefCell<Option<JoinHandle<()>>>,
}

fn parse_direction(value: &str) -> Option<Direction> {
    match value {
        "input" | "0" => Some(Direction::Input),
        "output" | "1" => Some(Direction::Output),
        _ => None,
    }
}

const fn direction_name(direction: Direction) -> &'static str {
    match direction {
        Direction::Input => "input",
        Direction::Output => "output",
    }
}

impl SiConvert {
    pub const FACTORY_NAME: &'static str = "si-convert";

    /// Create an unconfigured converter registered in `context`.
    #[must_use]
    pub fn new(context: &Rc<SessionContext>) -> Rc<Self> {
        let item = Rc::new_cyclic(|me| Self {
            base: ItemBase::new(context, Self::FACTORY_NAME),
            me: me.clone(),
            config: RefCell::new(None),
            node: RefCell::new(None),
            node_ready: Cell::new(false),
            format: RefCell::new(None),
            links: RefCell::new(BTreeMap::new()),
            watcher: RefCell::new(None),
        });
        let weak = Rc::downgrade(&item) as Weak<dyn SessionItem>;
        context.register(weak);
        item
    }

    /// The item this converter serves, if still alive.
    #[must_use]
    pub fn target(&self) -> Option<Rc<dyn SessionItem>> {
        self.config.borrow().as_ref().and_then(|c| c.target.upgrade())
    }

    #[must_use]
    pub fn direction(&self) -> Option<Direction> {
        self.config.borrow().as_ref().map(|c| c.direction)
    }

    /// Links currently connecting the converter to its target.
    #[must_use]
    pub fn links(&self) -> Vec<Rc<SiStandardLink>> {
        self.links.borrow().values().cloned().collect()
    }

    fn verify_config(&self, transition: &Rc<Transition>) {
        let target = self.target();
        let error = match &target {
            None if self.config.borrow().is_none() => Some(Error::NotConfigured(self.base.id())),
            None => Some(Error::invariant(format!(
                "converter {}: target item is gone",
                self.base.id()
            ))),
            Some(target) if !target.base().is_configured() => Some(Error::invariant(format!(
                "converter {}: target {} is not configured",
                self.base.id(),
                target.base().id()
            ))),
            Some(_) => None,
        };
        if let Some(error) = error {
            transition.return_error(error);
            return;
        }
        transition.advance();
    }

    fn create_node(&self, transition: &Rc<Transition>) {
        let Some(target) = self.target() else {
            transition.return_error(Error::invariant("target item is gone"));
            return;
        };
        let Some(AssociatedResource::Node(target_node)) = target.associated_resource(ResourceKind::Node) else {
            transition.return_error(Error::invariant(format!(
                "target {} has no node",
                target.base().id()
            )));
            return;
        };
        let Some((name, direction, control_port)) = self
            .config
            .borrow()
            .as_ref()
            .map(|c| (c.name.clone(), c.direction, c.control_port))
        else {
            transition.return_error(Error::NotConfigured(self.base.id()));
            return;
        };

        let context = self.base.context();
        let settings = context.settings();
        let mut properties = target_node.properties();
        let path = properties.get(keys::OBJECT_PATH).unwrap_or_default().to_string();
        let node_name = properties.get(keys::NODE_NAME).unwrap_or_default().to_string();
        properties.set(keys::OBJECT_PATH, format!("{path}:{name}"));
        properties.set(keys::NODE_NAME, format!("audioconvert/{node_name}/{name}"));
        properties.set(keys::MEDIA_CLASS, "Audio/Convert");
        properties.set(keys::FACTORY_NAME, "audioconvert");

        let node = match context.remote().create_node(SPA_NODE_FACTORY, properties) {
            Ok(node) => node,
            Err(error) => {
                transition.return_error(error.into());
                return;
            }
        };

        let target_config = target.base().configuration();
        let channels = target_config
            .parse::<u32>("channels")
            .and_then(Result::ok)
            .or_else(|| {
                target_config
                    .parse::<u32>("preferred-n-channels")
                    .and_then(Result::ok)
                    .filter(|n| *n > 0)
            })
            .unwrap_or(settings.convert_channels);
        let format = AudioFormat::dsp(settings.convert_rate, channels);
        tracing::debug!(
            item = self.base.id(),
            node = node.bound_id(),
            channels,
            rate = settings.convert_rate,
            "created converter node"
        );

        let params = [
            Param::PortConfig {
                direction: direction.reverse(),
                mode: PortConfigMode::Dsp,
                control: false,
                monitor: false,
                format: Some(format.clone()),
            },
            Param::PortConfig {
                direction,
                mode: PortConfigMode::Dsp,
                control: control_port,
                monitor: false,
                format: Some(format.clone()),
            },
        ];
        for param in params {
            if let Err(error) = node.set_param(param) {
                transition.return_error(error.into());
                return;
            }
        }

        *self.node.borrow_mut() = Some(Rc::clone(&node));
        *self.format.borrow_mut() = Some((format, PortMode::Dsp));
        self.watch_node_state(&node);

        let me = self.me.clone();
        let transition = Rc::clone(transition);
        tokio::task::spawn_local(async move {
            let result = node.activate(ProxyFeatures::STANDARD).await;
            if transition.is_completed() {
                return;
            }
            match (result, me.upgrade()) {
                (Ok(()), Some(convert)) => {
                    convert.node_ready.set(true);
                    transition.advance();
                    convert.sync_node_state();
                }
                (Ok(()), None) => transition.return_error(Error::SourceGone),
                (Err(error), _) => transition.return_error(error.into()),
            }
        });
    }

    fn watch_node_state(&self, node: &Rc<dyn RemoteNode>) {
        let receiver = node.subscribe_state();
        let me = self.me.clone();
        let handle = tokio::task::spawn_local(async move {
            let changes = BroadcastStream::new(receiver).filter_map(|r| async move { r.ok() });
            let mut changes = std::pin::pin!(changes);
            if let Some(convert) = me.upgrade() {
                convert.sync_node_state();
            }
            while let Some(change) = changes.next().await {
                let Some(convert) = me.upgrade() else {
                    break;
                };
                convert.on_node_state_changed(change);
            }
        });
        if let Some(previous) = self.watcher.replace(Some(handle)) {
            previous.abort();
        }
    }

    fn on_node_state_changed(&self, change: NodeStateChange) {
        tracing::trace!(item = self.base.id(), node = change.node_id, state = %change.new, "converter node state");
        match change.new {
            NodeState::Running => self.ensure_link(),
            NodeState::Idle => self.clear_links(),
            _ => {}
        }
    }

    /// Catch up with the run state the node is in right now.
    fn sync_node_state(&self) {
        let state = self.node.borrow().as_ref().map(|node| node.state());
        if state == Some(NodeState::Running) {
            self.ensure_link();
        }
    }

    fn ensure_link(&self) {
        if !self.links.borrow().is_empty() {
            return;
        }
        // linking waits until activation completes
        if !self.base.features().contains(ItemFeatures::ACTIVE) {
            tracing::debug!(item = self.base.id(), "converter node running before activation");
            return;
        }
        let (Some(target), Some(me)) = (self.target(), self.me.upgrade()) else {
            tracing::warn!(item = self.base.id(), "converter running without a target");
            return;
        };
        let me: Rc<dyn SessionItem> = me;
        let (output, input) = match self.direction() {
            Some(Direction::Output) => (me, target),
            _ => (target, me),
        };

        let link = SiStandardLink::new(self.base.context());
        let properties = Properties::new()
            .with("out.item", output.base().id().to_string())
            .with("in.item", input.base().id().to_string());
        if let Err(error) = link.configure(properties) {
            tracing::warn!(item = self.base.id(), %error, "cannot configure converter link");
            return;
        }
        let link_id = link.base().id();
        self.links.borrow_mut().insert(link_id, Rc::clone(&link));
        tracing::debug!(item = self.base.id(), link = link_id, "linking converter");

        let me = self.me.clone();
        let link: Rc<dyn SessionItem> = link;
        activate(&link, ItemFeatures::ACTIVE, move |result| {
            if let Err(error) = result {
                tracing::warn!(link = link_id, %error, "converter link failed");
                if let Some(convert) = me.upgrade() {
                    convert.links.borrow_mut().remove(&link_id);
                }
            }
        });
    }

    fn clear_links(&self) {
        let links = std::mem::take(&mut *self.links.borrow_mut());
        for link in links.values() {
            deactivate(link.as_ref(), ItemFeatures::ACTIVE);
        }
    }

    fn teardown(&self) {
        if let Some(watcher) = self.watcher.borrow_mut().take() {
            watcher.abort();
        }
        self.clear_links();
        self.node.borrow_mut().take();
        self.format.borrow_mut().take();
        self.node_ready.set(false);
    }
}

impl Drop for SiConvert {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
    }
}

impl Transitionable for SiConvert {
    fn next_step(&self, transition: &Rc<Transition>, step: Step) -> Step {
        match step {
            STEP_NONE => {
                if transition.wanted().contains(ItemFeatures::EXPORTED) {
                    transition.attach_error(Error::invariant("si-convert items cannot be exported"));
                    STEP_ERROR
                } else if self.base.features().contains(ItemFeatures::ACTIVE) {
                    STEP_NONE
                } else {
                    STEP_VERIFY_CONFIG
                }
            }
            STEP_VERIFY_CONFIG => STEP_CREATE_NODE,
            STEP_CREATE_NODE if self.node_ready.get() => STEP_NONE,
            STEP_CREATE_NODE => STEP_CREATE_NODE,
            _ => STEP_ERROR,
        }
    }

    fn execute_step(&self, transition: &Rc<Transition>, step: Step) {
        match step {
            STEP_VERIFY_CONFIG => self.verify_config(transition),
            STEP_CREATE_NODE => self.create_node(transition),
            _ => transition.return_error(Error::invariant(format!("unexpected step {step}"))),
        }
    }

    fn rollback(&self) {
        // a failed request on top of ACTIVE keeps the node
        if !self.base.features().contains(ItemFeatures::ACTIVE) {
            self.teardown();
        }
    }
}

impl SessionItem for SiConvert {
    fn base(&self) -> &ItemBase {
        &self.base
    }

    fn configure(&self, mut properties: Properties) -> Result<(), ConfigError> {
        self.base.ensure_configurable()?;

        let target_id = match properties.parse::<ItemId>("target") {
            Some(Ok(id)) => id,
            Some(Err(_)) => {
                return Err(ConfigError::invalid("target", properties.get("target").unwrap_or_default()));
            }
            None => return Err(ConfigError::Missing("target")),
        };
        let target = self
            .base
            .context()
            .lookup(target_id)
            .ok_or_else(|| ConfigError::invalid("target", format!("{target_id} does not exist")))?;
        let name = properties
            .get("name")
            .ok_or(ConfigError::Missing("name"))?
            .to_string();
        let direction = match properties.get("direction") {
            None => Direction::Input,
            Some(value) => parse_direction(value).ok_or_else(|| ConfigError::invalid("direction", value))?,
        };
        let control_port = properties.get_bool("enable-control-port");

        properties.set("direction", direction_name(direction));
        properties.set("enable-control-port", u8::from(control_port).to_string());
        properties.set(keys::ITEM_FACTORY_NAME, Self::FACTORY_NAME);

        *self.config.borrow_mut() = Some(ConvertConfig {
            target: Rc::downgrade(&target),
            name,
            direction,
            control_port,
        });
        self.base.set_configuration(properties);
        Ok(())
    }

    fn associated_resource(&self, kind: ResourceKind) -> Option<AssociatedResource> {
        match kind {
            ResourceKind::Node => self.node.borrow().clone().map(AssociatedResource::Node),
            ResourceKind::Endpoint => None,
        }
    }

    fn enable_active(&self, transition: &Rc<Transition>) {
        transition.return_error(Error::invariant("converter activation runs its own steps"));
    }

    fn disable_active(&self) {
        self.teardown();
    }

    fn reset_config(&self) {
        self.config.borrow_mut().take();
    }

    fn linkable(&self) -> Option<&dyn Linkable> {
        Some(self)
    }
}

impl Linkable for SiConvert {
    fn ports(&self, context: Option<&str>) -> Vec<PortRef> {
        let Some(direction) = self.direction() else {
            return Vec::new();
        };
        let direction = match context {
            None => direction,
            Some(CONTEXT_REVERSE) => direction.reverse(),
            Some(_) => return Vec::new(),
        };
        self.node
            .borrow()
            .as_ref()
            .map(|node| select_ports(node.bound_id(), &node.ports(), direction, false))
            .unwrap_or_default()
    }

    fn adapter(&self) -> Option<&dyn Adapter> {
        Some(self)
    }
}

impl Adapter for SiConvert {
    fn ports_format(&self) -> Option<(AudioFormat, PortMode)> {
        self.format.borrow().clone()
    }

    fn set_ports_format(&self, format: Option<AudioFormat>, mode: PortMode, callback: FormatCallback) {
        let node = self.node.borrow().clone();
        let config = self
            .config
            .borrow()
            .as_ref()
            .map(|c| (c.direction, c.control_port));
        let (Some(node), Some((direction, control))) = (node, config) else {
            callback(Err(Error::NotConfigured(self.base.id())));
            return;
        };
        let Some(format) = format.or_else(|| self.ports_format().map(|(format, _)| format)) else {
            callback(Err(Error::invariant("converter has no format to apply")));
            return;
        };
        let param = Param::PortConfig {
            direction,
            mode: mode.into(),
            control,
            monitor: false,
            format: (mode != PortMode::Passthrough).then(|| format.clone()),
        };
        tracing::debug!(item = self.base.id(), ?mode, channels = format.channels, "setting converter ports format");

        let me = self.me.clone();
        configure_node_ports(node, param, move |result| {
            if result.is_ok() {
                if let Some(convert) = me.upgrade() {
                    *convert.format.borrow_mut() = Some((format, mode));
                }
            }
            callback(result);
        });
    }
}

#[cfg(test)]
mod tests {
    use media_session_core::{
        RemoteObject, SessionSettings,
        remote::{AudioChannel, MemoryGraph},
    };
    use tokio::task::LocalSet;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::{
        SiAdapter, activate_async, reset,
        testing::{active_adapter, context, settle},
    };

    async fn device_sink(graph: &MemoryGraph, context: &Rc<SessionContext>) -> Rc<SiAdapter> {
        active_adapter(
            context,
            graph,
            "Audio/Sink",
            Properties::new()
                .with(keys::ITEM_NODE_TYPE, "device")
                .with("name", "speakers"),
        )
        .await
    }

    fn convert_props(target: &SiAdapter, direction: &str) -> Properties {
        Properties::new()
            .with("target", target.base().id().to_string())
            .with("name", "playback")
            .with("direction", direction)
    }

    #[tokio::test]
    async fn test_configure_and_reset() {
        LocalSet::new()
            .run_until(async {
                let graph = MemoryGraph::new();
                let context = context(&graph, SessionSettings::default());
                let target = device_sink(&graph, &context).await;
                let convert = SiConvert::new(&context);

                assert_eq!(convert.configure(Properties::new()), Err(ConfigError::Missing("target")));
                assert_err!(convert.configure(Properties::new().with("target", "4242").with("name", "x")));
                assert_eq!(
                    convert.configure(Properties::new().with("target", target.base().id().to_string())),
                    Err(ConfigError::Missing("name"))
                );
                assert_err!(convert.configure(convert_props(&target, "sideways")));
                assert!(!convert.base().is_configured());

                assert_ok!(convert.configure(
                    Properties::new()
                        .with("target", target.base().id().to_string())
                        .with("name", "playback")
                ));
                let props = convert.base().configuration();
                assert_eq!(props.get("direction"), Some("input"));
                assert_eq!(props.get("enable-control-port"), Some("0"));
                assert_eq!(props.get(keys::ITEM_FACTORY_NAME), Some("si-convert"));
                assert_eq!(convert.direction(), Some(Direction::Input));

                reset(convert.as_ref());
                assert!(!convert.base().is_configured());
                assert!(convert.target().is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_unconfigured_target_fails_verification() {
        LocalSet::new()
            .run_until(async {
                let graph = MemoryGraph::new();
                let context = context(&graph, SessionSettings::default());
                let target = device_sink(&graph, &context).await;
                let convert = SiConvert::new(&context);
                assert_ok!(convert.configure(convert_props(&target, "output")));
                reset(target.as_ref());

                let item: Rc<dyn SessionItem> = convert.clone();
                let result = activate_async(&item, ItemFeatures::ACTIVE).await;
                assert!(matches!(result, Err(Error::Invariant(_))));
                assert!(convert.associated_resource(ResourceKind::Node).is_none());
                assert!(!convert.base().features().contains(ItemFeatures::ACTIVE));
            })
            .await;
    }

    #[tokio::test]
    async fn test_activation_creates_converter_node() {
        LocalSet::new()
            .run_until(async {
                let graph = MemoryGraph::new();
                let context = context(&graph, SessionSettings::default());
                let target = device_sink(&graph, &context).await;
                let convert = SiConvert::new(&context);
                assert_ok!(convert.configure(
                    convert_props(&target, "output").with("enable-control-port", "1")
                ));

                let item: Rc<dyn SessionItem> = convert.clone();
                assert_ok!(activate_async(&item, ItemFeatures::ACTIVE).await);
                assert_eq!(convert.base().features(), ItemFeatures::CONFIGURED | ItemFeatures::ACTIVE);

                let Some(AssociatedResource::Node(node)) = convert.associated_resource(ResourceKind::Node) else {
                    panic!("converter has no node");
                };
                let props = node.properties();
                assert_eq!(props.get(keys::MEDIA_CLASS), Some("Audio/Convert"));
                assert_eq!(props.get(keys::FACTORY_NAME), Some("audioconvert"));
                assert_eq!(props.get(keys::NODE_NAME), Some("audioconvert/Audio/Sink node/playback"));
                assert_eq!(props.get(keys::OBJECT_PATH), Some(":playback"));
                assert_eq!(node.features(), ProxyFeatures::STANDARD);

                let params = graph.node(node.bound_id()).unwrap().params();
                assert_eq!(params.len(), 2);
                assert!(matches!(
                    &params[0],
                    Param::PortConfig { direction: Direction::Input, mode: PortConfigMode::Dsp, control: false, .. }
                ));
                assert!(matches!(
                    &params[1],
                    Param::PortConfig { direction: Direction::Output, mode: PortConfigMode::Dsp, control: true, .. }
                ));

                let expected = AudioFormat::dsp(48_000, 2);
                assert_eq!(convert.ports_format(), Some((expected, PortMode::Dsp)));
                let own = convert.ports(None);
                assert_eq!(own.len(), 2);
                assert_eq!(own[1].channel, AudioChannel::FrontRight);
                assert_eq!(convert.ports(Some(CONTEXT_REVERSE)).len(), 2);
                assert!(convert.ports(Some("monitor")).is_empty());

                // exporting is not supported
                let error = activate_async(&item, ItemFeatures::EXPORTED).await.unwrap_err();
                assert_eq!(error, Error::invariant("si-convert items cannot be exported"));
                assert!(convert.associated_resource(ResourceKind::Node).is_some());

                deactivate(convert.as_ref(), ItemFeatures::ACTIVE);
                assert!(convert.associated_resource(ResourceKind::Node).is_none());
                assert!(convert.ports(None).is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn test_dropped_target_fails_activation() {
        LocalSet::new()
            .run_until(async {
                let graph = MemoryGraph::new();
                let context = context(&graph, SessionSettings::default());
                let target = device_sink(&graph, &context).await;
                let convert = SiConvert::new(&context);
                assert_ok!(convert.configure(convert_props(&target, "output")));
                // the target goes away between configuration and activation
                drop(target);

                let item: Rc<dyn SessionItem> = convert.clone();
                assert_err!(activate_async(&item, ItemFeatures::ACTIVE).await);
                assert!(convert.ports_format().is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_node_running_before_activation_completes_is_linked() {
        LocalSet::new()
            .run_until(async {
                let graph = MemoryGraph::new();
                let context = context(&graph, SessionSettings::default());
                let target = device_sink(&graph, &context).await;
                let convert = SiConvert::new(&context);
                assert_ok!(convert.configure(convert_props(&target, "output")));

                let item: Rc<dyn SessionItem> = convert.clone();
                let (tx, rx) = tokio::sync::oneshot::channel();
                activate(&item, ItemFeatures::ACTIVE, move |result| {
                    let _ = tx.send(result);
                });
                let Some(AssociatedResource::Node(node)) = convert.associated_resource(ResourceKind::Node) else {
                    panic!("converter has no node");
                };
                assert!(!convert.base().features().contains(ItemFeatures::ACTIVE));
                let node = graph.node(node.bound_id()).unwrap();
                node.set_state(NodeState::Running);

                assert_ok!(rx.await.unwrap());
                settle().await;
                let links = convert.links();
                assert_eq!(links.len(), 1);
                assert!(links[0].base().features().contains(ItemFeatures::ACTIVE));
                assert_eq!(graph.link_count(), 2);
                assert!(graph.links().iter().all(|l| l.output_node == node.bound_id()));
            })
            .await;
    }

    #[tokio::test]
    async fn test_running_node_links_to_target() {
        LocalSet::new()
            .run_until(async {
                let graph = MemoryGraph::new();
                let context = context(&graph, SessionSettings::default());
                let target = device_sink(&graph, &context).await;
                let convert = SiConvert::new(&context);
                assert_ok!(convert.configure(convert_props(&target, "output")));
                let item: Rc<dyn SessionItem> = convert.clone();
                assert_ok!(activate_async(&item, ItemFeatures::ACTIVE).await);

                let Some(AssociatedResource::Node(node)) = convert.associated_resource(ResourceKind::Node) else {
                    panic!("converter has no node");
                };
                let node = graph.node(node.bound_id()).unwrap();

                node.set_state(NodeState::Running);
                settle().await;
                let links = convert.links();
                assert_eq!(links.len(), 1);
                assert!(links[0].base().features().contains(ItemFeatures::ACTIVE));
                assert_eq!(links[0].out_item().unwrap().base().id(), convert.base().id());
                assert_eq!(links[0].in_item().unwrap().base().id(), target.base().id());
                assert_eq!(graph.link_count(), 2);
                assert!(graph.links().iter().all(|l| l.output_node == node.bound_id()));
                // the device followed the converter's format
                assert_eq!(target.ports_format(), convert.ports_format());

                node.set_state(NodeState::Idle);
                settle().await;
                assert!(convert.links().is_empty());
                assert_eq!(graph.link_count(), 0);

                node.set_state(NodeState::Running);
                settle().await;
                assert_eq!(convert.links().len(), 1);
                assert_eq!(graph.link_count(), 2);

                deactivate(convert.as_ref(), ItemFeatures::ACTIVE);
                assert_eq!(graph.link_count(), 0);
            })
            .await;
    }
}
