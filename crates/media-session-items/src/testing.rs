//! Helpers shared by the item tests.

use std::rc::{Rc, Weak};

use media_session_core::{
    ConfigError, ItemFeatures, Properties, RemoteNode, RemoteObject, SessionSettings, Transition,
    Transitionable,
    properties::keys,
    remote::{AudioChannel, Direction, MemoryGraph},
    transition::Step,
};

use crate::{
    Arbiter, SessionContext, SiAdapter, SiStandardLink, activate_async,
    item::{ItemBase, SessionItem, feature_execute_step, feature_next_step},
    linkable::{Linkable, PortRef, resolve_context, select_ports},
};

pub(crate) fn context(graph: &MemoryGraph, settings: SessionSettings) -> Rc<SessionContext> {
    SessionContext::new(Rc::new(graph.clone()), settings)
}

/// Let spawned local tasks run to completion.
pub(crate) async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Linkable item over a node with fixed ports, without format negotiation.
pub(crate) struct PortsItem {
    base: ItemBase,
    node: Rc<dyn RemoteNode>,
    direction: Direction,
    exclusive: bool,
}

impl PortsItem {
    pub(crate) fn configured(
        context: &Rc<SessionContext>,
        graph: &MemoryGraph,
        ports: &[(Direction, AudioChannel)],
        exclusive: bool,
    ) -> Rc<Self> {
        let direction = ports.first().map_or(Direction::Output, |(d, _)| *d);
        let node = graph.add_node(Properties::new().with(keys::NODE_NAME, "fixed"), ports);
        let item = Rc::new(Self {
            base: ItemBase::new(context, "fixed-ports"),
            node,
            direction,
            exclusive,
        });
        let weak: Weak<dyn SessionItem> = Rc::downgrade(&item) as Weak<dyn SessionItem>;
        context.register(weak);
        item.configure(Properties::new()).unwrap();
        item
    }

    pub(crate) async fn active(
        context: &Rc<SessionContext>,
        graph: &MemoryGraph,
        ports: &[(Direction, AudioChannel)],
        exclusive: bool,
    ) -> Rc<Self> {
        let item = Self::configured(context, graph, ports, exclusive);
        let dyn_item: Rc<dyn SessionItem> = item.clone();
        activate_async(&dyn_item, ItemFeatures::ACTIVE).await.unwrap();
        item
    }

    pub(crate) fn node_id(&self) -> u32 {
        self.node.bound_id()
    }
}

impl Transitionable for PortsItem {
    fn next_step(&self, transition: &Rc<Transition>, step: Step) -> Step {
        feature_next_step(self, transition, step)
    }

    fn execute_step(&self, transition: &Rc<Transition>, step: Step) {
        feature_execute_step(self, transition, step);
    }
}

impl SessionItem for PortsItem {
    fn base(&self) -> &ItemBase {
        &self.base
    }

    fn configure(&self, properties: Properties) -> Result<(), ConfigError> {
        self.base.ensure_configurable()?;
        self.base.set_configuration(properties);
        Ok(())
    }

    fn enable_active(&self, _transition: &Rc<Transition>) {
        self.base.update_features(ItemFeatures::ACTIVE, ItemFeatures::empty());
    }

    fn disable_active(&self) {}

    fn linkable(&self) -> Option<&dyn Linkable> {
        Some(self)
    }
}

impl Linkable for PortsItem {
    fn ports(&self, context: Option<&str>) -> Vec<PortRef> {
        resolve_context(self.direction, context)
            .map(|(direction, monitor)| {
                select_ports(self.node.bound_id(), &self.node.ports(), direction, monitor)
            })
            .unwrap_or_default()
    }

    fn acquisition(&self) -> Option<Rc<Arbiter>> {
        self.exclusive.then(|| Rc::clone(self.base.context().arbiter()))
    }
}

/// Configure `link` between two items, adding `extra` properties.
pub(crate) fn configure_link<O, I>(
    link: &SiStandardLink,
    output: &Rc<O>,
    input: &Rc<I>,
    extra: Properties,
) -> Result<(), ConfigError>
where
    O: SessionItem + ?Sized,
    I: SessionItem + ?Sized,
{
    let mut properties = Properties::new()
        .with("out.item", output.base().id().to_string())
        .with("in.item", input.base().id().to_string());
    properties.update(&extra);
    link.configure(properties)
}

/// Active adapter over a fresh stereo node of `media_class`.
pub(crate) async fn active_adapter(
    context: &Rc<SessionContext>,
    graph: &MemoryGraph,
    media_class: &str,
    extra: Properties,
) -> Rc<SiAdapter> {
    let direction = if media_class.contains("Sink") || media_class.contains("Input") {
        Direction::Input
    } else {
        Direction::Output
    };
    let node = graph.add_node(
        Properties::new()
            .with(keys::NODE_NAME, format!("{media_class} node"))
            .with(keys::MEDIA_CLASS, media_class),
        &[
            (direction, AudioChannel::FrontLeft),
            (direction, AudioChannel::FrontRight),
        ],
    );
    let adapter = SiAdapter::new(context);
    let mut properties = Properties::new().with("node", node.bound_id().to_string());
    properties.update(&extra);
    adapter.configure(properties).unwrap();
    let item: Rc<dyn SessionItem> = adapter.clone();
    activate_async(&item, ItemFeatures::ACTIVE).await.unwrap();
    adapter
}
