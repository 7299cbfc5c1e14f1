//! Standard link item: connects the ports of two linkable items.
//!
//! Activation acquires the endpoints that require exclusive access,
//! negotiates a common port format when both endpoints are adapters, then
//! creates one graph link per matched port pair. The item becomes ACTIVE
//! once every graph link is up; any failure along the way fails the whole
//! activation and tears everything down again.

use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

use media_session_core::{
    ConfigError, Error, ItemFeatures, Properties, ProxyFeatures, RemoteError, RemoteObject,
    Transition, Transitionable,
    properties::{keys, parse_bool},
    remote::{AudioChannel, Direction, LINK_FACTORY},
    transition::Step,
};

use crate::{
    AcquisitionHolder, Arbiter, SessionContext,
    item::{ItemBase, ItemId, SessionItem, deactivate, feature_execute_step, feature_next_step},
    linkable::{Adapter, FormatCallback, Linkable, PortMode, PortRef, dont_remix, formats_compatible},
    policy::choose_main_side,
};

#[derive(Default)]
struct LinkConfig {
    out_item: Option<Weak<dyn SessionItem>>,
    in_item: Option<Weak<dyn SessionItem>>,
    out_context: Option<String>,
    in_context: Option<String>,
    passive: bool,
}

/// Link between an output item and an input item.
///
/// Configuration keys: `out.item`, `in.item` (ids of active linkable
/// items, required), `out.item.port.context`, `in.item.port.context`,
/// `passive`.
pub struct SiStandardLink {
    base: ItemBase,
    me: Weak<Self>,
    config: RefCell<LinkConfig>,
    node_links: RefCell<Vec<Rc<dyn RemoteObject>>>,
    pending_ops: Cell<u32>,
}

/// Whether an output channel may feed an input channel.
#[must_use]
pub fn channels_match(output: AudioChannel, input: AudioChannel) -> bool {
    output == input
        || output == AudioChannel::Unknown
        || input == AudioChannel::Unknown
        || input == AudioChannel::Mono
}

/// Pair output ports with input ports.
///
/// Each output takes the first remaining input it matches; matched inputs
/// leave the pool. With `link_all` every output is paired with every input.
#[must_use]
pub fn match_ports(outputs: &[PortRef], inputs: &[PortRef], link_all: bool) -> Vec<(PortRef, PortRef)> {
    if link_all {
        return outputs
            .iter()
            .flat_map(|output| inputs.iter().map(move |input| (*output, *input)))
            .collect();
    }

    let mut pool = inputs.to_vec();
    let mut pairs = Vec::new();
    for output in outputs {
        if let Some(index) = pool
            .iter()
            .position(|input| channels_match(output.channel, input.channel))
        {
            pairs.push((*output, pool.remove(index)));
        }
    }
    pairs
}

fn parse_passive(value: &str) -> Option<bool> {
    match value {
        "true" | "false" => Some(value == "true"),
        _ => value.parse::<u32>().ok().map(|_| parse_bool(value)),
    }
}

impl SiStandardLink {
    pub const FACTORY_NAME: &'static str = "si-standard-link";

    /// Create an unconfigured link registered in `context`.
    #[must_use]
    pub fn new(context: &Rc<SessionContext>) -> Rc<Self> {
        let item = Rc::new_cyclic(|me| Self {
            base: ItemBase::new(context, Self::FACTORY_NAME),
            me: me.clone(),
            config: RefCell::new(LinkConfig::default()),
            node_links: RefCell::new(Vec::new()),
            pending_ops: Cell::new(0),
        });
        let weak = Rc::downgrade(&item) as Weak<dyn SessionItem>;
        context.register(weak);
        item
    }

    /// Output side, if still alive.
    #[must_use]
    pub fn out_item(&self) -> Option<Rc<dyn SessionItem>> {
        self.config.borrow().out_item.as_ref().and_then(Weak::upgrade)
    }

    /// Input side, if still alive.
    #[must_use]
    pub fn in_item(&self) -> Option<Rc<dyn SessionItem>> {
        self.config.borrow().in_item.as_ref().and_then(Weak::upgrade)
    }

    /// Extra information published with the link. Currently empty.
    #[must_use]
    pub fn registration_info(&self) -> Properties {
        Properties::new()
    }

    /// Ids of the graph links currently held.
    #[must_use]
    pub fn node_link_ids(&self) -> Vec<u32> {
        self.node_links.borrow().iter().map(|link| link.bound_id()).collect()
    }

    fn endpoints(&self) -> Option<(Rc<dyn SessionItem>, Rc<dyn SessionItem>)> {
        Some((self.out_item()?, self.in_item()?))
    }

    fn resolve_endpoint(&self, properties: &Properties, key: &'static str) -> Result<Rc<dyn SessionItem>, ConfigError> {
        let id = match properties.parse::<ItemId>(key) {
            Some(Ok(id)) => id,
            Some(Err(_)) => {
                return Err(ConfigError::invalid(key, properties.get(key).unwrap_or_default()));
            }
            None => return Err(ConfigError::Missing(key)),
        };
        let item = self
            .base
            .context()
            .lookup(id)
            .ok_or_else(|| ConfigError::invalid(key, format!("{id} does not exist")))?;
        if item.linkable().is_none() {
            return Err(ConfigError::invalid(key, format!("{id} is not linkable")));
        }
        if !item.base().features().contains(ItemFeatures::ACTIVE) {
            return Err(ConfigError::invalid(key, format!("{id} is not active")));
        }
        Ok(item)
    }

    fn invalid_endpoints(&self, transition: &Rc<Transition>) {
        transition.return_error(Error::invariant(format!(
            "link {}: in/out items are not valid anymore",
            self.base.id()
        )));
    }

    fn on_item_acquired(&self, transition: &Rc<Transition>, result: Result<(), Error>) {
        if transition.is_completed() {
            tracing::debug!(link = self.base.id(), "dropping acquisition result of finished activation");
            return;
        }
        if let Err(error) = result {
            transition.return_error(error);
            return;
        }
        let pending = self.pending_ops.get().saturating_sub(1);
        self.pending_ops.set(pending);
        if pending == 0 {
            self.do_link(transition);
        }
    }

    fn do_link(&self, transition: &Rc<Transition>) {
        let Some((out_item, in_item)) = self.endpoints() else {
            self.invalid_endpoints(transition);
            return;
        };
        let out_adapter = out_item.linkable().and_then(Linkable::adapter);
        let in_adapter = in_item.linkable().and_then(Linkable::adapter);

        match (out_adapter, in_adapter) {
            (Some(out_adapter), Some(in_adapter)) => self.configure_and_link_adapters(
                transition,
                (out_item.base(), out_adapter),
                (in_item.base(), in_adapter),
            ),
            (None, None) => self.create_links(transition),
            _ => transition.return_error(Error::invariant(
                "Adapters cannot be linked with non-adapters",
            )),
        }
    }

    fn configure_and_link_adapters(
        &self,
        transition: &Rc<Transition>,
        output: (&ItemBase, &dyn Adapter),
        input: (&ItemBase, &dyn Adapter),
    ) {
        let out_props = output.0.configuration();
        let in_props = input.0.configuration();
        let main_side = choose_main_side(self.base.context().policy(), &out_props, &in_props);
        let (main, main_props, other, other_props) = match main_side {
            Direction::Output => (output.1, &out_props, input.1, &in_props),
            Direction::Input => (input.1, &in_props, output.1, &out_props),
        };
        tracing::debug!(link = self.base.id(), main = %main_side, "negotiating port formats");

        let main_format = main.ports_format();
        let other_format = other.ports_format();
        let compatible = match (&main_format, &other_format) {
            (Some(a), Some(b)) => formats_compatible(a, b),
            _ => false,
        };
        if dont_remix(other_props) || compatible {
            self.create_links(transition);
            return;
        }

        if let Some((format, mode)) = main_format {
            other.set_ports_format(Some(format), mode.follower(), self.on_adapters_ready(transition));
        } else if let Some((format, mode)) = other_format {
            main.set_ports_format(Some(format), mode.follower(), self.on_adapters_ready(transition));
        } else {
            let mode = if main_props.get_bool(keys::ITEM_FEATURES_NO_DSP) {
                PortMode::Passthrough
            } else {
                PortMode::Dsp
            };
            let me = self.me.clone();
            let transition = Rc::clone(transition);
            main.set_ports_format(
                None,
                mode,
                Box::new(move |result| {
                    if let Some(link) = me.upgrade() {
                        link.on_main_adapter_ready(&transition, main_side, result);
                    }
                }),
            );
        }
    }

    fn on_adapters_ready(&self, transition: &Rc<Transition>) -> FormatCallback {
        let me = self.me.clone();
        let transition = Rc::clone(transition);
        Box::new(move |result| {
            let Some(link) = me.upgrade() else {
                return;
            };
            if transition.is_completed() {
                return;
            }
            match result {
                Ok(()) => link.create_links(&transition),
                Err(error) => transition.return_error(error),
            }
        })
    }

    /// The main side settled on its own format; impose it on the other side.
    fn on_main_adapter_ready(&self, transition: &Rc<Transition>, main_side: Direction, result: Result<(), Error>) {
        if transition.is_completed() {
            return;
        }
        if let Err(error) = result {
            transition.return_error(error);
            return;
        }
        let Some((out_item, in_item)) = self.endpoints() else {
            self.invalid_endpoints(transition);
            return;
        };
        let (main_item, other_item) = match main_side {
            Direction::Output => (&out_item, &in_item),
            Direction::Input => (&in_item, &out_item),
        };
        let main = main_item.linkable().and_then(Linkable::adapter);
        let other = other_item.linkable().and_then(Linkable::adapter);
        let (Some(main), Some(other)) = (main, other) else {
            self.invalid_endpoints(transition);
            return;
        };
        let Some((format, mode)) = main.ports_format() else {
            transition.return_error(Error::invariant("main adapter did not settle on a format"));
            return;
        };
        other.set_ports_format(Some(format), mode.follower(), self.on_adapters_ready(transition));
    }

    fn create_links(&self, transition: &Rc<Transition>) {
        let Some((out_item, in_item)) = self.endpoints() else {
            self.invalid_endpoints(transition);
            return;
        };
        let (out_context, in_context, passive) = {
            let config = self.config.borrow();
            (config.out_context.clone(), config.in_context.clone(), config.passive)
        };
        let out_ports = out_item
            .linkable()
            .map(|l| l.ports(out_context.as_deref()))
            .unwrap_or_default();
        let in_ports = in_item
            .linkable()
            .map(|l| l.ports(in_context.as_deref()))
            .unwrap_or_default();

        let context = self.base.context();
        let link_all = (context.policy().link_all)(&out_ports, &in_ports);
        let pairs = match_ports(&out_ports, &in_ports, link_all);
        if pairs.is_empty() {
            transition.return_error(Error::invariant("Failed to create links because of wrong ports"));
            return;
        }

        self.pending_ops.set(0);
        self.node_links.borrow_mut().clear();
        for (output, input) in pairs {
            let mut properties = Properties::new()
                .with(keys::LINK_OUTPUT_NODE, output.node_id.to_string())
                .with(keys::LINK_OUTPUT_PORT, output.port_id.to_string())
                .with(keys::LINK_INPUT_NODE, input.node_id.to_string())
                .with(keys::LINK_INPUT_PORT, input.port_id.to_string());
            if passive {
                properties.set(keys::LINK_PASSIVE, "true");
            }
            tracing::debug!(
                link = self.base.id(),
                "create graph link: {}:{} ({}) -> {}:{} ({})",
                output.node_id,
                output.port_id,
                output.channel,
                input.node_id,
                input.port_id,
                input.channel
            );

            let node_link = match context.remote().create_link(LINK_FACTORY, properties) {
                Ok(node_link) => node_link,
                Err(error) => {
                    transition.return_error(error.into());
                    return;
                }
            };
            self.node_links.borrow_mut().push(Rc::clone(&node_link));
            self.pending_ops.set(self.pending_ops.get() + 1);

            let me = self.me.clone();
            let transition = Rc::clone(transition);
            tokio::task::spawn_local(async move {
                let result = node_link.activate(ProxyFeatures::MINIMAL).await;
                drop(node_link);
                if let Some(link) = me.upgrade() {
                    link.on_link_activated(&transition, result);
                }
            });
        }
    }

    fn on_link_activated(&self, transition: &Rc<Transition>, result: Result<(), RemoteError>) {
        if transition.is_completed() {
            tracing::debug!(link = self.base.id(), "dropping link result of finished activation");
            return;
        }
        if let Err(error) = result {
            tracing::warn!(link = self.base.id(), %error, "graph link failed");
            transition.return_error(error.into());
            return;
        }
        let pending = self.pending_ops.get().saturating_sub(1);
        self.pending_ops.set(pending);
        if pending == 0 {
            self.base.update_features(ItemFeatures::ACTIVE, ItemFeatures::empty());
        }
    }

    /// Release both endpoints and drop every graph link.
    fn teardown(&self) {
        let holder = self.base.id();
        for item in [self.out_item(), self.in_item()].into_iter().flatten() {
            if let Some(arbiter) = item.linkable().and_then(Linkable::acquisition) {
                arbiter.release(holder, item.base().id());
            }
        }
        let node_links = std::mem::take(&mut *self.node_links.borrow_mut());
        if !node_links.is_empty() {
            tracing::debug!(link = holder, count = node_links.len(), "dropping graph links");
        }
        drop(node_links);
        self.pending_ops.set(0);
    }
}

impl Transitionable for SiStandardLink {
    fn next_step(&self, transition: &Rc<Transition>, step: Step) -> Step {
        feature_next_step(self, transition, step)
    }

    fn execute_step(&self, transition: &Rc<Transition>, step: Step) {
        feature_execute_step(self, transition, step);
    }

    fn rollback(&self) {
        // a failed request on top of ACTIVE keeps the links and grants
        if !self.base.features().contains(ItemFeatures::ACTIVE) {
            self.teardown();
        }
    }
}

impl SessionItem for SiStandardLink {
    fn base(&self) -> &ItemBase {
        &self.base
    }

    fn configure(&self, mut properties: Properties) -> Result<(), ConfigError> {
        self.base.ensure_configurable()?;

        let out_item = self.resolve_endpoint(&properties, "out.item")?;
        let in_item = self.resolve_endpoint(&properties, "in.item")?;
        let passive = match properties.get("passive") {
            None => false,
            Some(value) => parse_passive(value).ok_or_else(|| ConfigError::invalid("passive", value))?,
        };

        properties.set("out.item.id", out_item.base().id().to_string());
        properties.set("in.item.id", in_item.base().id().to_string());
        properties.set("passive", u8::from(passive).to_string());
        properties.set(keys::ITEM_FACTORY_NAME, Self::FACTORY_NAME);

        *self.config.borrow_mut() = LinkConfig {
            out_item: Some(Rc::downgrade(&out_item)),
            in_item: Some(Rc::downgrade(&in_item)),
            out_context: properties.get("out.item.port.context").map(str::to_owned),
            in_context: properties.get("in.item.port.context").map(str::to_owned),
            passive,
        };
        self.base.set_configuration(properties);
        Ok(())
    }

    fn enable_active(&self, transition: &Rc<Transition>) {
        let Some((out_item, in_item)) = self.endpoints() else {
            self.invalid_endpoints(transition);
            return;
        };
        let Some(holder) = self.me.upgrade() else {
            transition.return_error(Error::SourceGone);
            return;
        };

        let acquisitions: Vec<(Rc<Arbiter>, ItemId)> = [&out_item, &in_item]
            .into_iter()
            .filter_map(|item| {
                let arbiter = item.linkable()?.acquisition()?;
                Some((arbiter, item.base().id()))
            })
            .collect();
        if acquisitions.is_empty() {
            self.pending_ops.set(0);
            self.do_link(transition);
            return;
        }

        self.pending_ops.set(u32::try_from(acquisitions.len()).unwrap_or(u32::MAX));
        let holder: Rc<dyn AcquisitionHolder> = holder;
        for (arbiter, resource) in acquisitions {
            tracing::debug!(link = self.base.id(), resource, "acquiring");
            let me = self.me.clone();
            let transition = Rc::clone(transition);
            arbiter.acquire(&holder, resource, move |result| {
                if let Some(link) = me.upgrade() {
                    link.on_item_acquired(&transition, result.map_err(Error::from));
                }
            });
        }
    }

    fn disable_active(&self) {
        self.teardown();
    }

    fn reset_config(&self) {
        *self.config.borrow_mut() = LinkConfig::default();
    }
}

impl AcquisitionHolder for SiStandardLink {
    fn holder_id(&self) -> ItemId {
        self.base.id()
    }

    fn resource_revoked(&self, resource: ItemId) {
        tracing::debug!(link = self.base.id(), resource, "resource revoked, deactivating");
        deactivate(self, ItemFeatures::ACTIVE);
    }
}
