//! Adapter item: wraps an existing node and negotiates its port format.

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use media_session_core::{
    ConfigError, Error, ItemFeatures, Properties, ProxyFeatures, RemoteNode, RemoteObject,
    Transition, Transitionable,
    properties::keys,
    remote::{AudioFormat, ENDPOINT_KIND, Direction, Param, SampleFormat},
    transition::Step,
};

use crate::{
    Arbiter, SessionContext,
    item::{
        AssociatedResource, ItemBase, ResourceKind, SessionItem, feature_execute_step,
        feature_next_step,
    },
    linkable::{Adapter, FormatCallback, Linkable, PortMode, PortRef, resolve_context, select_ports},
};

struct AdapterConfig {
    node: Rc<dyn RemoteNode>,
    direction: Direction,
    control_port: bool,
    monitor: bool,
    exclusive: bool,
    preferred_channels: u32,
}

/// Session item representing an existing node, such as a device or a
/// client stream.
///
/// Configuration keys: `node` (remote node id, required), `name`,
/// `media-class`, `role`, `priority`, `preferred-n-channels`,
/// `enable-control-port`, `enable-monitor`, `item.exclusive`. Other keys
/// are stored as given.
pub struct SiAdapter {
    base: ItemBase,
    me: Weak<Self>,
    config: RefCell<Option<AdapterConfig>>,
    format: RefCell<Option<(AudioFormat, PortMode)>>,
    endpoint: RefCell<Option<Rc<dyn RemoteObject>>>,
}

impl SiAdapter {
    pub const FACTORY_NAME: &'static str = "si-adapter";

    /// Create an unconfigured adapter registered in `context`.
    #[must_use]
    pub fn new(context: &Rc<SessionContext>) -> Rc<Self> {
        let item = Rc::new_cyclic(|me| Self {
            base: ItemBase::new(context, Self::FACTORY_NAME),
            me: me.clone(),
            config: RefCell::new(None),
            format: RefCell::new(None),
            endpoint: RefCell::new(None),
        });
        let weak = Rc::downgrade(&item) as Weak<dyn SessionItem>;
        context.register(weak);
        item
    }

    /// Configured port direction.
    #[must_use]
    pub fn direction(&self) -> Option<Direction> {
        self.config.borrow().as_ref().map(|c| c.direction)
    }

    /// Id of the wrapped node.
    #[must_use]
    pub fn node_id(&self) -> Option<u32> {
        self.config.borrow().as_ref().map(|c| c.node.bound_id())
    }

    fn node(&self) -> Option<Rc<dyn RemoteNode>> {
        self.config.borrow().as_ref().map(|c| Rc::clone(&c.node))
    }

    fn parse_config(
        &self,
        mut properties: Properties,
    ) -> Result<(AdapterConfig, Properties), ConfigError> {
        let node_id = match properties.parse::<u32>("node") {
            Some(Ok(id)) => id,
            Some(Err(_)) => {
                let value = properties.get("node").unwrap_or_default();
                return Err(ConfigError::invalid("node", value));
            }
            None => return Err(ConfigError::Missing("node")),
        };
        let node = self
            .base
            .context()
            .remote()
            .lookup_node(node_id)
            .ok_or_else(|| ConfigError::invalid("node", node_id.to_string()))?;
        let node_props = node.properties();

        if !properties.contains_key("name") {
            let name = node_props.get(keys::NODE_NAME).unwrap_or("unnamed").to_string();
            properties.set("name", name);
        }
        if !properties.contains_key("media-class") {
            let class = node_props
                .get(keys::MEDIA_CLASS)
                .ok_or(ConfigError::Missing("media-class"))?
                .to_string();
            properties.set("media-class", class);
        }
        let class = properties.get("media-class").unwrap_or_default();
        let direction = direction_from_media_class(class)
            .ok_or_else(|| ConfigError::invalid("media-class", class))?;

        let priority = parse_u32(&properties, "priority")?;
        let preferred_channels = parse_u32(&properties, "preferred-n-channels")?;
        let control_port = properties.get_bool("enable-control-port");
        let monitor = properties.get_bool("enable-monitor");
        let exclusive = properties.get_bool(keys::ITEM_EXCLUSIVE);

        properties.set("direction", direction.as_index().to_string());
        properties.set("priority", priority.to_string());
        properties.set("preferred-n-channels", preferred_channels.to_string());
        properties.set("enable-control-port", u8::from(control_port).to_string());
        properties.set("enable-monitor", u8::from(monitor).to_string());
        properties.set(keys::NODE_ID, node_id.to_string());
        properties.set(keys::ITEM_FACTORY_NAME, Self::FACTORY_NAME);

        let config = AdapterConfig {
            node,
            direction,
            control_port,
            monitor,
            exclusive,
            preferred_channels,
        };
        Ok((config, properties))
    }

    /// Format the ports settle into when no format is imposed.
    fn own_format(&self, config: &AdapterConfig, mode: PortMode) -> AudioFormat {
        let settings = self.base.context().settings();
        let native: Vec<_> = config
            .node
            .ports()
            .into_iter()
            .filter(|p| p.direction == config.direction)
            .filter(|p| !p.properties.get_bool(keys::PORT_CONTROL))
            .map(|p| p.channel())
            .collect();

        if mode == PortMode::Passthrough && !native.is_empty() {
            return AudioFormat {
                format: SampleFormat::F32,
                rate: settings.convert_rate,
                channels: u32::try_from(native.len()).unwrap_or(u32::MAX),
                positions: native,
            };
        }
        let channels = match config.preferred_channels {
            0 if native.is_empty() => settings.convert_channels,
            0 => u32::try_from(native.len()).unwrap_or(u32::MAX),
            n => n,
        };
        AudioFormat::dsp(settings.convert_rate, channels)
    }
}

fn direction_from_media_class(class: &str) -> Option<Direction> {
    if class.contains("Sink") || class.contains("Input") {
        Some(Direction::Input)
    } else if class.contains("Source") || class.contains("Output") {
        Some(Direction::Output)
    } else {
        None
    }
}

fn parse_u32(properties: &Properties, key: &'static str) -> Result<u32, ConfigError> {
    match properties.parse::<u32>(key) {
        None => Ok(0),
        Some(Ok(value)) => Ok(value),
        Some(Err(_)) => Err(ConfigError::invalid(key, properties.get(key).unwrap_or_default())),
    }
}

/// Apply a port configuration to `node` and wait for the new ports.
pub(crate) fn configure_node_ports(
    node: Rc<dyn RemoteNode>,
    param: Param,
    callback: impl FnOnce(Result<(), Error>) + 'static,
) {
    if let Err(e) = node.set_param(param) {
        callback(Err(e.into()));
        return;
    }
    tokio::task::spawn_local(async move {
        let result = node.activate(ProxyFeatures::PORTS).await.map_err(Error::from);
        callback(result);
    });
}

impl Transitionable for SiAdapter {
    fn next_step(&self, transition: &Rc<Transition>, step: Step) -> Step {
        feature_next_step(self, transition, step)
    }

    fn execute_step(&self, transition: &Rc<Transition>, step: Step) {
        feature_execute_step(self, transition, step);
    }

    fn rollback(&self) {
        if !self.base.features().contains(ItemFeatures::EXPORTED) {
            if let Some(endpoint) = self.endpoint.borrow_mut().take() {
                tracing::debug!(item = self.base.id(), endpoint = endpoint.bound_id(), "dropping failed export");
            }
        }
    }
}

impl SessionItem for SiAdapter {
    fn base(&self) -> &ItemBase {
        &self.base
    }

    fn configure(&self, properties: Properties) -> Result<(), ConfigError> {
        self.base.ensure_configurable()?;
        let (config, properties) = self.parse_config(properties)?;
        *self.config.borrow_mut() = Some(config);
        *self.format.borrow_mut() = None;
        self.base.set_configuration(properties);
        Ok(())
    }

    fn associated_resource(&self, kind: ResourceKind) -> Option<AssociatedResource> {
        match kind {
            ResourceKind::Node => self.node().map(AssociatedResource::Node),
            ResourceKind::Endpoint => self.endpoint.borrow().clone().map(AssociatedResource::Object),
        }
    }

    fn enable_active(&self, transition: &Rc<Transition>) {
        let Some(node) = self.node() else {
            transition.return_error(Error::NotConfigured(self.base.id()));
            return;
        };
        let me = self.me.clone();
        let transition = Rc::clone(transition);
        tokio::task::spawn_local(async move {
            let result = node.activate(ProxyFeatures::MINIMAL | ProxyFeatures::PORTS).await;
            if transition.is_completed() {
                return;
            }
            match (result, me.upgrade()) {
                (Ok(()), Some(adapter)) => {
                    adapter.base.update_features(ItemFeatures::ACTIVE, ItemFeatures::empty());
                }
                (Ok(()), None) => transition.return_error(Error::SourceGone),
                (Err(e), _) => transition.return_error(e.into()),
            }
        });
    }

    fn enable_exported(&self, transition: &Rc<Transition>) {
        let configuration = self.base.configuration();
        let properties = Properties::new()
            .with(keys::ENDPOINT_NAME, configuration.get("name").unwrap_or_default())
            .with(keys::MEDIA_CLASS, configuration.get("media-class").unwrap_or_default())
            .with(keys::NODE_ID, configuration.get(keys::NODE_ID).unwrap_or_default());

        let endpoint = match self.base.context().remote().export(ENDPOINT_KIND, properties) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                transition.return_error(e.into());
                return;
            }
        };
        *self.endpoint.borrow_mut() = Some(Rc::clone(&endpoint));

        let me = self.me.clone();
        let transition = Rc::clone(transition);
        tokio::task::spawn_local(async move {
            let result = endpoint.activate(ProxyFeatures::STANDARD).await;
            if transition.is_completed() {
                return;
            }
            match (result, me.upgrade()) {
                (Ok(()), Some(adapter)) => {
                    adapter.base.update_features(ItemFeatures::EXPORTED, ItemFeatures::empty());
                }
                (Ok(()), None) => transition.return_error(Error::SourceGone),
                (Err(e), _) => transition.return_error(e.into()),
            }
        });
    }

    fn disable_active(&self) {
        *self.format.borrow_mut() = None;
    }

    fn disable_exported(&self) {
        self.endpoint.borrow_mut().take();
    }

    fn reset_config(&self) {
        self.config.borrow_mut().take();
        self.format.borrow_mut().take();
    }

    fn linkable(&self) -> Option<&dyn Linkable> {
        Some(self)
    }
}

impl Linkable for SiAdapter {
    fn ports(&self, context: Option<&str>) -> Vec<PortRef> {
        let config = self.config.borrow();
        let Some(config) = config.as_ref() else {
            return Vec::new();
        };
        let Some((direction, monitor)) = resolve_context(config.direction, context) else {
            return Vec::new();
        };
        select_ports(config.node.bound_id(), &config.node.ports(), direction, monitor)
    }

    fn acquisition(&self) -> Option<Rc<Arbiter>> {
        let exclusive = self.config.borrow().as_ref().is_some_and(|c| c.exclusive);
        exclusive.then(|| Rc::clone(self.base.context().arbiter()))
    }

    fn adapter(&self) -> Option<&dyn Adapter> {
        Some(self)
    }
}

impl Adapter for SiAdapter {
    fn ports_format(&self) -> Option<(AudioFormat, PortMode)> {
        self.format.borrow().clone()
    }

    fn set_ports_format(
        &self,
        format: Option<AudioFormat>,
        mode: PortMode,
        callback: FormatCallback,
    ) {
        let prepared = self.config.borrow().as_ref().map(|config| {
            let format = format.unwrap_or_else(|| self.own_format(config, mode));
            let param = Param::PortConfig {
                direction: config.direction,
                mode: mode.into(),
                control: config.control_port,
                monitor: config.monitor,
                format: (mode != PortMode::Passthrough).then(|| format.clone()),
            };
            (Rc::clone(&config.node), param, format)
        });
        let Some((node, param, format)) = prepared else {
            callback(Err(Error::NotConfigured(self.base.id())));
            return;
        };
        tracing::debug!(
            item = self.base.id(),
            ?mode,
            channels = format.channels,
            "setting ports format"
        );

        let me = self.me.clone();
        configure_node_ports(node, param, move |result| {
            if result.is_ok() {
                if let Some(adapter) = me.upgrade() {
                    *adapter.format.borrow_mut() = Some((format, mode));
                }
            }
            callback(result);
        });
    }
}
