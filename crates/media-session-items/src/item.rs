//! Session item lifecycle.
//!
//! Every item kind embeds an [`ItemBase`] and implements [`SessionItem`].
//! The free functions in this module are the public entry points:
//! [`activate`] starts a [`Transition`] towards the wanted features,
//! [`deactivate`] and [`reset`] tear them down again in reverse order.

use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

use media_session_core::{
    ConfigError, Error, ItemFeatures, Properties, RemoteNode, RemoteObject, Transition,
    Transitionable,
    transition::{STEP_CUSTOM_START, STEP_ERROR, STEP_NONE, Step},
};
use tokio::sync::oneshot;

use crate::{SessionContext, linkable::Linkable};

/// Process-local item identifier.
pub type ItemId = u32;

/// Step enabling [`ItemFeatures::ACTIVE`].
pub const STEP_ACTIVATE: Step = STEP_CUSTOM_START;
/// Step enabling [`ItemFeatures::EXPORTED`].
pub const STEP_EXPORT: Step = STEP_CUSTOM_START + 1;
/// First step available to item kinds with their own steps.
pub const STEP_ITEM_CUSTOM_START: Step = STEP_CUSTOM_START + 0x10;

/// Kind of remote object an item may be associated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Node,
    Endpoint,
}

/// Remote object returned by [`SessionItem::associated_resource`].
#[derive(Clone)]
pub enum AssociatedResource {
    Node(Rc<dyn RemoteNode>),
    Object(Rc<dyn RemoteObject>),
}

impl AssociatedResource {
    #[must_use]
    pub fn bound_id(&self) -> u32 {
        match self {
            Self::Node(node) => node.bound_id(),
            Self::Object(object) => object.bound_id(),
        }
    }
}

impl std::fmt::Debug for AssociatedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node(node) => f.debug_tuple("Node").field(&node.bound_id()).finish(),
            Self::Object(object) => f.debug_tuple("Object").field(&object.bound_id()).finish(),
        }
    }
}

/// State shared by every item kind.
pub struct ItemBase {
    id: ItemId,
    factory_name: &'static str,
    features: Cell<ItemFeatures>,
    properties: RefCell<Properties>,
    transition: RefCell<Option<Rc<Transition>>>,
    context: Rc<SessionContext>,
}

impl std::fmt::Debug for ItemBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemBase")
            .field("id", &self.id)
            .field("factory_name", &self.factory_name)
            .field("features", &self.features.get())
            .finish_non_exhaustive()
    }
}

impl ItemBase {
    /// Allocate an id from `context` for a new item.
    #[must_use]
    pub fn new(context: &Rc<SessionContext>, factory_name: &'static str) -> Self {
        Self {
            id: context.allocate_id(),
            factory_name,
            features: Cell::new(ItemFeatures::empty()),
            properties: RefCell::new(Properties::new()),
            transition: RefCell::new(None),
            context: Rc::clone(context),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ItemId {
        self.id
    }

    #[must_use]
    pub const fn factory_name(&self) -> &'static str {
        self.factory_name
    }

    #[must_use]
    pub const fn context(&self) -> &Rc<SessionContext> {
        &self.context
    }

    #[must_use]
    pub fn features(&self) -> ItemFeatures {
        self.features.get()
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.features().contains(ItemFeatures::CONFIGURED)
    }

    /// Stored configuration, including derived values.
    #[must_use]
    pub fn configuration(&self) -> Properties {
        self.properties.borrow().clone()
    }

    /// A single stored property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.borrow().get(key).map(str::to_owned)
    }

    /// The in-flight transition, if any.
    #[must_use]
    pub fn transition(&self) -> Option<Rc<Transition>> {
        self.transition.borrow().clone()
    }

    /// Fail unless the configuration may change.
    ///
    /// # Errors
    /// Returns [`ConfigError::Busy`] while the item is activating or active.
    pub fn ensure_configurable(&self) -> Result<(), ConfigError> {
        if self.features().intersects(ItemFeatures::BUSY) {
            return Err(ConfigError::Busy(self.id));
        }
        Ok(())
    }

    /// Store a validated configuration and mark the item configured.
    pub fn set_configuration(&self, properties: Properties) {
        *self.properties.borrow_mut() = properties;
        self.set_flags(ItemFeatures::CONFIGURED);
        tracing::debug!(item = self.id, factory = self.factory_name, "configured");
    }

    fn clear_configuration(&self) {
        *self.properties.borrow_mut() = Properties::new();
        self.clear_flags(ItemFeatures::CONFIGURED);
    }

    fn set_flags(&self, flags: ItemFeatures) {
        self.features.set(self.features.get() | flags);
    }

    fn clear_flags(&self, flags: ItemFeatures) {
        self.features.set(self.features.get() - flags);
    }

    /// Enable and disable features, then let the in-flight transition react.
    pub fn update_features(&self, enable: ItemFeatures, disable: ItemFeatures) {
        let before = self.features.get();
        let after = (before | enable) - disable;
        if before != after {
            tracing::trace!(item = self.id, ?before, ?after, "features updated");
        }
        self.features.set(after);

        let transition = self.transition();
        if let Some(transition) = transition {
            transition.advance();
        }
    }
}

/// Base contract of every session item.
///
/// Kind-specific hooks are called by [`activate`], [`deactivate`] and
/// [`reset`]; they are not meant to be called directly.
pub trait SessionItem: Transitionable {
    fn base(&self) -> &ItemBase;

    /// Validate and store a configuration.
    ///
    /// # Errors
    /// Returns error if a required property is missing or malformed, or if
    /// the item is activating or active. The item is left unchanged.
    fn configure(&self, properties: Properties) -> Result<(), ConfigError>;

    /// Remote object backing the item.
    fn associated_resource(&self, _kind: ResourceKind) -> Option<AssociatedResource> {
        None
    }

    /// Bring up remote state; ends with `update_features(ACTIVE)` or an
    /// error on `transition`.
    fn enable_active(&self, transition: &Rc<Transition>);

    /// Export the item; ends with `update_features(EXPORTED)` or an error.
    fn enable_exported(&self, transition: &Rc<Transition>) {
        transition.return_error(Error::invariant(format!(
            "{} items cannot be exported",
            self.base().factory_name()
        )));
    }

    /// Release everything `enable_active` created. Never fails.
    fn disable_active(&self);

    /// Undo the export. Never fails.
    fn disable_exported(&self) {}

    /// Drop kind-specific configuration.
    fn reset_config(&self) {}

    /// Port query interface, for items that can be linked.
    fn linkable(&self) -> Option<&dyn Linkable> {
        None
    }
}

/// Step sequence of items that only implement the feature hooks.
pub fn feature_next_step(item: &dyn SessionItem, transition: &Transition, step: Step) -> Step {
    let features = item.base().features();
    let wanted = transition.wanted();
    match step {
        STEP_NONE | STEP_ACTIVATE | STEP_EXPORT => {
            if wanted.contains(ItemFeatures::ACTIVE) && !features.contains(ItemFeatures::ACTIVE) {
                STEP_ACTIVATE
            } else if wanted.contains(ItemFeatures::EXPORTED)
                && !features.contains(ItemFeatures::EXPORTED)
            {
                STEP_EXPORT
            } else {
                STEP_NONE
            }
        }
        _ => STEP_ERROR,
    }
}

/// Execute a step produced by [`feature_next_step`].
pub fn feature_execute_step(item: &dyn SessionItem, transition: &Rc<Transition>, step: Step) {
    match step {
        STEP_ACTIVATE => item.enable_active(transition),
        STEP_EXPORT => item.enable_exported(transition),
        _ => transition.return_error(Error::invariant(format!("unexpected step {step}"))),
    }
}

/// Request `features` on `item`.
///
/// `callback` is called exactly once, possibly before this returns.
pub fn activate(
    item: &Rc<dyn SessionItem>,
    features: ItemFeatures,
    callback: impl FnOnce(Result<(), Error>) + 'static,
) {
    let base = item.base();
    if !base.is_configured() {
        callback(Err(Error::NotConfigured(base.id())));
        return;
    }
    if base.transition().is_some() {
        callback(Err(Error::invariant(format!(
            "item {} is already transitioning",
            base.id()
        ))));
        return;
    }

    let wanted = features & ItemFeatures::REQUESTABLE;
    let missing = wanted - base.features();
    if missing.is_empty() {
        callback(Ok(()));
        return;
    }

    let mut busy = ItemFeatures::empty();
    if missing.contains(ItemFeatures::ACTIVE) {
        busy |= ItemFeatures::ACTIVATING;
    }
    if missing.contains(ItemFeatures::EXPORTED) {
        busy |= ItemFeatures::EXPORTING;
    }
    base.set_flags(busy);
    tracing::debug!(item = base.id(), ?wanted, "activating");

    let owner: Weak<dyn SessionItem> = Rc::downgrade(item);
    let source: Rc<dyn Transitionable> = item.clone();
    let transition = Transition::new(
        Rc::downgrade(&source),
        wanted,
        Box::new(move |result| {
            if let Some(item) = owner.upgrade() {
                let base = item.base();
                base.transition.replace(None);
                base.clear_flags(ItemFeatures::ACTIVATING | ItemFeatures::EXPORTING);
                match &result {
                    Ok(()) => {
                        base.set_flags(wanted);
                        tracing::debug!(item = base.id(), features = ?base.features(), "activated");
                    }
                    Err(error) => {
                        tracing::debug!(item = base.id(), %error, "activation failed");
                    }
                }
            }
            callback(result);
        }),
    );
    base.transition.replace(Some(Rc::clone(&transition)));
    transition.advance();
}

/// [`activate`] as a future.
///
/// # Errors
/// Returns the error the activation failed with, or
/// [`Error::SourceGone`] if the item was dropped before completing.
pub async fn activate_async(item: &Rc<dyn SessionItem>, features: ItemFeatures) -> Result<(), Error> {
    let (tx, rx) = oneshot::channel();
    activate(item, features, move |result| {
        // the caller may have stopped waiting
        let _ = tx.send(result);
    });
    rx.await.unwrap_or(Err(Error::SourceGone))
}

/// Tear down `features`, exported before active.
///
/// An in-flight transition is failed first.
pub fn deactivate(item: &dyn SessionItem, features: ItemFeatures) {
    let base = item.base();
    let current = base.features();
    if let Some(transition) = base.transition() {
        transition.return_error(Error::invariant(format!(
            "item {} deactivated while transitioning",
            base.id()
        )));
    }

    let features = if features.contains(ItemFeatures::ACTIVE) {
        features | ItemFeatures::EXPORTED
    } else {
        features
    };

    if features.contains(ItemFeatures::EXPORTED)
        && current.intersects(ItemFeatures::EXPORTED | ItemFeatures::EXPORTING)
    {
        item.disable_exported();
        base.clear_flags(ItemFeatures::EXPORTED | ItemFeatures::EXPORTING);
    }
    if features.contains(ItemFeatures::ACTIVE)
        && current.intersects(ItemFeatures::ACTIVE | ItemFeatures::ACTIVATING)
    {
        item.disable_active();
        base.clear_flags(ItemFeatures::ACTIVE | ItemFeatures::ACTIVATING);
    }
    tracing::debug!(item = base.id(), features = ?base.features(), "deactivated");
}

/// Deactivate everything and forget the configuration.
pub fn reset(item: &dyn SessionItem) {
    deactivate(item, ItemFeatures::all());
    item.reset_config();
    item.base().clear_configuration();
}

#[cfg(test)]
mod tests {
    use media_session_core::{SessionSettings, remote::MemoryGraph};
    use tokio::task::LocalSet;
    use tokio_test::assert_ok;

    use super::*;

    /// Item whose activation waits for an explicit `finish`.
    struct Manual {
        base: ItemBase,
        auto_finish: bool,
        disabled: RefCell<Vec<&'static str>>,
        rollbacks: Cell<u32>,
    }

    impl Manual {
        fn new(auto_finish: bool) -> Rc<Self> {
            let context = SessionContext::new(Rc::new(MemoryGraph::new()), SessionSettings::default());
            Rc::new(Self {
                base: ItemBase::new(&context, "manual"),
                auto_finish,
                disabled: RefCell::new(Vec::new()),
                rollbacks: Cell::new(0),
            })
        }

        fn finish(&self) {
            self.base.update_features(ItemFeatures::ACTIVE, ItemFeatures::empty());
        }
    }

    impl Transitionable for Manual {
        fn next_step(&self, transition: &Rc<Transition>, step: Step) -> Step {
            feature_next_step(self, transition, step)
        }

        fn execute_step(&self, transition: &Rc<Transition>, step: Step) {
            feature_execute_step(self, transition, step);
        }

        fn rollback(&self) {
            self.rollbacks.set(self.rollbacks.get() + 1);
        }
    }

    impl SessionItem for Manual {
        fn base(&self) -> &ItemBase {
            &self.base
        }

        fn configure(&self, properties: Properties) -> Result<(), ConfigError> {
            self.base.ensure_configurable()?;
            if !properties.contains_key("name") {
                return Err(ConfigError::Missing("name"));
            }
            self.base.set_configuration(properties);
            Ok(())
        }

        fn enable_active(&self, _transition: &Rc<Transition>) {
            if self.auto_finish {
                self.finish();
            }
        }

        fn enable_exported(&self, _transition: &Rc<Transition>) {
            self.base.update_features(ItemFeatures::EXPORTED, ItemFeatures::empty());
        }

        fn disable_active(&self) {
            self.disabled.borrow_mut().push("active");
        }

        fn disable_exported(&self) {
            self.disabled.borrow_mut().push("exported");
        }
    }

    fn record() -> (
        Rc<RefCell<Option<Result<(), Error>>>>,
        impl FnOnce(Result<(), Error>) + 'static,
    ) {
        let slot = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&slot);
        (slot, move |res| *sink.borrow_mut() = Some(res))
    }

    #[test]
    fn test_activate_requires_configuration() {
        let manual = Manual::new(true);
        let item: Rc<dyn SessionItem> = manual.clone();
        let (result, callback) = record();

        activate(&item, ItemFeatures::ACTIVE, callback);
        assert_eq!(*result.borrow(), Some(Err(Error::NotConfigured(manual.base.id()))));
        assert!(manual.base.transition().is_none());
    }

    #[test]
    fn test_configure_then_reset_restores_initial_state() {
        let manual = Manual::new(true);
        let initial = (manual.base.features(), manual.base.configuration());

        assert!(manual.configure(Properties::new()).is_err());
        assert_eq!(manual.base.features(), initial.0);

        assert_ok!(manual.configure(Properties::new().with("name", "a")));
        assert!(manual.base.is_configured());
        reset(manual.as_ref());
        assert_eq!((manual.base.features(), manual.base.configuration()), initial);
    }

    #[test]
    fn test_activate_and_export_in_order() {
        let manual = Manual::new(true);
        let item: Rc<dyn SessionItem> = manual.clone();
        assert_ok!(manual.configure(Properties::new().with("name", "a")));
        let (result, callback) = record();

        activate(&item, ItemFeatures::ACTIVE | ItemFeatures::EXPORTED, callback);
        assert_eq!(*result.borrow(), Some(Ok(())));
        let features = manual.base.features();
        assert!(features.contains(ItemFeatures::ACTIVE | ItemFeatures::EXPORTED));
        assert!(!features.intersects(ItemFeatures::ACTIVATING | ItemFeatures::EXPORTING));

        // configuration is frozen while active
        assert_eq!(
            manual.configure(Properties::new().with("name", "b")),
            Err(ConfigError::Busy(manual.base.id()))
        );

        deactivate(manual.as_ref(), ItemFeatures::ACTIVE);
        assert_eq!(*manual.disabled.borrow(), vec!["exported", "active"]);
        assert_eq!(manual.base.features(), ItemFeatures::CONFIGURED);
    }

    #[test]
    fn test_already_active_completes_immediately() {
        let manual = Manual::new(true);
        let item: Rc<dyn SessionItem> = manual.clone();
        assert_ok!(manual.configure(Properties::new().with("name", "a")));
        activate(&item, ItemFeatures::ACTIVE, |_| {});

        let (result, callback) = record();
        activate(&item, ItemFeatures::ACTIVE, callback);
        assert_eq!(*result.borrow(), Some(Ok(())));
    }

    #[test]
    fn test_second_activation_while_transitioning_fails() {
        let manual = Manual::new(false);
        let item: Rc<dyn SessionItem> = manual.clone();
        assert_ok!(manual.configure(Properties::new().with("name", "a")));
        let (first, callback) = record();
        activate(&item, ItemFeatures::ACTIVE, callback);
        assert!(first.borrow().is_none());
        assert!(manual.base.features().contains(ItemFeatures::ACTIVATING));

        let (second, callback) = record();
        activate(&item, ItemFeatures::ACTIVE, callback);
        assert!(matches!(*second.borrow(), Some(Err(Error::Invariant(_)))));

        manual.finish();
        assert_eq!(*first.borrow(), Some(Ok(())));
        assert!(manual.base.transition().is_none());
    }

    #[test]
    fn test_deactivate_during_activation_fails_transition() {
        let manual = Manual::new(false);
        let item: Rc<dyn SessionItem> = manual.clone();
        assert_ok!(manual.configure(Properties::new().with("name", "a")));
        let (result, callback) = record();
        activate(&item, ItemFeatures::ACTIVE, callback);

        deactivate(manual.as_ref(), ItemFeatures::ACTIVE);
        assert!(matches!(*result.borrow(), Some(Err(Error::Invariant(_)))));
        assert_eq!(manual.rollbacks.get(), 1);
        assert_eq!(manual.base.features(), ItemFeatures::CONFIGURED);
        assert_eq!(*manual.disabled.borrow(), vec!["active"]);
    }

    #[tokio::test]
    async fn test_activate_async_resolves_on_completion() {
        LocalSet::new()
            .run_until(async {
                let manual = Manual::new(false);
                let item: Rc<dyn SessionItem> = manual.clone();
                assert_ok!(manual.configure(Properties::new().with("name", "a")));

                let finisher = Rc::clone(&manual);
                tokio::task::spawn_local(async move {
                    tokio::task::yield_now().await;
                    finisher.finish();
                });
                assert_ok!(activate_async(&item, ItemFeatures::ACTIVE).await);
                assert!(manual.base.features().contains(ItemFeatures::ACTIVE));
            })
            .await;
    }
}
