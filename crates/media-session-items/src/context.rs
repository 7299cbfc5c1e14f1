//! Shared services of a session: remote graph, settings, item registry.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap},
    rc::{Rc, Weak},
};

use media_session_core::{RemoteCore, SessionSettings};

use crate::{
    Arbiter, SessionItem, SiAdapter, SiConvert, SiStandardLink, item::ItemId, policy::LinkPolicy,
};

/// Constructor of an item kind.
pub type ItemFactory = fn(&Rc<SessionContext>) -> Rc<dyn SessionItem>;

/// Everything items of one session share.
///
/// Items hold a strong reference to their context; the context only keeps
/// weak references to items, so dropping an item unregisters it.
pub struct SessionContext {
    remote: Rc<dyn RemoteCore>,
    settings: SessionSettings,
    policy: LinkPolicy,
    arbiter: Rc<Arbiter>,
    items: RefCell<BTreeMap<ItemId, Weak<dyn SessionItem>>>,
    factories: RefCell<HashMap<String, ItemFactory>>,
    next_id: Cell<ItemId>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("settings", &self.settings)
            .field("items", &self.items.borrow().len())
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Create a context with the default link policy.
    #[must_use]
    pub fn new(remote: Rc<dyn RemoteCore>, settings: SessionSettings) -> Rc<Self> {
        Self::with_policy(remote, settings, LinkPolicy::default())
    }

    /// Create a context with custom link heuristics.
    #[must_use]
    pub fn with_policy(
        remote: Rc<dyn RemoteCore>,
        settings: SessionSettings,
        policy: LinkPolicy,
    ) -> Rc<Self> {
        let arbiter = Rc::new(Arbiter::new(settings.preemption));
        let context = Rc::new(Self {
            remote,
            settings,
            policy,
            arbiter,
            items: RefCell::new(BTreeMap::new()),
            factories: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
        });
        context.register_factory(SiAdapter::FACTORY_NAME, make_adapter);
        context.register_factory(SiConvert::FACTORY_NAME, make_convert);
        context.register_factory(SiStandardLink::FACTORY_NAME, make_standard_link);
        context
    }

    #[must_use]
    pub fn remote(&self) -> &Rc<dyn RemoteCore> {
        &self.remote
    }

    #[must_use]
    pub const fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    #[must_use]
    pub const fn policy(&self) -> &LinkPolicy {
        &self.policy
    }

    /// Arbiter for resources that require exclusive access.
    #[must_use]
    pub const fn arbiter(&self) -> &Rc<Arbiter> {
        &self.arbiter
    }

    pub(crate) fn allocate_id(&self) -> ItemId {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        id
    }

    /// Make `item` reachable through [`Self::lookup`].
    pub fn register(&self, item: Weak<dyn SessionItem>) {
        if let Some(strong) = item.upgrade() {
            let id = strong.base().id();
            let mut items = self.items.borrow_mut();
            items.retain(|_, entry| entry.strong_count() > 0);
            items.insert(id, item);
        }
    }

    /// Find a live item by id.
    #[must_use]
    pub fn lookup(&self, id: ItemId) -> Option<Rc<dyn SessionItem>> {
        let mut items = self.items.borrow_mut();
        let item = items.get(&id).and_then(Weak::upgrade);
        if item.is_none() {
            items.remove(&id);
        }
        item
    }

    /// Ids of all live items, in creation order.
    #[must_use]
    pub fn item_ids(&self) -> Vec<ItemId> {
        let mut items = self.items.borrow_mut();
        items.retain(|_, item| item.strong_count() > 0);
        items.keys().copied().collect()
    }

    /// Register a constructor under `name`, replacing any previous one.
    pub fn register_factory(&self, name: impl Into<String>, factory: ItemFactory) {
        self.factories.borrow_mut().insert(name.into(), factory);
    }

    /// Create an unconfigured item of the given kind.
    #[must_use]
    pub fn make_item(self: &Rc<Self>, factory_name: &str) -> Option<Rc<dyn SessionItem>> {
        let factory = self.factories.borrow().get(factory_name).copied();
        let Some(factory) = factory else {
            tracing::warn!(factory = factory_name, "no such item factory");
            return None;
        };
        Some(factory(self))
    }
}

fn make_adapter(context: &Rc<SessionContext>) -> Rc<dyn SessionItem> {
    SiAdapter::new(context)
}

fn make_convert(context: &Rc<SessionContext>) -> Rc<dyn SessionItem> {
    SiConvert::new(context)
}

fn make_standard_link(context: &Rc<SessionContext>) -> Rc<dyn SessionItem> {
    SiStandardLink::new(context)
}
