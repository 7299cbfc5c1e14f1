//! Exclusive acquisition of linkable resources.
//!
//! A resource (a linkable item) has at most one holder (a link) at a time.
//! What happens when a second holder asks for a held resource is decided
//! by the [`PreemptionPolicy`] the arbiter was created with.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    rc::{Rc, Weak},
};

use media_session_core::{AcquisitionError, PreemptionPolicy};

use crate::item::ItemId;

/// Something that can hold a resource.
pub trait AcquisitionHolder {
    fn holder_id(&self) -> ItemId;

    /// The grant on `resource` moved to another holder.
    fn resource_revoked(&self, resource: ItemId);
}

struct Grant {
    holder: ItemId,
    handle: Weak<dyn AcquisitionHolder>,
}

/// Single source of truth for who holds which resource.
pub struct Arbiter {
    policy: PreemptionPolicy,
    grants: RefCell<BTreeMap<ItemId, Grant>>,
}

impl std::fmt::Debug for Arbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let grants: BTreeMap<ItemId, ItemId> = self
            .grants
            .borrow()
            .iter()
            .map(|(resource, grant)| (*resource, grant.holder))
            .collect();
        f.debug_struct("Arbiter")
            .field("policy", &self.policy)
            .field("grants", &grants)
            .finish()
    }
}

impl Arbiter {
    #[must_use]
    pub fn new(policy: PreemptionPolicy) -> Self {
        Self {
            policy,
            grants: RefCell::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> PreemptionPolicy {
        self.policy
    }

    /// Request exclusive use of `resource` for `holder`.
    ///
    /// The grant is recorded immediately; `callback` always runs later on
    /// the local task set. Must be called from within a
    /// [`tokio::task::LocalSet`].
    pub fn acquire(
        &self,
        holder: &Rc<dyn AcquisitionHolder>,
        resource: ItemId,
        callback: impl FnOnce(Result<(), AcquisitionError>) + 'static,
    ) {
        let result = self.grant(holder, resource);
        tokio::task::spawn_local(async move {
            callback(result);
        });
    }

    fn grant(
        &self,
        holder: &Rc<dyn AcquisitionHolder>,
        resource: ItemId,
    ) -> Result<(), AcquisitionError> {
        let holder_id = holder.holder_id();
        let previous = {
            let mut grants = self.grants.borrow_mut();
            let current = grants
                .get(&resource)
                .filter(|grant| grant.holder != holder_id)
                .and_then(|grant| grant.handle.upgrade().map(|handle| (grant.holder, handle)));

            if self.policy == PreemptionPolicy::Reject {
                if let Some((current_holder, _)) = &current {
                    tracing::debug!(
                        resource,
                        holder = holder_id,
                        current_holder,
                        "acquisition rejected"
                    );
                    return Err(AcquisitionError::Busy {
                        resource,
                        holder: *current_holder,
                    });
                }
            }

            grants.insert(
                resource,
                Grant {
                    holder: holder_id,
                    handle: Rc::downgrade(holder),
                },
            );
            current
        };

        tracing::debug!(resource, holder = holder_id, "resource acquired");
        if let Some((previous_id, previous)) = previous {
            tracing::debug!(resource, holder = previous_id, "revoking previous holder");
            previous.resource_revoked(resource);
        }
        Ok(())
    }

    /// Give `resource` back. Does nothing unless `holder` holds it.
    pub fn release(&self, holder: ItemId, resource: ItemId) {
        let mut grants = self.grants.borrow_mut();
        if grants.get(&resource).is_some_and(|grant| grant.holder == holder) {
            grants.remove(&resource);
            tracing::debug!(resource, holder, "resource released");
        }
    }

    /// Current holder of `resource`.
    #[must_use]
    pub fn holder_of(&self, resource: ItemId) -> Option<ItemId> {
        self.grants
            .borrow()
            .get(&resource)
            .filter(|grant| grant.handle.strong_count() > 0)
            .map(|grant| grant.holder)
    }
}
