//! Session items for the media session policy layer.
//!
//! Provides:
//! - `SessionContext` - Item registry, factories and shared services
//! - `SessionItem` - Base lifecycle contract driven by transitions
//! - `Arbiter` - Exclusive acquisition of linkable resources
//! - `SiAdapter`, `SiConvert`, `SiStandardLink` - Concrete item kinds
//! - `NodeSuspension` - Suspends nodes that stay idle

pub mod acquisition;
pub mod adapter;
pub mod context;
pub mod convert;
pub mod item;
pub mod linkable;
pub mod policy;
pub mod standard_link;
pub mod suspension;

pub use acquisition::{AcquisitionHolder, Arbiter};
pub use adapter::SiAdapter;
pub use context::SessionContext;
pub use convert::SiConvert;
pub use item::{
    AssociatedResource, ItemBase, ItemId, ResourceKind, SessionItem, activate, activate_async,
    deactivate, reset,
};
pub use linkable::{Adapter, Linkable, PortMode, PortRef};
pub use policy::LinkPolicy;
pub use standard_link::SiStandardLink;
pub use suspension::NodeSuspension;

#[cfg(test)]
pub(crate) mod testing;
