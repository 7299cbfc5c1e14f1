//! Core abstractions for the media session policy layer.
//!
//! This crate provides the fundamental building blocks:
//! - `Transition` - Resumable, step-driven state machine driver
//! - `Properties` - Ordered string property bag
//! - `ItemFeatures` / `ProxyFeatures` - Feature bitsets
//! - Remote graph traits (`RemoteCore`, `RemoteNode`, `RemoteObject`)
//! - `Interest` - Property constraint matching
//! - `SessionSettings` - Policy configuration

pub mod error;
pub mod features;
pub mod interest;
pub mod properties;
pub mod remote;
pub mod settings;
pub mod transition;

pub use error::{AcquisitionError, ConfigError, Error, RemoteError, Result};
pub use features::{ItemFeatures, ProxyFeatures};
pub use interest::Interest;
pub use properties::Properties;
pub use remote::{RemoteCore, RemoteNode, RemoteObject};
pub use settings::{PreemptionPolicy, SessionSettings};
pub use transition::{Step, Transition, Transitionable};
