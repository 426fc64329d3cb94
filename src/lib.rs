#![deny(clippy::mod_module_files)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod gateway;
pub mod history;
pub mod identity;
pub mod reference;
pub mod referrers;
pub mod selection;

pub use config::InspectorConfig;
pub use coordinator::{
    CoordinatorConfig, LoadCoordinator, LoadPhase, LoadRequest, ReferrerTree, SourceKind,
};
pub use error::{
    CoordinatorError, GatewayError, ParseError, ReferrerTraversalError, ResolutionError,
};
pub use identity::CurrentIdentity;
pub use reference::{Digest, Reference, TagOrDigest};
pub use referrers::{ReferrerGraphBuilder, ReferrerNode};
