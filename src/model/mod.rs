//! Typed in-memory models parsed from the three document shapes this crate
//! consumes: infrastructure, distributed-derivation, and manifest XML.

pub mod derivation;
pub mod manifest;
pub mod target;
mod xml;

pub use derivation::{derivations_from_xml, DerivationItem};
pub use manifest::{Manifest, ManifestService, ProfileMapping, ServiceKey};
pub use target::{Container, Infrastructure, Target};
