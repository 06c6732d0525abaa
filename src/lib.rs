#[macro_use]
extern crate tracing;

pub mod agent;
pub mod build;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod logger;
pub mod model;
pub mod plan;
pub mod registry;
pub mod snapshot;

pub use config::{Config, ConfigOverrides};
pub use coordinator::Coordinator;
pub use errors::Error;
pub use registry::TargetRegistry;
