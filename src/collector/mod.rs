pub mod engine;
pub mod registry;

pub use registry::{CollectorParams, CollectorRegistry, CollectorStatus};
