pub mod hub;
pub mod messages;

pub use hub::{ControlAction, DistributionHub, HubConfig, SessionControl};
pub use messages::StreamMessage;
