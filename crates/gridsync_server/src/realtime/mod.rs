mod hub;
mod message;

pub use hub::{Hub, HubStats};
pub use message::BroadcastMessage;
