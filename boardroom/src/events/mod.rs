//! Deliberation events — typed envelopes and the pub/sub bus.

pub mod bus;
pub mod types;

pub use bus::{EventBus, SharedEventBus};
pub use types::{preview, DeliberationEvent};
