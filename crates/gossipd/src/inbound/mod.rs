//! Inbound chat connections: accept, identify against the registry, deliver.

mod identify;
pub mod listener;

pub use identify::{InboundConnection, RetryPolicy};
pub use listener::InboundListener;
