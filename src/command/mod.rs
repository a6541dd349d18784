//! Outbound command dispatch for the car
//!
//! This module handles:
//! - Accepting intents from control surfaces without blocking them
//! - Serializing writes so only one is ever outstanding on the link
//! - Collapsing movement updates to the latest value
//! - Reporting write outcomes and dropped commands

mod dispatcher;
mod events;

pub use dispatcher::{DispatchError, Dispatcher, DispatcherHandle};
pub use events::{DispatchEvent, LinkStatus};
