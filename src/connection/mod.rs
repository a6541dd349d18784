//! Connection management for the car link
//!
//! This module handles:
//! - Connecting through a pluggable transport with a timeout
//! - Automatic reconnection with exponential backoff
//! - Handing links to the dispatcher and reporting their loss
//! - Stopping the car before an intentional disconnect

mod manager;

pub use manager::{ConnectionEvent, ConnectionManager, LinkConfig};
