//! This module contains utilities for testing code based on groups: an in-process network
//!  segment, a controllable clock, and a message listener that records what it receives. They
//!  are used for testing the protocol itself, but they are also exported for application
//!  testing.
//!
//! Test utilities are part of the crate's regular (non-#[cfg(test)]) code so that applications
//!  can use them in their own tests without a feature flag.

pub mod clock;
pub mod listener;
pub mod network;

use std::net::SocketAddr;
use std::time::Duration;

use crate::config::GroupsConfig;


/// A configuration with small fragments and short timeouts, suitable for tests with paused time
pub fn test_config() -> GroupsConfig {
    let mut config = GroupsConfig::new(SocketAddr::from(([239, 255, 0, 1], 7447)));
    config.announce_interval = Duration::from_millis(100);
    config.ack_timeout = Duration::from_millis(20);
    config.max_retries = 3;
    config.max_fragment_size = 16;
    config.max_message_size = 64*1024;
    config.reassembly_staleness_timeout = Duration::from_secs(1);
    config.reassembly_sweep_interval = Duration::from_millis(100);
    config.leave_grace_period = Duration::from_millis(5);
    config.intensive_failure_threshold = 10;
    config.intensive_failure_window = Duration::from_millis(10);
    config
}
