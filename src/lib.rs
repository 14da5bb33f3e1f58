//! Real-time synchronization core of the kost dashboard.
//!
//! [`mqtt`] holds the connection manager, topic registry, last-value cache and
//! command publisher. [`persistence`] stores the configured devices and keeps
//! their topics subscribed. [`config`] reads the application settings.

pub mod config;
pub mod mqtt;
pub mod persistence;
