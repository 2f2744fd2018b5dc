//! Broker connectivity
//!
//! Everything that talks AMQP lives here: the resilient [`client::BrokerClient`]
//! and the declarative [`topology`] the core owns on the broker.

pub mod client;
pub mod topology;

pub use client::BrokerClient;
