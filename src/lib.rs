//! Courier library — re-exports modules for the binary and integration tests.

pub mod agent;
pub mod channel;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod group;
pub mod message;
pub mod queue;
pub mod runner;
pub mod state;
pub mod store;
