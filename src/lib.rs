//! Moat - an authenticating gateway that routes by hostname
//!
//! This library provides a reverse proxy that:
//! - Checks a session cookie before letting traffic through
//! - Routes HTTP traffic by Host header to backends in a shared registry
//! - Fills the registry from configuration and from labeled Docker containers
//! - Follows container start/stop events, reconnecting when the daemon drops
//! - Applies configuration changes live, without restarting the listener
//! - Streams large or open-ended responses instead of buffering them

pub mod admin;
pub mod auth;
pub mod config;
pub mod discovery;
pub mod docker;
pub mod error;
pub mod forward;
pub mod pool;
pub mod proxy;
pub mod reconcile;
pub mod registry;
pub mod reload;
