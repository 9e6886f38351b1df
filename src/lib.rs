//! Subdock - A reverse proxy that routes subdomains to Docker containers
//!
//! This library provides a discovery-driven reverse proxy that:
//! - Watches the Docker event feed and registers started containers by name
//! - Routes inbound traffic by the first label of the Host header
//! - Forwards plain HTTP through a pooled client with streamed bodies
//! - Relays WebSocket and other upgrade handshakes as raw byte streams
//! - Provisions new containers from an image through a small admin API

pub mod admin;
pub mod config;
pub mod discovery;
pub mod docker;
pub mod error;
pub mod pool;
pub mod provision;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod splice;
