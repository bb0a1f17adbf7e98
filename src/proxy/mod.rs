//! Proxy bridge implementation
//!
//! This module provides the intercepting proxy functionality including:
//! - Client session classification (CONNECT tunnels vs plain requests)
//! - Raw byte relay to the upgrade listeners
//! - Egress dialing through SOCKS5 relays, credentialed proxies, or direct
//! - Response resolution with rotation, retry, and challenge detection

pub mod agents;
pub mod audit;
pub mod blacklist;
pub mod heuristic;
pub mod pipe;
pub mod resolver;
pub mod rotation;
pub mod server;
pub mod session;
pub mod tls;
pub mod transport;

pub use audit::AuditStore;
pub use resolver::Resolver;
pub use rotation::RotationPools;
pub use server::BridgeServer;
pub use session::Session;
pub use transport::TransportConfig;
