//! Carousel - Intercepting Forward Proxy
//!
//! An intercepting forward proxy that bridges HTTP/1.x clients to rotating
//! egress backends.
//!
//! ## Features
//!
//! - CONNECT tunnel and plain request interception on a single listener
//! - TLS termination for tunneled traffic on a dedicated upgrade listener
//! - Egress through SOCKS5 relays, credentialed HTTP proxies, or direct dial
//! - Automatic retry with backend degradation on refusals and challenges
//! - Response artifacts persisted per resolution

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;

pub use config::Config;
pub use error::{CarouselError, Result};
