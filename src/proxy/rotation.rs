//! Rotation pools with uniform random endpoint selection
//!
//! Two independent pools: relay endpoints (`host:port`) and credentialed HTTP
//! proxy endpoints (`user:password@host:port`). Pools are populated once
//! before traffic starts and shared immutably across all resolver tasks;
//! selection uses the per-thread generator so concurrent resolutions never
//! contend on a shared random source.

use rand::seq::SliceRandom;

use crate::error::{CarouselError, Result};
use crate::models::BackendClass;

/// An endpoint selected from a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picked {
    /// Dial target handed to the transport factory; `None` for direct egress
    pub endpoint: Option<String>,
    /// Credential-free form for log output
    pub display: String,
}

/// Immutable snapshot of the configured egress endpoints
#[derive(Debug, Default)]
pub struct RotationPools {
    relays: Vec<String>,
    proxies: Vec<String>,
}

impl RotationPools {
    pub fn new(relays: Vec<String>, proxies: Vec<String>) -> Self {
        Self { relays, proxies }
    }

    /// Select an endpoint for the given backend class
    pub fn pick(&self, class: BackendClass) -> Result<Picked> {
        match class {
            BackendClass::Dynamic | BackendClass::Tor => {
                let endpoint = self.choose(&self.relays, class)?;
                Ok(Picked {
                    display: endpoint.clone(),
                    endpoint: Some(endpoint),
                })
            }
            BackendClass::Http => {
                let endpoint = self.choose(&self.proxies, class)?;
                Ok(Picked {
                    display: redact_credentials(&endpoint),
                    endpoint: Some(endpoint),
                })
            }
            BackendClass::Direct => Ok(Picked {
                endpoint: None,
                display: String::new(),
            }),
        }
    }

    fn choose(&self, pool: &[String], class: BackendClass) -> Result<String> {
        let mut rng = rand::thread_rng();
        pool.choose(&mut rng)
            .cloned()
            .ok_or_else(|| CarouselError::NoEndpoints(class.as_str().to_string()))
    }

    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }
}

/// Strip the credential portion of a `user:password@host:port` entry
fn redact_credentials(endpoint: &str) -> String {
    endpoint
        .rsplit_once('@')
        .map(|(_, addr)| addr.to_string())
        .unwrap_or_else(|| endpoint.to_string())
}
