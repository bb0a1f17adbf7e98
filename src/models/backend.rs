use clap::ValueEnum;

/// Outbound backend class
///
/// `dynamic` is a meta-class: it resolves to `tor` per request and may be
/// degraded to `http` by the retry engine or the relay blacklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendClass {
    Dynamic,
    Tor,
    Http,
    Direct,
}

impl BackendClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendClass::Dynamic => "dynamic",
            BackendClass::Tor => "tor",
            BackendClass::Http => "http",
            BackendClass::Direct => "direct",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "dynamic" => Some(BackendClass::Dynamic),
            "tor" => Some(BackendClass::Tor),
            "http" => Some(BackendClass::Http),
            "direct" => Some(BackendClass::Direct),
            _ => None,
        }
    }

    /// Whether this class draws endpoints from the relay pool
    pub fn uses_relay_pool(&self) -> bool {
        matches!(self, BackendClass::Dynamic | BackendClass::Tor)
    }

    /// Whether this class draws endpoints from the HTTP proxy pool
    pub fn uses_proxy_pool(&self) -> bool {
        matches!(self, BackendClass::Dynamic | BackendClass::Http)
    }
}

impl std::fmt::Display for BackendClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
