use super::BackendClass;

/// One retry iteration inside a single resolution
///
/// Kept for structured logging; attempts are never persisted.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// 1-based attempt index
    pub attempt: u32,
    /// Effective backend class for this attempt
    pub class: BackendClass,
    /// Selected endpoint, credential-free form
    pub endpoint: String,
    /// Synthetic user agent assigned to the outbound request
    pub user_agent: String,
    /// Status code of the obtained response
    pub status: u16,
    /// Whether the anti-bot heuristic flagged the response
    pub challenge: bool,
}

impl AttemptRecord {
    /// Whether the response triggered another attempt
    pub fn retried(&self) -> bool {
        self.challenge || matches!(self.status, 403 | 503)
    }
}
