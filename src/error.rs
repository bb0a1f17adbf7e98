use thiserror::Error;

/// Unified error type for the Carousel application
#[derive(Error, Debug)]
pub enum CarouselError {
    // Session errors
    #[error("Request parse failed: {0}")]
    RequestParse(String),

    #[error("Upgrade dial failed: {0}")]
    UpgradeDial(String),

    #[error("Relay failed: {0}")]
    Relay(String),

    // Resolver errors
    #[error("No endpoints available for backend class '{0}'")]
    NoEndpoints(String),

    #[error("Relay egress blocked for domain: {0}")]
    BackendBlocked(String),

    #[error("Invalid endpoint address: {0}")]
    InvalidEndpoint(String),

    #[error("Transport execution failed: {0}")]
    TransportExecution(String),

    #[error("Audit write failed: {0}")]
    AuditWrite(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // TLS errors
    #[error("TLS error: {0}")]
    Tls(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Carousel operations
pub type Result<T> = std::result::Result<T, CarouselError>;

impl CarouselError {
    /// Check if this error aborts a resolution without producing a response
    pub fn aborts_resolution(&self) -> bool {
        matches!(
            self,
            CarouselError::NoEndpoints(_)
                | CarouselError::BackendBlocked(_)
                | CarouselError::InvalidEndpoint(_)
                | CarouselError::TransportExecution(_)
                | CarouselError::AuditWrite(_)
                | CarouselError::InvalidRequest(_)
        )
    }
}

// Convert from hyper errors
impl From<hyper::Error> for CarouselError {
    fn from(err: hyper::Error) -> Self {
        CarouselError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for CarouselError {
    fn from(err: url::ParseError) -> Self {
        CarouselError::InvalidEndpoint(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_formats() {
        assert_eq!(
            CarouselError::NoEndpoints("tor".to_string()).to_string(),
            "No endpoints available for backend class 'tor'"
        );
        assert_eq!(
            CarouselError::BackendBlocked("craigslist.org".to_string()).to_string(),
            "Relay egress blocked for domain: craigslist.org"
        );
        assert_eq!(
            CarouselError::InvalidEndpoint("bad".to_string()).to_string(),
            "Invalid endpoint address: bad"
        );
        assert_eq!(
            CarouselError::AuditWrite("disk full".to_string()).to_string(),
            "Audit write failed: disk full"
        );
    }

    #[test]
    fn test_error_aborts_resolution() {
        assert!(CarouselError::BackendBlocked("x".to_string()).aborts_resolution());
        assert!(CarouselError::TransportExecution("x".to_string()).aborts_resolution());
        assert!(CarouselError::AuditWrite("x".to_string()).aborts_resolution());

        assert!(!CarouselError::RequestParse("x".to_string()).aborts_resolution());
        assert!(!CarouselError::InvalidConfig("x".to_string()).aborts_resolution());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: CarouselError = io_err.into();
        assert!(matches!(err, CarouselError::Io(_)));
    }

    #[test]
    fn test_error_from_url_parse() {
        let parse_err = url::Url::parse("not a url").unwrap_err();
        let err: CarouselError = parse_err.into();
        assert!(matches!(err, CarouselError::InvalidEndpoint(_)));
    }
}
