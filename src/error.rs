use std::net::Ipv6Addr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("RFC violation: {0}")]
    RfcViolation(String),

    #[error("Bad value: {0}")]
    BadValue(String),

    #[error("Option payload too short: {0}")]
    OutOfRange(String),

    #[error("Address {0} is already leased")]
    DuplicateLease(Ipv6Addr),

    #[error("No lease for address {0}")]
    LeaseNotFound(Ipv6Addr),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Library error: {0}")]
    Library(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;
