use thiserror::Error;

/// Error taxonomy for the cache, updater, and dispatch layer.
///
/// `Synchronization` is the only variant the processor node treats as locally
/// recoverable: it is converted into `ResultCode::RetryLater` at the node
/// boundary (§7). Everything else either carries a precise `ResultCode` of its
/// own or is fatal and propagates out of the request path.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache synchronization conflict: {0}")]
    Synchronization(String),

    #[error("object {0} not found")]
    NotFound(u64),

    #[error("coordinates out of bounds")]
    OutOfBounds,

    #[error("location is not in line of sight")]
    NotInLos,

    #[error("location is occupied")]
    LocationOccupied,

    #[error("location is invalid")]
    InvalidLocation,

    #[error("client is not authenticated")]
    NotAuthenticated,

    #[error("invalid request type")]
    InvalidRequestType,

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl From<toml::de::Error> for CacheError {
    fn from(e: toml::de::Error) -> Self {
        CacheError::Configuration(e.to_string())
    }
}

impl From<std::net::AddrParseError> for CacheError {
    fn from(e: std::net::AddrParseError) -> Self {
        CacheError::Configuration(e.to_string())
    }
}
