//! The closed result-code enumeration (§6) and its mapping from internal
//! errors at the node boundary (§7).

use crate::error::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ResultCode {
    Success = 0,
    ServerError = 1,
    RetryLater = 2,
    InvalidRequestType = 3,
    InvalidParameters = 4,
    InvalidServer = 5,
    StringNotUtf8 = 6,
    StringTooLong = 7,
    OutOfBounds = 8,
    NotInLos = 9,
    LocationOccupied = 10,
    InvalidLocation = 11,
    NoResponse = 12,
    NotAuthenticated = 13,
}

impl ResultCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl From<&CacheError> for ResultCode {
    fn from(err: &CacheError) -> Self {
        match err {
            CacheError::Synchronization(_) => ResultCode::RetryLater,
            CacheError::NotFound(_) => ResultCode::InvalidLocation,
            CacheError::OutOfBounds => ResultCode::OutOfBounds,
            CacheError::NotInLos => ResultCode::NotInLos,
            CacheError::LocationOccupied => ResultCode::LocationOccupied,
            CacheError::InvalidLocation => ResultCode::InvalidLocation,
            CacheError::NotAuthenticated => ResultCode::NotAuthenticated,
            CacheError::InvalidRequestType => ResultCode::InvalidRequestType,
            CacheError::InvalidParameters(_) => ResultCode::InvalidParameters,
            CacheError::Database(_)
            | CacheError::Configuration(_)
            | CacheError::Io(_)
            | CacheError::Serialization(_)
            | CacheError::Internal(_) => ResultCode::ServerError,
        }
    }
}
