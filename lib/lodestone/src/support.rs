use std::io;
use thiserror::Error;

pub type WireResult<T> = Result<T, WireError>;
pub type DriverResult<T> = Result<T, DriverError>;

/// Codec-level failure. `Wait` flags an incomplete input slice and never
/// escapes to callers; the session buffers the bytes and retries once more
/// data has arrived.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum WireError {
    #[error("need more bytes")]
    Wait,
    #[error("varint continuation exceeded 10 bytes")]
    MalformedVarint,
    #[error("string is not valid UTF-8")]
    Utf8,
    #[error("unknown type code {0}")]
    UnknownType(u8),
    #[error("schema has no global property with id {0}")]
    UnknownPropertyId(i32),
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

/// Caller-facing failure of a session operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DriverError {
    #[error("session is not connected")]
    Closed,
    #[error("call deadline elapsed")]
    Timeout,
    #[error("operation {op} is not available on a {target} session")]
    WrongScope {
        op: &'static str,
        target: &'static str,
    },
    #[error("server protocol {0} is below the supported minimum")]
    UnsupportedProtocol(u16),
    #[error("authentication rejected: {0}: {1}")]
    AuthFailed(String, String),
    #[error("server error: {0:?}")]
    Server(Vec<(String, String)>),
    #[error("schema has no global property with id {0}")]
    UnknownPropertyId(i32),
    #[error("malformed response: {0}")]
    MalformedResponse(&'static str),
    #[error("transport failure: {0:?}")]
    Transport(io::ErrorKind),
}

impl From<io::Error> for DriverError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        DriverError::Transport(io_error.kind())
    }
}

impl From<WireError> for DriverError {
    #[inline]
    fn from(err: WireError) -> Self {
        match err {
            WireError::Wait => DriverError::MalformedResponse("truncated payload"),
            WireError::MalformedVarint => DriverError::MalformedResponse("malformed varint"),
            WireError::Utf8 => DriverError::MalformedResponse("invalid utf-8"),
            WireError::UnknownType(_) => DriverError::MalformedResponse("unknown type code"),
            WireError::UnknownPropertyId(id) => DriverError::UnknownPropertyId(id),
            WireError::Malformed(what) => DriverError::MalformedResponse(what),
        }
    }
}
