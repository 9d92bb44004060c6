use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::{borrow::Cow, error::Error as StdError};
use tracing::{error, info};

/// Information reported to the control plane on error.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub message: String,
    /// Error code is a string that specifies this error type.
    pub error_code: Cow<'static, str>,
    /// Detailed error metadata.
    /// The contents of this field is determined by `error_code`.
    pub details: JsonValue,
}

/// Error trait which engine errors must implement such that they
/// can be transformed to a complete JSON error response.
pub trait DetailedError: StdError + Serialize {
    /// Identifying name of the error.
    fn error_code(&self) -> Cow<'static, str>;

    /// Whether the condition is expected to go away on retry, e.g. a
    /// temporarily exhausted buffer pool.
    fn is_recoverable(&self) -> bool {
        false
    }
}

impl<E> From<&E> for ErrorResponse
where
    E: DetailedError,
{
    fn from(error: &E) -> ErrorResponse {
        Self::from_error(error)
    }
}

impl ErrorResponse {
    /// Transforms the error into a response, logging it on the way.
    /// Recoverable errors are logged at `info`, everything else at `error`.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: DetailedError,
    {
        let response = Self::from_error_nolog(error);
        if error.is_recoverable() {
            info!("[recoverable] {}: {}", response.error_code, response.message);
        } else {
            error!("{}: {}", response.error_code, response.message);
        }
        response
    }

    pub fn from_error_nolog<E>(error: &E) -> Self
    where
        E: DetailedError,
    {
        let details = serde_json::to_value(error).unwrap_or_else(|e| {
            JsonValue::String(format!(
                "Failed to serialize error. Details: '{e}'. Error message: '{error}'"
            ))
        });

        Self {
            message: error.to_string(),
            error_code: error.error_code(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug, Serialize)]
    struct PoolDrained {
        requested: usize,
    }

    impl fmt::Display for PoolDrained {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "no buffer for {} bytes", self.requested)
        }
    }

    impl StdError for PoolDrained {}

    impl DetailedError for PoolDrained {
        fn error_code(&self) -> Cow<'static, str> {
            Cow::Borrowed("PoolDrained")
        }
    }

    #[test]
    fn response_carries_details() {
        let response = ErrorResponse::from(&PoolDrained { requested: 64 });
        assert_eq!(response.error_code, "PoolDrained");
        assert_eq!(response.message, "no buffer for 64 bytes");
        assert_eq!(response.details, serde_json::json!({ "requested": 64 }));
    }
}
