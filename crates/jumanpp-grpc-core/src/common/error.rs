//! Error types for the analysis service.
//!
//! This module defines the central `Error` enum, which captures all recoverable
//! and reportable error cases of the serving engine. It implements
//! `From<Error>` for `tonic::Status` so that every failure surfaces to clients
//! with an appropriate status code.
//!
//! ## Error Cases
//! - `NotImplemented`: The request asked for an unsupported input kind.
//! - `InvalidArgument`: Malformed config header, config values or input text.
//! - `ResourceExhausted`: Every analyzer in the cache is busy. Never retried
//!   internally; clients are expected to back off and try later.
//! - `Internal`: Analyzer initialization, analysis or formatting failed.
//! - `RequestCancelled`: The client went away mid-call.
//! - `ChannelError`: An internal queue between tasks or workers was closed.
//! - `ServiceShutdown`: A request arrived while the service was shutting down.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the analysis service.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The request kind (or input format) is not supported.
    #[error("Not implemented: {what}")]
    NotImplemented { what: String },

    /// The client request or its configuration override was malformed.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// No idle or evictable analyzer is left in the cache.
    #[error("No available analyzer")]
    ResourceExhausted,

    /// Analyzer initialization, analysis or output formatting failed.
    #[error("Internal error: {context}")]
    Internal { context: String },

    /// The client aborted the request.
    #[error("Request cancelled by client")]
    RequestCancelled,

    /// Internal channel send/receive failure (e.g., closed queue).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn internal(context: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::NotImplemented { what } => Status::unimplemented(what),
            Error::InvalidArgument { reason } => Status::invalid_argument(reason),
            Error::ResourceExhausted => {
                Status::resource_exhausted("No available analyzer, try again later")
            }
            Error::Internal { context } => Status::internal(context),
            Error::RequestCancelled => Status::cancelled("Request was cancelled"),
            Error::ChannelError { context } => {
                Status::unavailable(format!("Channel error: {}", context))
            }
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn maps_to_status_codes() {
        let cases = [
            (
                Error::NotImplemented {
                    what: "request type 7".into(),
                },
                Code::Unimplemented,
            ),
            (Error::invalid_argument("bad header"), Code::InvalidArgument),
            (Error::ResourceExhausted, Code::ResourceExhausted),
            (Error::internal("boom"), Code::Internal),
            (Error::RequestCancelled, Code::Cancelled),
            (
                Error::ChannelError {
                    context: "closed".into(),
                },
                Code::Unavailable,
            ),
            (Error::ServiceShutdown, Code::Unavailable),
        ];

        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }

    #[test]
    fn invalid_argument_keeps_reason() {
        let status = Status::from(Error::invalid_argument("invalid config header"));
        assert_eq!(status.message(), "invalid config header");
    }
}
