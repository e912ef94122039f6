//! gRPC service implementation and the state shared by every call.
//!
//! ## Structure
//!
//! - [`env`] - [`ServiceEnv`](env::ServiceEnv): default configuration and the
//!   analyzer cache.
//! - [`handler`] - gRPC service entry point (`AnalysisService`).

pub mod env;
pub mod handler;
