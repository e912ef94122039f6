//! Server-side components of the Juman++ analysis service.
//!
//! ## Submodules
//!
//! - [`backend`] - The analyzer interface and the reference character-class
//!   backend.
//! - [`cache`] - Bounded pool of reusable analyzers and their input readers.
//! - [`calls`] - Unary and streaming call state machines.
//! - [`pool`] - Event dispatch over the I/O and compute queues.
//! - [`service`] - Shared service environment and the gRPC handler.
//! - [`config`] - Command line and environment configuration.
//! - [`telemetry`] - Tracing-based structured logging and metrics
//!   (optional).
//!
//! These components are wired together in the server's `main.rs`.

pub mod backend;
pub mod cache;
pub mod calls;
pub mod config;
pub mod pool;
pub mod service;
pub mod telemetry;

#[cfg(test)]
pub mod testing;
