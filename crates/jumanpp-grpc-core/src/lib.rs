#![doc = include_str!("../README.md")]

mod common;
pub use common::*;
// Public re-export so downstream crates can encode/decode messages via
// `jumanpp_grpc_core::prost`
pub use prost;
