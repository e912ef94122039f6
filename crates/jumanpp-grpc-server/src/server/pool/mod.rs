//! Event dispatch loop.
//!
//! - [`event`] - Events, tags and the [`Call`] state machine trait.
//! - [`manager`] - [`Dispatcher`]: the call arena and its two queues.
//! - [`worker`] - I/O and compute worker loops.

pub mod event;
pub mod manager;
pub mod worker;

pub use event::{Call, CallId, Event, Progress, Queue, Tag, WorkRequest};
pub use manager::Dispatcher;
